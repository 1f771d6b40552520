use core::cmp::Ordering;
use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::Digest;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HashAlgorithm {
    Sha1 = 0,
    Blake3 = 1,
}

impl HashAlgorithm {
    /// The prefix used in the string form of a [`BlobRef`].
    pub fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Blake3 => "blake3",
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Blake3 => 32,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha1" => Some(Self::Sha1),
            "blake3" => Some(Self::Blake3),
            _ => None,
        }
    }
}

/// The content-addressable identity of a blob.
///
/// Its string form is `<algorithm>-<lowercase hex digest>`, and ordering follows
/// that string form, which is what enumeration cursors are compared against.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BlobRef {
    algorithm: HashAlgorithm,
    // SHA1 only uses the first 20 bytes, the rest stay zeroed.
    digest: [u8; 32],
}

impl BlobRef {
    pub fn from_contents(contents: &[u8]) -> Self {
        let mut hasher = BlobHasher::new(HashAlgorithm::Blake3);
        hasher.update(contents);
        hasher.finish()
    }

    pub fn from_contents_with(algorithm: HashAlgorithm, contents: &[u8]) -> Self {
        let mut hasher = BlobHasher::new(algorithm);
        hasher.update(contents);
        hasher.finish()
    }

    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidBlobRef(s.to_owned());

        let (name, hex) = s.split_once('-').ok_or_else(invalid)?;
        let algorithm = HashAlgorithm::from_name(name).ok_or_else(invalid)?;
        let len = algorithm.digest_len();
        if hex.len() != len * 2 {
            return Err(invalid());
        }

        let mut digest = [0; 32];
        base16ct::lower::decode(hex, &mut digest[..len]).map_err(|_| invalid())?;

        Ok(Self { algorithm, digest })
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest[..self.algorithm.digest_len()]
    }

    /// Creates a hasher using the same algorithm as this identity, to verify
    /// incoming contents against it.
    pub fn hasher(&self) -> BlobHasher {
        BlobHasher::new(self.algorithm)
    }
}

impl Ord for BlobRef {
    fn cmp(&self, other: &Self) -> Ordering {
        // equal-length lowercase hex sorts the same way as the raw bytes
        self.algorithm
            .name()
            .cmp(other.algorithm.name())
            .then_with(|| self.digest().cmp(other.digest()))
    }
}

impl PartialOrd for BlobRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:x}",
            self.algorithm.name(),
            base16ct::HexDisplay(self.digest())
        )
    }
}

impl fmt::Debug for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobRef({self})")
    }
}

impl FromStr for BlobRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Incrementally computes a [`BlobRef`] while contents are being streamed.
pub enum BlobHasher {
    Sha1(sha1::Sha1),
    Blake3(Box<blake3::Hasher>),
}

impl BlobHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha1 => Self::Sha1(sha1::Sha1::new()),
            HashAlgorithm::Blake3 => Self::Blake3(Box::default()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(hasher) => hasher.update(data),
            Self::Blake3(hasher) => {
                hasher.update(data);
            }
        }
    }

    pub fn finish(self) -> BlobRef {
        let mut digest = [0; 32];
        let algorithm = match self {
            Self::Sha1(hasher) => {
                digest[..20].copy_from_slice(&hasher.finalize());
                HashAlgorithm::Sha1
            }
            Self::Blake3(hasher) => {
                digest = *hasher.finalize().as_bytes();
                HashAlgorithm::Blake3
            }
        };
        BlobRef { algorithm, digest }
    }
}

/// A [`BlobRef`] paired with the byte size of the blob it names.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizedBlobRef {
    pub blob_ref: BlobRef,
    pub size: u64,
}

impl SizedBlobRef {
    pub fn new(blob_ref: BlobRef, size: u64) -> Self {
        Self { blob_ref, size }
    }
}

impl fmt::Display for SizedBlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.blob_ref, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_string_form() {
        let br = BlobRef::from_contents_with(HashAlgorithm::Sha1, b"hello");
        assert_eq!(
            br.to_string(),
            "sha1-aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
        assert_eq!(br.digest().len(), 20);
        assert_eq!(BlobRef::parse(&br.to_string()).unwrap(), br);
    }

    #[test]
    fn blake3_matches_plain_hash() {
        let br = BlobRef::from_contents(b"hello");
        assert_eq!(br.algorithm(), HashAlgorithm::Blake3);
        assert_eq!(br.digest(), blake3::hash(b"hello").as_bytes());

        let parsed: BlobRef = br.to_string().parse().unwrap();
        assert_eq!(parsed, br);
    }

    #[test]
    fn incremental_hashing() {
        let mut hasher = BlobHasher::new(HashAlgorithm::Sha1);
        hasher.update(b"hel");
        hasher.update(b"lo");
        assert_eq!(
            hasher.finish(),
            BlobRef::from_contents_with(HashAlgorithm::Sha1, b"hello")
        );
    }

    #[test]
    fn rejects_malformed() {
        for s in [
            "",
            "sha1",
            "sha1-",
            "md5-aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d",
            "sha1-aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434",
            "sha1-AAF4C61DDCC5E8A2DABEDE0F3B482CD9AEA9434D",
            "sha1-zzf4c61ddcc5e8a2dabede0f3b482cd9aea9434d",
        ] {
            assert!(
                matches!(BlobRef::parse(s), Err(Error::InvalidBlobRef(_))),
                "{s:?} should not parse"
            );
        }
    }

    #[test]
    fn ordering_follows_string_form() {
        let mut refs: Vec<_> = (0..32u8)
            .flat_map(|i| {
                [
                    BlobRef::from_contents(&[i]),
                    BlobRef::from_contents_with(HashAlgorithm::Sha1, &[i]),
                ]
            })
            .collect();
        let mut strings: Vec<_> = refs.iter().map(ToString::to_string).collect();

        refs.sort();
        strings.sort();

        let sorted: Vec<_> = refs.iter().map(ToString::to_string).collect();
        assert_eq!(sorted, strings);
    }
}
