//! Error types shared by every storage backend.

use thiserror::Error;

use crate::blobref::BlobRef;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur in blob storage operations
#[derive(Debug, Error)]
pub enum Error {
    /// The received contents hash to something other than the claimed identity.
    /// The blob was not stored.
    #[error("corrupt blob; digest doesn't match (expected {expected}, got {actual})")]
    CorruptBlob { expected: BlobRef, actual: BlobRef },

    #[error("blob not found: {0}")]
    NotFound(BlobRef),

    #[error("invalid blob ref: {0:?}")]
    InvalidBlobRef(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Opaque failure reported by a concrete backend.
    #[error("backend error: {0}")]
    Backend(String),

    /// At least one blob existed but could not be deleted. Other removals in the
    /// same call may have succeeded.
    #[error("failed to remove {} blob(s), first error: {source}", failed.len())]
    PartialRemoval {
        failed: Vec<BlobRef>,
        source: Box<Error>,
    },

    #[error("enumerate called with both `after` and a non-zero wait")]
    EnumerateAfterWithWait,

    #[error("destination channel was closed by the receiver")]
    DestinationClosed,

    #[error("blob exceeds the maximum size of {limit} bytes")]
    BlobTooLarge { limit: u64 },

    #[error("invalid queue name: {0:?}")]
    InvalidQueueName(String),

    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),
}

impl Error {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn partial_removal_message() {
        let err = Error::PartialRemoval {
            failed: vec![BlobRef::from_contents(b"a"), BlobRef::from_contents(b"b")],
            source: Box::new(Error::backend("disk on fire")),
        };
        let message = err.to_string();
        assert!(message.contains("2 blob(s)"));
        assert!(message.contains("disk on fire"));
    }
}
