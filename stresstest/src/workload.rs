use std::thread::available_parallelism;

use anyhow::Result;
use blobserver::BlobRef;
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::weighted::WeightedIndex;
use rand_distr::{Distribution, LogNormal, Zipf};

/// Upper bound for generated payloads, to keep the lognormal tail in check.
const MAX_PAYLOAD_SIZE: u64 = 32 * 1024 * 1024;

pub struct WorkloadBuilder {
    name: &'static str,
    concurrency: usize,
    action_limit: Option<usize>,
    seed: u64,

    p50_size: u64,
    p99_size: u64,

    write_weight: u8,
    read_weight: u8,
    delete_weight: u8,
}

impl WorkloadBuilder {
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Stop after this many actions, even if the duration has not yet elapsed.
    pub fn action_limit(mut self, action_limit: usize) -> Self {
        self.action_limit = Some(action_limit);
        self
    }

    pub fn size_distribution(mut self, p50: u64, p99: u64) -> Self {
        self.p50_size = p50;
        self.p99_size = p99;
        self
    }

    pub fn action_weights(mut self, writes: u8, reads: u8, deletes: u8) -> Self {
        self.write_weight = writes;
        self.read_weight = reads;
        self.delete_weight = deletes;
        self
    }

    pub fn build(self) -> Result<Workload> {
        let rng = SmallRng::seed_from_u64(self.seed);

        // Inspired by <https://stats.stackexchange.com/a/649432>
        let p50 = self.p50_size as f64;
        let p99 = self.p99_size as f64;
        let mu = p50.ln();
        let sigma = (p99.ln() - mu) / 2.3263;

        let size_distribution = LogNormal::new(mu, sigma)?;
        let action_distribution =
            WeightedIndex::new([self.write_weight, self.read_weight, self.delete_weight])?;

        Ok(Workload {
            name: self.name,
            concurrency: self.concurrency,
            action_limit: self.action_limit,
            p50_size: self.p50_size,
            p99_size: self.p99_size,

            rng,
            size_distribution,
            action_distribution,

            existing_blobs: Default::default(),
        })
    }
}

pub struct Workload {
    pub name: &'static str,
    pub concurrency: usize,
    pub action_limit: Option<usize>,
    pub p50_size: u64,
    pub p99_size: u64,

    /// The RNG driving all our distributions.
    rng: SmallRng,
    /// A distribution that generates payload sizes for the `write` action.
    size_distribution: LogNormal<f64>,
    /// A distribution that generates actions, such as write/read/delete.
    action_distribution: WeightedIndex<u8>,

    /// All the received blobs that we can then read back or delete.
    existing_blobs: Vec<(Seed, BlobRef)>,
}

impl Workload {
    pub fn builder(name: &'static str) -> WorkloadBuilder {
        WorkloadBuilder {
            name,
            concurrency: available_parallelism().map(|n| n.get()).unwrap_or(4),
            action_limit: None,
            seed: rand::random(),

            p50_size: 16 * 1024,
            p99_size: 1024 * 1024,

            write_weight: 33,
            read_weight: 33,
            delete_weight: 33,
        }
    }

    fn get_payload(&self, seed: Seed) -> Payload {
        let mut rng = SmallRng::seed_from_u64(seed.0);
        let len = (self.size_distribution.sample(&mut rng) as u64).min(MAX_PAYLOAD_SIZE);

        Payload { len, rng }
    }

    fn sample_readback(&mut self) -> Option<(Seed, BlobRef)> {
        if self.existing_blobs.is_empty() {
            return None;
        }
        let len = self.existing_blobs.len();
        let zipf = Zipf::new(len as f64, 2.0).ok()?;
        let idx = len.saturating_sub(self.rng.sample(zipf) as usize);

        Some(self.existing_blobs.swap_remove(idx))
    }

    pub fn next_action(&mut self) -> Action {
        loop {
            match self.action_distribution.sample(&mut self.rng) {
                0 => {
                    let seed = Seed(self.rng.next_u64());
                    let payload = self.get_payload(seed);
                    return Action::Write(seed, payload);
                }
                1 => {
                    let Some((seed, blob_ref)) = self.sample_readback() else {
                        continue;
                    };
                    let payload = self.get_payload(seed);
                    return Action::Read(seed, blob_ref, payload);
                }
                _ => {
                    let Some((_seed, blob_ref)) = self.sample_readback() else {
                        continue;
                    };
                    return Action::Delete(blob_ref);
                }
            }
        }
    }

    /// Adds a blob to the internal store, so it can be yielded for reads or deletes.
    ///
    /// This function has to be called for blobs when a write or read has completed.
    /// (Blobs currently being read will not be concurrently deleted)
    pub fn push_blob(&mut self, seed: Seed, blob_ref: BlobRef) {
        self.existing_blobs.push((seed, blob_ref))
    }
}

/// The seed a payload is generated from, so it can be regenerated for readback.
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub struct Seed(u64);

pub enum Action {
    Write(Seed, Payload),
    Read(Seed, BlobRef, Payload),
    Delete(BlobRef),
}

pub struct Payload {
    pub len: u64,
    rng: SmallRng,
}

impl Payload {
    pub fn into_contents(mut self) -> Vec<u8> {
        let mut contents = vec![0; self.len as usize];
        self.rng.fill_bytes(&mut contents);
        contents
    }
}
