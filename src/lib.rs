//! A uniform contract for content-addressed blob storage backends.
//!
//! Backends implement [`Storage`]; callers receive, stat, enumerate, fetch and
//! remove blobs through it, keyed by [`BlobRef`], and follow new arrivals on the
//! backend's [`BlobHub`]. [`MemoryStorage`] is a complete in-process backend.

pub mod blobref;
pub mod config;
pub mod error;
pub mod hub;
pub mod memory;
pub mod storage;
pub mod stream;

pub use blobref::{BlobHasher, BlobRef, HashAlgorithm, SizedBlobRef};
pub use config::{Capabilities, Config};
pub use error::{Error, Result};
pub use hub::{BlobHub, BlobSubscription};
pub use memory::MemoryStorage;
pub use storage::{
    maybe_wrap_context, stat_blob, BlobEnumerator, BlobReader, BlobReceiver, BlobStatter,
    Configer, ContextWrapper, MaxEnumerateConfig, QueueCreator, RequestContext, Storage,
    StreamingFetcher,
};
