//! The contract every blob storage backend implements.
//!
//! Callers treat backends through these traits only: they receive, stat,
//! enumerate, fetch and remove blobs, and subscribe to arrivals via the
//! backend's [`BlobHub`]. Optional features (queues, per-request wrapping,
//! enumeration limits, a static [`Config`]) are exposed through the `as_*`
//! accessors on [`Storage`], which default to "not supported".

use std::collections::BTreeMap;
use std::pin::Pin;
use std::slice;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use crate::blobref::{BlobRef, SizedBlobRef};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::hub::BlobHub;

pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait::async_trait]
pub trait StreamingFetcher: Send + Sync {
    /// Opens `blob` for reading, returning the reader and the blob size.
    async fn fetch_streaming(&self, blob: &BlobRef) -> Result<(BlobReader, u64)>;
}

#[async_trait::async_trait]
pub trait BlobReceiver: Send + Sync {
    /// Accepts a newly uploaded blob, verifying `source` hashes to `blob` before
    /// it is persisted. Fails with [`Error::CorruptBlob`] otherwise.
    ///
    /// Receiving a blob that is already stored succeeds without storing it twice.
    async fn receive_blob(
        &self,
        blob: &BlobRef,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<SizedBlobRef>;
}

#[async_trait::async_trait]
pub trait BlobStatter: Send + Sync {
    /// Sends the size of every blob in `blobs` that exists into `dest`. Missing
    /// blobs are skipped.
    ///
    /// With a non-zero `wait`, blocks up to that long for missing blobs to show
    /// up. `dest` is borrowed and stays open.
    async fn stat_blobs(
        &self,
        dest: &mpsc::Sender<SizedBlobRef>,
        blobs: &[BlobRef],
        wait: Duration,
    ) -> Result<()>;
}

#[async_trait::async_trait]
pub trait BlobEnumerator: Send + Sync {
    /// Sends at most `limit` blobs into `dest`, sorted, all greater than `after`.
    ///
    /// `dest` is consumed and dropped when this returns, which closes the channel
    /// whether or not `limit` was hit. With a non-zero `wait` and nothing stored,
    /// blocks up to that long for a blob to arrive. `after` and `wait` are
    /// exclusive; passing both fails with [`Error::EnumerateAfterWithWait`].
    async fn enumerate_blobs(
        &self,
        dest: mpsc::Sender<SizedBlobRef>,
        after: Option<&BlobRef>,
        limit: usize,
        wait: Duration,
    ) -> Result<()>;
}

pub trait Configer: Send + Sync {
    fn config(&self) -> Config;
}

pub trait MaxEnumerateConfig: Send + Sync {
    /// The largest `limit` this backend serves in a single enumerate call.
    fn max_enumerate(&self) -> usize;
}

/// Implemented by backends where uploads can additionally be mirrored into named
/// queues. This is what replication builds on.
#[async_trait::async_trait]
pub trait QueueCreator: Send + Sync {
    /// Creates the queue `name`, or returns the existing one.
    async fn create_queue(&self, name: &str) -> Result<Arc<dyn Storage>>;
}

/// Implemented by backends that need to scope themselves to a request, such as
/// multi-tenant stores.
pub trait ContextWrapper: Send + Sync {
    fn wrap_context(&self, ctx: &RequestContext) -> Arc<dyn Storage>;
}

#[async_trait::async_trait]
pub trait Storage: StreamingFetcher + BlobReceiver + BlobStatter + BlobEnumerator {
    /// Removes zero or more blobs. Removing blobs that don't exist is not an
    /// error. Fails if any blob existed but could not be deleted, in which case
    /// some of the others may still have been removed.
    async fn remove_blobs(&self, blobs: &[BlobRef]) -> Result<()>;

    fn blob_hub(&self) -> &BlobHub;

    fn as_configer(&self) -> Option<&dyn Configer> {
        None
    }

    fn as_queue_creator(&self) -> Option<&dyn QueueCreator> {
        None
    }

    fn as_context_wrapper(&self) -> Option<&dyn ContextWrapper> {
        None
    }

    fn as_max_enumerate_config(&self) -> Option<&dyn MaxEnumerateConfig> {
        None
    }
}

pub trait StatReceiver: BlobReceiver + BlobStatter {}
impl<T: BlobReceiver + BlobStatter + ?Sized> StatReceiver for T {}

pub trait BlobReceiveConfiger: BlobReceiver + Configer {}
impl<T: BlobReceiver + Configer + ?Sized> BlobReceiveConfiger for T {}

/// The minimal set of operations expected of a blob cache.
pub trait Cache: StreamingFetcher + BlobReceiver + BlobStatter {}
impl<T: StreamingFetcher + BlobReceiver + BlobStatter + ?Sized> Cache for T {}

pub trait StorageConfiger: Storage + Configer {}
impl<T: Storage + Configer + ?Sized> StorageConfiger for T {}

pub trait StorageQueueCreator: Storage + QueueCreator {}
impl<T: Storage + QueueCreator + ?Sized> StorageQueueCreator for T {}

/// What a backend may need to know about the inbound request it serves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub tenant: Option<String>,
    // keys are lowercased
    headers: BTreeMap<String, String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Stats a single blob without waiting.
pub async fn stat_blob<S: BlobStatter + ?Sized>(
    statter: &S,
    blob: &BlobRef,
) -> Result<SizedBlobRef> {
    let (tx, mut rx) = mpsc::channel(1);
    statter
        .stat_blobs(&tx, slice::from_ref(blob), Duration::ZERO)
        .await?;
    rx.try_recv().map_err(|_| Error::NotFound(*blob))
}

/// Returns the storage to use for a request: the backend's own wrapping when it
/// supports it and there is a request, otherwise `storage` itself.
pub fn maybe_wrap_context(
    storage: &Arc<dyn Storage>,
    ctx: Option<&RequestContext>,
) -> Arc<dyn Storage> {
    let Some(ctx) = ctx else {
        return Arc::clone(storage);
    };
    match storage.as_context_wrapper() {
        Some(wrapper) => wrapper.wrap_context(ctx),
        None => Arc::clone(storage),
    }
}

/// Folds the outcome of deleting blobs one by one into the single result
/// [`Storage::remove_blobs`] returns. Blobs that were already gone don't count
/// as failures.
pub fn collect_removal_results(
    results: impl IntoIterator<Item = (BlobRef, Result<()>)>,
) -> Result<()> {
    let mut failed = vec![];
    let mut first_error = None;

    for (blob, result) in results {
        match result {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(err) => {
                tracing::warn!(blob = %blob, error = %err, "failed to remove blob");
                failed.push(blob);
                first_error.get_or_insert(err);
            }
        }
    }

    match first_error {
        None => Ok(()),
        Some(source) => Err(Error::PartialRemoval {
            failed,
            source: Box::new(source),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Capabilities;

    /// A backend holding one fixed blob, supporting none of the optional features.
    struct SingleBlob {
        blob: SizedBlobRef,
        hub: BlobHub,
    }

    impl SingleBlob {
        fn new(contents: &[u8]) -> Self {
            Self {
                blob: SizedBlobRef::new(BlobRef::from_contents(contents), contents.len() as u64),
                hub: BlobHub::default(),
            }
        }
    }

    #[async_trait::async_trait]
    impl StreamingFetcher for SingleBlob {
        async fn fetch_streaming(&self, blob: &BlobRef) -> Result<(BlobReader, u64)> {
            Err(Error::NotFound(*blob))
        }
    }

    #[async_trait::async_trait]
    impl BlobReceiver for SingleBlob {
        async fn receive_blob(
            &self,
            _blob: &BlobRef,
            _source: &mut (dyn AsyncRead + Send + Unpin),
        ) -> Result<SizedBlobRef> {
            Err(Error::Unsupported("receive"))
        }
    }

    #[async_trait::async_trait]
    impl BlobStatter for SingleBlob {
        async fn stat_blobs(
            &self,
            dest: &mpsc::Sender<SizedBlobRef>,
            blobs: &[BlobRef],
            _wait: Duration,
        ) -> Result<()> {
            for blob in blobs {
                if *blob == self.blob.blob_ref {
                    dest.send(self.blob)
                        .await
                        .map_err(|_| Error::DestinationClosed)?;
                }
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl BlobEnumerator for SingleBlob {
        async fn enumerate_blobs(
            &self,
            _dest: mpsc::Sender<SizedBlobRef>,
            _after: Option<&BlobRef>,
            _limit: usize,
            _wait: Duration,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl Storage for SingleBlob {
        async fn remove_blobs(&self, _blobs: &[BlobRef]) -> Result<()> {
            Ok(())
        }

        fn blob_hub(&self) -> &BlobHub {
            &self.hub
        }
    }

    #[tokio::test]
    async fn stat_single_blob() {
        let storage = SingleBlob::new(b"hello");

        let found = stat_blob(&storage, &storage.blob.blob_ref).await.unwrap();
        assert_eq!(found.size, 5);

        let missing = BlobRef::from_contents(b"missing");
        let err = stat_blob(&storage, &missing).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn wrap_context_is_a_noop_without_support() {
        let storage: Arc<dyn Storage> = Arc::new(SingleBlob::new(b"hello"));

        let wrapped = maybe_wrap_context(&storage, None);
        assert!(Arc::ptr_eq(&wrapped, &storage));

        let ctx = RequestContext::new().with_tenant("alice");
        let wrapped = maybe_wrap_context(&storage, Some(&ctx));
        assert!(Arc::ptr_eq(&wrapped, &storage));
    }

    #[test]
    fn default_capabilities() {
        let storage = SingleBlob::new(b"hello");
        let caps = Capabilities::of(&storage);

        assert_eq!(caps.config, Config::default());
        assert_eq!(caps.max_enumerate, None);
        assert!(!caps.can_create_queues);
        assert!(!caps.can_wrap_context);
        assert_eq!(caps.clamp_limit(50_000), 50_000);
        assert_eq!(caps.effective_wait(Duration::from_secs(3)), Duration::ZERO);
        assert!(!caps.allows_remove());
    }

    #[test]
    fn request_headers_are_case_insensitive() {
        let ctx = RequestContext::new().with_header("X-AppEngine-Token", "secret");
        assert_eq!(ctx.header("x-appengine-token"), Some("secret"));
        assert_eq!(ctx.header("Authorization"), None);
    }

    #[test]
    fn removal_results() {
        let a = BlobRef::from_contents(b"a");
        let b = BlobRef::from_contents(b"b");
        let c = BlobRef::from_contents(b"c");

        assert!(collect_removal_results(Vec::new()).is_ok());
        assert!(collect_removal_results([(a, Ok(())), (b, Err(Error::NotFound(b)))]).is_ok());

        let err = collect_removal_results([
            (a, Ok(())),
            (b, Err(Error::backend("permission denied"))),
            (c, Err(Error::backend("read-only filesystem"))),
        ])
        .unwrap_err();
        match err {
            Error::PartialRemoval { failed, source } => {
                assert_eq!(failed, vec![b, c]);
                assert_eq!(source.to_string(), "backend error: permission denied");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
