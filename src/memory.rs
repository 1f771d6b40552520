//! An in-process [`Storage`] keeping every blob in memory.
//!
//! Supports the whole contract, including the optional features: long polling,
//! replication queues, and per-tenant isolation through [`ContextWrapper`].

use core::fmt;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::blobref::{BlobRef, SizedBlobRef};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::hub::{BlobHub, DEFAULT_HUB_CAPACITY};
use crate::storage::{
    BlobEnumerator, BlobReader, BlobReceiver, BlobStatter, Configer, ContextWrapper,
    MaxEnumerateConfig, QueueCreator, RequestContext, Storage, StreamingFetcher,
};

pub const DEFAULT_MAX_ENUMERATE: usize = 10_000;

const READ_BUF_SIZE: usize = 64 * 1024;

pub struct MemoryStorageBuilder {
    config: Config,
    max_enumerate: usize,
    max_blob_size: Option<u64>,
    hub_capacity: usize,
}

impl MemoryStorageBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn max_enumerate(mut self, max_enumerate: usize) -> Self {
        self.max_enumerate = max_enumerate.max(1);
        self
    }

    pub fn max_blob_size(mut self, max_blob_size: u64) -> Self {
        self.max_blob_size = Some(max_blob_size);
        self
    }

    pub fn hub_capacity(mut self, hub_capacity: usize) -> Self {
        self.hub_capacity = hub_capacity;
        self
    }

    pub fn build(self) -> MemoryStorage {
        MemoryStorage::from_parts(self, true)
    }
}

/// A cheaply clonable handle; clones share the same blobs, hub and queues.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    max_enumerate: usize,
    max_blob_size: Option<u64>,
    hub_capacity: usize,

    blobs: RwLock<BTreeMap<BlobRef, Bytes>>,
    hub: BlobHub,

    queues: DashMap<String, MemoryStorage>,
    /// `None` for stores that are themselves scoped to a tenant.
    tenants: Option<DashMap<String, MemoryStorage>>,
}

impl fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("config", &self.inner.config)
            .field("queues", &self.inner.queues.len())
            .field("subscribers", &self.inner.hub.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> MemoryStorageBuilder {
        MemoryStorageBuilder {
            config: Config::default().with_long_poll(true),
            max_enumerate: DEFAULT_MAX_ENUMERATE,
            max_blob_size: None,
            hub_capacity: DEFAULT_HUB_CAPACITY,
        }
    }

    fn from_parts(builder: MemoryStorageBuilder, with_tenants: bool) -> Self {
        let inner = Inner {
            config: builder.config,
            max_enumerate: builder.max_enumerate,
            max_blob_size: builder.max_blob_size,
            hub_capacity: builder.hub_capacity,

            blobs: Default::default(),
            hub: BlobHub::new(builder.hub_capacity),

            queues: Default::default(),
            tenants: with_tenants.then(DashMap::new),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// A fresh store with the same limits as this one.
    fn child(&self, config: Config) -> Self {
        let builder = MemoryStorageBuilder {
            config,
            max_enumerate: self.inner.max_enumerate,
            max_blob_size: self.inner.max_blob_size,
            hub_capacity: self.inner.hub_capacity,
        };
        Self::from_parts(builder, false)
    }

    pub async fn blob_count(&self) -> usize {
        self.inner.blobs.read().await.len()
    }

    /// The queue previously created under `name`, if any.
    pub fn queue(&self, name: &str) -> Option<MemoryStorage> {
        self.inner.queues.get(name).map(|queue| queue.value().clone())
    }

    /// Stores already verified contents and announces them on the hub.
    async fn store_verified(&self, blob: SizedBlobRef, contents: Bytes) {
        let inserted = match self.inner.blobs.write().await.entry(blob.blob_ref) {
            Entry::Vacant(entry) => {
                entry.insert(contents);
                true
            }
            Entry::Occupied(_) => false,
        };
        if inserted {
            debug!(blob = %blob.blob_ref, size = blob.size, "stored blob");
        } else {
            debug!(blob = %blob.blob_ref, "blob already stored");
        }

        self.inner.hub.notify_blob_received(blob);
    }

    async fn present(&self, blobs: impl IntoIterator<Item = &BlobRef>) -> Vec<SizedBlobRef> {
        let stored = self.inner.blobs.read().await;
        blobs
            .into_iter()
            .filter_map(|blob| {
                let contents = stored.get(blob)?;
                Some(SizedBlobRef::new(*blob, contents.len() as u64))
            })
            .collect()
    }
}

/// `wait` from now, saturating far in the future for waits too long to represent.
fn deadline_after(wait: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(wait).unwrap_or_else(|| now + Duration::from_secs(86400 * 365 * 30))
}

async fn send(dest: &mpsc::Sender<SizedBlobRef>, blob: SizedBlobRef) -> Result<()> {
    dest.send(blob).await.map_err(|_| Error::DestinationClosed)
}

#[async_trait::async_trait]
impl StreamingFetcher for MemoryStorage {
    async fn fetch_streaming(&self, blob: &BlobRef) -> Result<(BlobReader, u64)> {
        let contents = self
            .inner
            .blobs
            .read()
            .await
            .get(blob)
            .cloned()
            .ok_or(Error::NotFound(*blob))?;

        let size = contents.len() as u64;
        Ok((Box::pin(Cursor::new(contents)), size))
    }
}

#[async_trait::async_trait]
impl BlobReceiver for MemoryStorage {
    #[instrument(skip_all, fields(blob = %blob))]
    async fn receive_blob(
        &self,
        blob: &BlobRef,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<SizedBlobRef> {
        let mut hasher = blob.hasher();
        let mut contents = Vec::new();
        let mut buf = vec![0; READ_BUF_SIZE];

        loop {
            let read = source.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            if let Some(limit) = self.inner.max_blob_size {
                if (contents.len() + read) as u64 > limit {
                    return Err(Error::BlobTooLarge { limit });
                }
            }
            hasher.update(&buf[..read]);
            contents.extend_from_slice(&buf[..read]);
        }

        let actual = hasher.finish();
        if actual != *blob {
            warn!(actual = %actual, "digest mismatch, discarding upload");
            return Err(Error::CorruptBlob {
                expected: *blob,
                actual,
            });
        }

        let sized = SizedBlobRef::new(*blob, contents.len() as u64);
        let contents = Bytes::from(contents);
        self.store_verified(sized, contents.clone()).await;

        // no DashMap guards may be held across the awaits below
        let queues: Vec<_> = self
            .inner
            .queues
            .iter()
            .map(|queue| queue.value().clone())
            .collect();
        for queue in queues {
            queue.store_verified(sized, contents.clone()).await;
        }

        Ok(sized)
    }
}

#[async_trait::async_trait]
impl BlobStatter for MemoryStorage {
    async fn stat_blobs(
        &self,
        dest: &mpsc::Sender<SizedBlobRef>,
        blobs: &[BlobRef],
        wait: Duration,
    ) -> Result<()> {
        let wait = self.inner.config.effective_wait(wait);
        // subscribe before looking, so nothing arriving in between is lost
        let mut subscription = (!wait.is_zero()).then(|| self.inner.hub.subscribe());

        let found = self.present(blobs).await;
        let mut missing: HashSet<BlobRef> = blobs.iter().copied().collect();
        for blob in found {
            missing.remove(&blob.blob_ref);
            send(dest, blob).await?;
        }

        let Some(subscription) = subscription.as_mut() else {
            return Ok(());
        };

        let deadline = deadline_after(wait);
        let mut missed = subscription.missed();
        while !missing.is_empty() {
            let Ok(Some(arrived)) = tokio::time::timeout_at(deadline, subscription.recv()).await
            else {
                break;
            };

            // a lagging subscription may have skipped some arrivals
            if subscription.missed() > missed {
                missed = subscription.missed();
                let swept = self.present(&missing).await;
                for blob in swept {
                    missing.remove(&blob.blob_ref);
                    send(dest, blob).await?;
                }
            }
            if missing.remove(&arrived.blob_ref) {
                send(dest, arrived).await?;
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl BlobEnumerator for MemoryStorage {
    #[instrument(level = "trace", skip(self, dest))]
    async fn enumerate_blobs(
        &self,
        dest: mpsc::Sender<SizedBlobRef>,
        after: Option<&BlobRef>,
        limit: usize,
        wait: Duration,
    ) -> Result<()> {
        if after.is_some() && !wait.is_zero() {
            return Err(Error::EnumerateAfterWithWait);
        }
        let limit = limit.min(self.inner.max_enumerate);
        let wait = self.inner.config.effective_wait(wait);

        if !wait.is_zero() {
            let mut subscription = self.inner.hub.subscribe();
            if self.inner.blobs.read().await.is_empty() {
                subscription.recv_timeout(wait).await;
            }
        }

        let page: Vec<_> = {
            let stored = self.inner.blobs.read().await;
            let range = match after {
                Some(after) => stored.range((Bound::Excluded(*after), Bound::Unbounded)),
                None => stored.range(..),
            };
            range
                .take(limit)
                .map(|(blob, contents)| SizedBlobRef::new(*blob, contents.len() as u64))
                .collect()
        };

        for blob in page {
            send(&dest, blob).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn remove_blobs(&self, blobs: &[BlobRef]) -> Result<()> {
        let mut stored = self.inner.blobs.write().await;
        let removed = blobs
            .iter()
            .filter(|blob| stored.remove(*blob).is_some())
            .count();
        debug!(requested = blobs.len(), removed, "removed blobs");
        Ok(())
    }

    fn blob_hub(&self) -> &BlobHub {
        &self.inner.hub
    }

    fn as_configer(&self) -> Option<&dyn Configer> {
        Some(self)
    }

    fn as_queue_creator(&self) -> Option<&dyn QueueCreator> {
        (!self.inner.config.is_queue).then_some(self as &dyn QueueCreator)
    }

    fn as_context_wrapper(&self) -> Option<&dyn ContextWrapper> {
        self.inner
            .tenants
            .as_ref()
            .map(|_| self as &dyn ContextWrapper)
    }

    fn as_max_enumerate_config(&self) -> Option<&dyn MaxEnumerateConfig> {
        Some(self)
    }
}

impl Configer for MemoryStorage {
    fn config(&self) -> Config {
        self.inner.config.clone()
    }
}

impl MaxEnumerateConfig for MemoryStorage {
    fn max_enumerate(&self) -> usize {
        self.inner.max_enumerate
    }
}

#[async_trait::async_trait]
impl QueueCreator for MemoryStorage {
    async fn create_queue(&self, name: &str) -> Result<Arc<dyn Storage>> {
        if self.inner.config.is_queue {
            return Err(Error::Unsupported("creating a queue of a queue"));
        }
        if name.is_empty() || name.contains('/') {
            return Err(Error::InvalidQueueName(name.to_owned()));
        }

        let queue = self
            .inner
            .queues
            .entry(name.to_owned())
            .or_insert_with(|| {
                debug!(queue = name, "created queue");
                let config = Config::queue().with_long_poll(self.inner.config.can_long_poll);
                self.child(config)
            })
            .value()
            .clone();

        Ok(Arc::new(queue))
    }
}

impl ContextWrapper for MemoryStorage {
    /// Scopes the store to the request's tenant.
    ///
    /// The tenant store is created and registered on first use, so wrapping
    /// is not free of side effects on this backend. Later wraps for the same
    /// tenant return a handle to that store. A request without a tenant gets
    /// a handle to this store.
    fn wrap_context(&self, ctx: &RequestContext) -> Arc<dyn Storage> {
        let (Some(tenants), Some(tenant)) = (&self.inner.tenants, &ctx.tenant) else {
            return Arc::new(self.clone());
        };

        let scoped = tenants
            .entry(tenant.clone())
            .or_insert_with(|| self.child(self.inner.config.clone()))
            .value()
            .clone();
        Arc::new(scoped)
    }
}
