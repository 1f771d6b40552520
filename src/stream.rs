//! Sequence-style helpers over the channel-based stat and enumerate calls.

use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

use crate::blobref::{BlobRef, SizedBlobRef};
use crate::config::Capabilities;
use crate::error::Result;
use crate::storage::{BlobEnumerator, BlobReader, BlobStatter, Storage, StreamingFetcher};

const ENUMERATE_BUFFER: usize = 64;

/// Stats `blobs`, collecting every blob the backend reports as present.
pub async fn stat_all<S: BlobStatter + ?Sized>(
    statter: &S,
    blobs: &[BlobRef],
    wait: Duration,
) -> Result<Vec<SizedBlobRef>> {
    // room for one response per requested blob, so the backend never blocks on us
    let (tx, mut rx) = mpsc::channel(blobs.len().max(1));
    statter.stat_blobs(&tx, blobs, wait).await?;
    drop(tx);

    let mut found = Vec::with_capacity(blobs.len());
    while let Some(blob) = rx.recv().await {
        found.push(blob);
    }
    Ok(found)
}

/// Runs a single enumerate call and collects its results.
pub async fn enumerate_page<E: BlobEnumerator + ?Sized>(
    enumerator: &E,
    after: Option<&BlobRef>,
    limit: usize,
    wait: Duration,
) -> Result<Vec<SizedBlobRef>> {
    let (tx, mut rx) = mpsc::channel(ENUMERATE_BUFFER);
    let collect = async {
        let mut page = Vec::new();
        while let Some(blob) = rx.recv().await {
            page.push(blob);
        }
        page
    };

    let (result, page) = tokio::join!(enumerator.enumerate_blobs(tx, after, limit, wait), collect);
    result?;
    Ok(page)
}

/// Lazily enumerates every blob in `storage`, in order.
///
/// Pages are requested with the `after` cursor, and no larger than the backend
/// says it can serve. A short page only ends the stream when the backend
/// advertises its page limit, since others may cap pages silently. Otherwise
/// enumeration runs until a page comes back empty. The stream is not
/// restartable.
pub fn enumerate_all(
    storage: &dyn Storage,
    page_size: usize,
) -> impl Stream<Item = Result<SizedBlobRef>> + '_ {
    let capabilities = Capabilities::of(storage);
    let page_size = capabilities.clamp_limit(page_size).max(1);
    let limit_is_known = capabilities.max_enumerate.is_some();

    async_stream::try_stream! {
        let mut after: Option<BlobRef> = None;
        loop {
            let page = enumerate_page(storage, after.as_ref(), page_size, Duration::ZERO).await?;
            let exhausted = page.is_empty() || (limit_is_known && page.len() < page_size);
            after = page.last().map(|blob| blob.blob_ref);

            for blob in page {
                yield blob;
            }
            if exhausted {
                break;
            }
        }
    }
}

/// Reads the whole blob into memory.
pub async fn fetch_bytes<F: StreamingFetcher + ?Sized>(
    fetcher: &F,
    blob: &BlobRef,
) -> Result<Bytes> {
    let (mut reader, size) = fetcher.fetch_streaming(blob).await?;

    let mut contents = Vec::with_capacity(size as usize);
    reader.read_to_end(&mut contents).await?;
    Ok(contents.into())
}

/// Exposes the blob as a stream of byte chunks, along with its size.
pub async fn fetch_stream<F: StreamingFetcher + ?Sized>(
    fetcher: &F,
    blob: &BlobRef,
) -> Result<(ReaderStream<BlobReader>, u64)> {
    let (reader, size) = fetcher.fetch_streaming(blob).await?;
    Ok((ReaderStream::new(reader), size))
}

#[cfg(test)]
mod tests {
    use std::pin::pin;

    use futures_util::{StreamExt, TryStreamExt};

    use super::*;
    use crate::hub::BlobHub;
    use crate::memory::MemoryStorage;
    use crate::storage::BlobReceiver;

    /// Serves at most `cap` blobs per enumerate call without advertising it.
    struct SilentlyCapped {
        inner: MemoryStorage,
        cap: usize,
    }

    #[async_trait::async_trait]
    impl StreamingFetcher for SilentlyCapped {
        async fn fetch_streaming(&self, blob: &BlobRef) -> Result<(BlobReader, u64)> {
            self.inner.fetch_streaming(blob).await
        }
    }

    #[async_trait::async_trait]
    impl BlobReceiver for SilentlyCapped {
        async fn receive_blob(
            &self,
            blob: &BlobRef,
            source: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
        ) -> Result<SizedBlobRef> {
            self.inner.receive_blob(blob, source).await
        }
    }

    #[async_trait::async_trait]
    impl BlobStatter for SilentlyCapped {
        async fn stat_blobs(
            &self,
            dest: &mpsc::Sender<SizedBlobRef>,
            blobs: &[BlobRef],
            wait: Duration,
        ) -> Result<()> {
            self.inner.stat_blobs(dest, blobs, wait).await
        }
    }

    #[async_trait::async_trait]
    impl BlobEnumerator for SilentlyCapped {
        async fn enumerate_blobs(
            &self,
            dest: mpsc::Sender<SizedBlobRef>,
            after: Option<&BlobRef>,
            limit: usize,
            wait: Duration,
        ) -> Result<()> {
            let limit = limit.min(self.cap);
            self.inner.enumerate_blobs(dest, after, limit, wait).await
        }
    }

    #[async_trait::async_trait]
    impl Storage for SilentlyCapped {
        async fn remove_blobs(&self, blobs: &[BlobRef]) -> Result<()> {
            self.inner.remove_blobs(blobs).await
        }

        fn blob_hub(&self) -> &BlobHub {
            self.inner.blob_hub()
        }
    }

    async fn store_many(storage: &MemoryStorage, n: usize) -> Vec<SizedBlobRef> {
        let mut stored = Vec::with_capacity(n);
        for i in 0..n {
            let contents = format!("blob number {i}");
            let blob_ref = BlobRef::from_contents(contents.as_bytes());
            let sized = storage
                .receive_blob(&blob_ref, &mut contents.as_bytes())
                .await
                .unwrap();
            stored.push(sized);
        }
        stored.sort();
        stored
    }

    #[tokio::test]
    async fn stat_all_skips_missing() {
        let storage = MemoryStorage::new();
        let stored = store_many(&storage, 3).await;
        let missing = BlobRef::from_contents(b"never uploaded");

        let request = [stored[0].blob_ref, missing, stored[2].blob_ref];
        let mut found = stat_all(&storage, &request, Duration::ZERO).await.unwrap();
        found.sort();

        assert_eq!(found, vec![stored[0], stored[2]]);
    }

    #[tokio::test]
    async fn enumerate_all_pages_through_everything() {
        let storage = MemoryStorage::builder().max_enumerate(7).build();
        let stored = store_many(&storage, 50).await;

        let all: Vec<_> = enumerate_all(&storage, 1000).try_collect().await.unwrap();
        assert_eq!(all, stored);

        // exactly one full page, then an empty one
        let storage = MemoryStorage::new();
        let stored = store_many(&storage, 4).await;
        let all: Vec<_> = enumerate_all(&storage, 4).try_collect().await.unwrap();
        assert_eq!(all, stored);
    }

    #[tokio::test]
    async fn enumerate_all_survives_unadvertised_page_caps() {
        let inner = MemoryStorage::new();
        let stored = store_many(&inner, 5).await;
        let storage = SilentlyCapped { inner, cap: 2 };
        assert_eq!(Capabilities::of(&storage).max_enumerate, None);

        let all: Vec<_> = enumerate_all(&storage, 10).try_collect().await.unwrap();
        assert_eq!(all, stored);
    }

    #[tokio::test]
    async fn enumerate_all_is_lazy() {
        let storage = MemoryStorage::new();
        let stored = store_many(&storage, 10).await;

        let mut blobs = pin!(enumerate_all(&storage, 3));
        let first_two: Vec<_> = blobs.as_mut().take(2).try_collect().await.unwrap();
        assert_eq!(first_two, stored[..2]);
    }

    #[tokio::test]
    async fn fetching() {
        let storage = MemoryStorage::new();
        let blob_ref = BlobRef::from_contents(b"hello");
        storage
            .receive_blob(&blob_ref, &mut &b"hello"[..])
            .await
            .unwrap();

        assert_eq!(fetch_bytes(&storage, &blob_ref).await.unwrap(), &b"hello"[..]);

        let (chunks, size) = fetch_stream(&storage, &blob_ref).await.unwrap();
        assert_eq!(size, 5);
        let chunks: Vec<_> = chunks.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"hello");

        let missing = BlobRef::from_contents(b"missing");
        assert!(fetch_bytes(&storage, &missing).await.unwrap_err().is_not_found());
    }
}
