//! Blob arrival notifications.
//!
//! Every backend owns one [`BlobHub`] and announces each blob it receives on it.
//! Delivery is in-memory and lossy: there is no history for late subscribers, and
//! a subscriber that falls more than the hub capacity behind loses its oldest
//! notifications. Consumers that must not miss anything reconcile by enumerating.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

use crate::blobref::SizedBlobRef;

pub const DEFAULT_HUB_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct BlobHub {
    sender: broadcast::Sender<SizedBlobRef>,
}

impl Default for BlobHub {
    fn default() -> Self {
        Self::new(DEFAULT_HUB_CAPACITY)
    }
}

impl BlobHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Registers a new subscriber. Dropping the returned subscription unregisters it.
    pub fn subscribe(&self) -> BlobSubscription {
        BlobSubscription {
            receiver: self.sender.subscribe(),
            missed: 0,
        }
    }

    /// Fans `blob` out to every current subscriber, returning how many there were.
    pub fn notify_blob_received(&self, blob: SizedBlobRef) -> usize {
        match self.sender.send(blob) {
            Ok(subscribers) => {
                tracing::trace!(blob = %blob.blob_ref, subscribers, "notified blob arrival");
                subscribers
            }
            // nobody is listening
            Err(_) => 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[derive(Debug)]
pub struct BlobSubscription {
    receiver: broadcast::Receiver<SizedBlobRef>,
    missed: u64,
}

impl BlobSubscription {
    /// Waits for the next arrival. Returns `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<SizedBlobRef> {
        loop {
            match self.receiver.recv().await {
                Ok(blob) => return Some(blob),
                Err(RecvError::Lagged(skipped)) => {
                    self.missed += skipped;
                    tracing::warn!(skipped, "hub subscriber fell behind, notifications dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<SizedBlobRef> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .ok()
            .flatten()
    }

    /// Waits until an arrival matches `wanted`, giving up at `deadline`.
    pub async fn wait_for(
        &mut self,
        mut wanted: impl FnMut(&SizedBlobRef) -> bool,
        deadline: Instant,
    ) -> Option<SizedBlobRef> {
        loop {
            match tokio::time::timeout_at(deadline, self.recv()).await {
                Ok(Some(blob)) if wanted(&blob) => return Some(blob),
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// How many notifications this subscriber lost by falling behind.
    pub fn missed(&self) -> u64 {
        self.missed
    }
}
