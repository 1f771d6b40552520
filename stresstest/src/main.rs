use std::sync::Arc;
use std::time::Duration;

use blobserver::{MemoryStorage, Storage};
use tracing_subscriber::EnvFilter;

use crate::stresstest::perform_stresstest;
use crate::workload::Workload;

mod stresstest;
mod workload;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let storage: Arc<dyn Storage> = Arc::new(
        MemoryStorage::builder()
            .max_blob_size(64 * 1024 * 1024)
            .build(),
    );

    let uploads = Workload::builder("uploads")
        .concurrency(32)
        .action_limit(5_000)
        .size_distribution(4 * 1024, 256 * 1024) // p50 = 4K, p99 = 256K
        .action_weights(90, 8, 2)
        .build()?;
    let churn = Workload::builder("churn")
        .concurrency(8)
        .action_limit(10_000)
        .size_distribution(1024, 64 * 1024)
        .action_weights(40, 40, 20)
        .build()?;

    perform_stresstest(storage, vec![uploads, churn], Duration::from_secs(2)).await
}
