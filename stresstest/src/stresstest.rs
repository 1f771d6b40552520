use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use blobserver::stream::{enumerate_all, fetch_bytes};
use blobserver::{stat_blob, BlobRef, Storage};
use bytesize::ByteSize;
use futures::TryStreamExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::{Mutex, Semaphore};

use crate::workload::{Action, Workload};

const REPLICA_QUEUE: &str = "stresstest-replica";
const ENUMERATE_PAGE: usize = 1000;

pub async fn perform_stresstest(
    storage: Arc<dyn Storage>,
    workloads: Vec<Workload>,
    duration: Duration,
) -> Result<()> {
    let queue_creator = storage
        .as_queue_creator()
        .context("stress test needs a backend that can create queues")?;
    let replica = queue_creator.create_queue(REPLICA_QUEUE).await?;

    // follow arrivals the way an indexer would
    let notified = Arc::new(AtomicU64::new(0));
    let missed = Arc::new(AtomicU64::new(0));
    let mut subscription = storage.blob_hub().subscribe();
    let listener = {
        let notified = Arc::clone(&notified);
        let missed = Arc::clone(&missed);
        tokio::spawn(async move {
            while subscription.recv().await.is_some() {
                notified.fetch_add(1, Ordering::Relaxed);
                missed.store(subscription.missed(), Ordering::Relaxed);
            }
        })
    };

    let failures = Arc::new(AtomicU64::new(0));

    // run the workloads concurrently
    let tasks: Vec<_> = workloads
        .into_iter()
        .map(|workload| {
            let storage = Arc::clone(&storage);
            let failures = Arc::clone(&failures);
            tokio::spawn(async move {
                let concurrency = workload.concurrency;
                let action_limit = workload.action_limit.unwrap_or(usize::MAX);
                let mut actions = 0;
                let semaphore = Arc::new(Semaphore::new(concurrency));
                let deadline = tokio::time::Instant::now() + duration;

                let workload = Arc::new(Mutex::new(workload));

                let task_durations = Arc::new(Mutex::new(DDSketch::default()));

                // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
                let sleep = tokio::time::sleep_until(deadline);
                tokio::pin!(sleep);

                while actions < action_limit {
                    tokio::select! {
                        permit = semaphore.clone().acquire_owned() => {
                            let Ok(permit) = permit else { break };
                            let workload = Arc::clone(&workload);
                            let storage = Arc::clone(&storage);
                            let failures = Arc::clone(&failures);
                            let task_durations = Arc::clone(&task_durations);
                            let task_start = Instant::now();
                            actions += 1;

                            let task = async move {
                                let action = workload.lock().await.next_action();
                                let result = run_action(storage.as_ref(), &workload, action).await;
                                if let Err(err) = result {
                                    tracing::error!(error = ?err, "action failed");
                                    failures.fetch_add(1, Ordering::Relaxed);
                                }

                                let elapsed = task_start.elapsed().as_secs_f64();
                                task_durations.lock().await.add(elapsed);

                                // release shared state before the permit, so it can be unwrapped
                                drop(workload);
                                drop(task_durations);
                                drop(permit);
                            };
                            tokio::spawn(task);
                        }
                        _ = &mut sleep => {
                            break;
                        }
                    }
                }

                // acquiring *all* the permits waits for every outstanding task
                let _permits = semaphore.acquire_many(concurrency as u32).await;

                let task_durations = std::mem::take(&mut *task_durations.lock().await);
                let workload = Arc::try_unwrap(workload)
                    .map_err(|_| anyhow::anyhow!("workload still shared after shutdown"))?
                    .into_inner();
                anyhow::Ok((workload, task_durations))
            })
        })
        .collect();

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (workload, task_durations) = task??;
        report(i, &workload, &task_durations, duration);
    }

    listener.abort();
    println!(
        "# Hub: {} notifications, {} missed",
        notified.load(Ordering::Relaxed),
        missed.load(Ordering::Relaxed)
    );

    reconcile(storage.as_ref(), replica.as_ref()).await?;

    let failures = failures.load(Ordering::Relaxed);
    if failures > 0 {
        bail!("{failures} actions failed");
    }
    Ok(())
}

async fn run_action(
    storage: &dyn Storage,
    workload: &Mutex<Workload>,
    action: Action,
) -> Result<()> {
    match action {
        Action::Write(seed, payload) => {
            let contents = payload.into_contents();
            let blob_ref = BlobRef::from_contents(&contents);
            let received = storage
                .receive_blob(&blob_ref, &mut contents.as_slice())
                .await?;
            if received.size != contents.len() as u64 {
                bail!("{blob_ref} was received with the wrong size {}", received.size);
            }
            workload.lock().await.push_blob(seed, blob_ref);
        }
        Action::Read(seed, blob_ref, payload) => {
            let stat = stat_blob(storage, &blob_ref).await?;
            let expected = payload.into_contents();
            if stat.size != expected.len() as u64 {
                bail!("{blob_ref} stat reported {} bytes", stat.size);
            }

            let contents = fetch_bytes(storage, &blob_ref).await?;
            if contents != expected {
                bail!("readback mismatch for {blob_ref}");
            }
            workload.lock().await.push_blob(seed, blob_ref);
        }
        Action::Delete(blob_ref) => {
            storage.remove_blobs(&[blob_ref]).await?;
        }
    }
    Ok(())
}

fn report(i: usize, workload: &Workload, task_durations: &DDSketch, duration: Duration) {
    let concurrency = workload.concurrency;
    let ops = task_durations.count();
    let ops_ps = ops as f32 / duration.as_secs_f32();
    println!("# Workload {i}: {} (concurrency: {concurrency})", workload.name);
    println!(
        "  blob sizes {}-{}",
        ByteSize::b(workload.p50_size),
        ByteSize::b(workload.p99_size)
    );
    println!("=> {ops} operations, {ops_ps:.2} ops/s");
    if ops == 0 {
        return;
    }

    let quantile = |q| {
        let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
        Duration::from_secs_f64(secs)
    };
    let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
    let p50 = quantile(0.5);
    let p90 = quantile(0.9);
    let p99 = quantile(0.99);
    println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
}

/// Every blob still in the parent must have made it into the replica queue.
async fn reconcile(parent: &dyn Storage, replica: &dyn Storage) -> Result<()> {
    let replicated: BTreeSet<BlobRef> = enumerate_all(replica, ENUMERATE_PAGE)
        .map_ok(|blob| blob.blob_ref)
        .try_collect()
        .await?;
    let stored: Vec<BlobRef> = enumerate_all(parent, ENUMERATE_PAGE)
        .map_ok(|blob| blob.blob_ref)
        .try_collect()
        .await?;

    let missing = stored
        .iter()
        .filter(|blob| !replicated.contains(blob))
        .count();
    println!(
        "# Replica: {} blobs queued, parent holds {}, {missing} missing",
        replicated.len(),
        stored.len()
    );
    if missing > 0 {
        bail!("{missing} blobs were never mirrored into the replica queue");
    }
    Ok(())
}
