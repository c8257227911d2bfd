//! The worker loop: polls for claimable jobs and runs them with bounded
//! concurrency.
//!
//! A `tokio::sync::Semaphore` bounds in-flight steps per worker process
//! (`Config::concurrency`) rather than per claim batch.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use renderqueue_core::handler::HandlerRegistry;
use renderqueue_core::store::JobStore;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::executor::{self, ExecutorPolicy};

/// Tunables for one worker loop instance.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub concurrency: usize,
    pub batch_size: i64,
    pub poll_interval: Duration,
    pub lease: Duration,
    pub policy: ExecutorPolicy,
}

/// Run the claim-execute loop until `shutdown` resolves.
///
/// On entry, reclaims any jobs this `worker_id` was holding before a
/// previous crash, then repeatedly claims up to `batch_size` ready jobs and
/// runs each one on a semaphore-bounded task, sleeping `poll_interval`
/// whenever a claim comes back empty.
pub async fn run(
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let reclaimed = executor::reclaim_on_startup(&store, &config.worker_id).await?;
    if !reclaimed.is_empty() {
        warn!(worker_id = %config.worker_id, count = reclaimed.len(), "reclaimed jobs held before restart");
    }

    let semaphore = Arc::new(Semaphore::new(config.concurrency));

    loop {
        if *shutdown.borrow() {
            break;
        }

        let jobs = store
            .claim_ready(&config.worker_id, config.batch_size, config.lease)
            .await?;

        if jobs.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
            continue;
        }

        debug!(worker_id = %config.worker_id, claimed = jobs.len(), "claimed jobs");

        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let permit = semaphore.clone().acquire_owned().await?;
            let store = store.clone();
            let registry = registry.clone();
            let policy = config.policy;
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let job_id = job.id;
                let job_type = job.job_type.clone();
                if let Err(err) = executor::run_step(&store, &registry, policy, &job).await {
                    error!(%job_id, %job_type, error = %err, "step execution failed unexpectedly");
                }
            }));
        }

        for result in join_all(handles).await {
            result?;
        }
    }

    info!(worker_id = %config.worker_id, "worker loop stopped");
    Ok(())
}
