//! The durable store interface.
//!
//! `renderqueue-core` owns interfaces only; a separate crate owns the
//! Postgres implementation. Policy (poll cadence, concurrency, backoff
//! constants) lives in the worker, not here.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::archive::ArchiveEntry;
use crate::job::{EnqueueOptions, EnqueueOutcome, Job, JobFilter, Pagination};
use crate::stats::QueueStats;

/// Trait for claiming and mutating jobs in a persistent store.
///
/// # Implementer notes
///
/// - Use `FOR UPDATE SKIP LOCKED` (PostgreSQL) or equivalent for atomic
///   claiming; the claim step must be a single conditional compound update.
/// - All mutating methods bump `updated_at`.
/// - `enqueue` must resolve idempotency-key collisions to the existing job
///   id rather than erroring.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Ingest a new job, or resolve to an existing one sharing the same
    /// idempotency key while that job is still active.
    async fn enqueue(&self, options: EnqueueOptions) -> Result<EnqueueOutcome>;

    /// Fetch a single job by id.
    async fn get(&self, id: Uuid) -> Result<Option<Job>>;

    /// List jobs matching a filter, paginated.
    async fn list(&self, filter: JobFilter, page: Pagination) -> Result<Vec<Job>>;

    /// Cancel a job. Only valid while the job is `pending` or `scheduled`;
    /// returns `false` (not an error) if the job is in any other state or
    /// does not exist.
    async fn cancel(&self, id: Uuid) -> Result<bool>;

    /// Claim up to `limit` runnable jobs for `worker_id`, in priority order,
    /// stamping a lease that expires after `lease`. Single atomic operation:
    /// no other caller can observe or claim the same row mid-claim.
    async fn claim_ready(&self, worker_id: &str, limit: i64, lease: Duration) -> Result<Vec<Job>>;

    /// Mark the step at `step_index` as `running`, recording `started_at`.
    async fn start_step(&self, job_id: Uuid, step_index: usize) -> Result<()>;

    /// Persist the full step-state bag for a job (called after a handler
    /// checkpoints through [`crate::handler::StepContext`]).
    async fn save_step_state(&self, job_id: Uuid, step_state: serde_json::Value) -> Result<()>;

    /// Mark the step at `step_index` as `completed` with optional output.
    async fn complete_step(
        &self,
        job_id: Uuid,
        step_index: usize,
        output: Option<serde_json::Value>,
    ) -> Result<()>;

    /// Mark the step at `step_index` as `failed` with an error message, and
    /// route the job to retry (pending, with backoff) or dead-letter
    /// depending on `kind` and remaining attempts.
    async fn fail_step(
        &self,
        job_id: Uuid,
        step_index: usize,
        error: &str,
        kind: crate::error::FailureKind,
        retry_delay: Duration,
    ) -> Result<()>;

    /// Mark a job `completed` once every step has succeeded.
    async fn complete_job(&self, job_id: Uuid) -> Result<()>;

    /// Extend a job's lease. Workers call this periodically for
    /// long-running steps to avoid being reclaimed by the stall sweep.
    async fn heartbeat(&self, job_id: Uuid, extend: Duration) -> Result<()>;

    /// Sweep `processing` jobs whose lease has expired, returning the ids
    /// that were reclaimed or dead-lettered.
    async fn sweep_stalled(&self) -> Result<Vec<Uuid>>;

    /// On worker startup, immediately reclaim jobs this worker id held
    /// before a crash, without waiting for `timeout_at`.
    async fn reclaim_worker(&self, worker_id: &str) -> Result<Vec<Uuid>>;

    /// List dead-letter archive entries, most recently moved first.
    async fn list_dead_letter(&self, page: Pagination) -> Result<Vec<ArchiveEntry>>;

    /// Replay an archived job: create a fresh job (new id, attempt 0) from
    /// the archived payload, and delete the archive row. The original
    /// `dead_letter` job row is untouched.
    async fn replay_dead_letter(&self, archive_id: Uuid) -> Result<Uuid>;

    /// Recompute and upsert per-queue rollups.
    async fn refresh_stats(&self) -> Result<Vec<QueueStats>>;

    /// Fetch the last-computed rollup for one queue.
    async fn get_stats(&self, queue: &str) -> Result<Option<QueueStats>>;
}
