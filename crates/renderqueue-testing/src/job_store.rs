//! An in-memory [`JobStore`] for exercising handlers, executors, and worker
//! loops without a database.
//!
//! Mirrors the semantics `renderqueue-postgres::PgJobStore` implements
//! against real tables (priority claim order, idempotency dedup, stall
//! sweep, dead-letter archiving) over a `Mutex<HashMap>` instead of SQL.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use renderqueue_core::archive::ArchiveEntry;
use renderqueue_core::error::FailureKind;
use renderqueue_core::job::{
    EnqueueOptions, EnqueueOutcome, Job, JobFilter, JobState, Pagination, Step, StepStatus,
};
use renderqueue_core::stats::QueueStats;
use renderqueue_core::store::JobStore;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    archive: HashMap<Uuid, ArchiveEntry>,
    stats: HashMap<String, QueueStats>,
}

/// Thread-safe, clonable in-memory job store.
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    inner: std::sync::Arc<Mutex<Inner>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("in-memory store mutex poisoned")
    }

    fn archive_and_dead_letter(inner: &mut Inner, job_id: Uuid, error: &str) {
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            let entry = ArchiveEntry {
                id: Uuid::new_v4(),
                job_id: job.id,
                queue: job.queue.clone(),
                job_type: job.job_type.clone(),
                payload: job.payload.clone(),
                tags: job.tags.clone(),
                final_error: error.to_string(),
                attempt: job.attempt,
                step_names: job.steps.iter().map(|s| s.name.clone()).collect(),
                step_state: job.step_state.clone(),
                moved_at: Utc::now(),
            };
            job.state = JobState::DeadLetter;
            job.last_error = Some(error.to_string());
            job.completed_at = Some(Utc::now());
            job.worker_lease = None;
            job.timeout_at = None;
            job.updated_at = Utc::now();
            inner.archive.insert(entry.id, entry);
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, options: EnqueueOptions) -> Result<EnqueueOutcome> {
        let mut inner = self.lock();

        if let Some(key) = &options.idempotency_key {
            if let Some(existing) = inner.jobs.values().find(|j| {
                j.idempotency_key.as_deref() == Some(key.as_str()) && !j.state.is_terminal()
            }) {
                return Ok(EnqueueOutcome {
                    job_id: existing.id,
                    deduplicated: true,
                });
            }
        }

        let now = Utc::now();
        let scheduled_at = options.run_at.unwrap_or(now);
        let state = if scheduled_at > now { JobState::Scheduled } else { JobState::Pending };
        let job = Job {
            id: Uuid::new_v4(),
            queue: options.queue,
            job_type: options.job_type,
            payload: options.payload,
            tags: options.tags,
            priority: options.priority,
            idempotency_key: options.idempotency_key,
            state,
            steps: options.steps.iter().map(Step::pending).collect(),
            step_state: serde_json::json!({}),
            attempt: 1,
            max_attempts: options.max_attempts,
            last_error: None,
            worker_lease: None,
            scheduled_at,
            started_at: None,
            completed_at: None,
            timeout_at: None,
            created_at: now,
            updated_at: now,
        };
        let job_id = job.id;
        inner.jobs.insert(job_id, job);
        Ok(EnqueueOutcome {
            job_id,
            deduplicated: false,
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn list(&self, filter: JobFilter, page: Pagination) -> Result<Vec<Job>> {
        let inner = self.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| filter.queue.as_deref().map_or(true, |q| q == j.queue))
            .filter(|j| filter.job_type.as_deref().map_or(true, |t| t == j.job_type))
            .filter(|j| filter.tag.as_deref().map_or(true, |tag| j.tags.iter().any(|t| t == tag)))
            .filter(|j| filter.state.map_or(true, |s| s == j.state))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let start = (page.offset.max(0) as usize).min(jobs.len());
        let end = (start + page.limit.max(0) as usize).min(jobs.len());
        Ok(jobs[start..end].to_vec())
    }

    async fn cancel(&self, id: Uuid) -> Result<bool> {
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.get_mut(&id) {
            if matches!(job.state, JobState::Pending | JobState::Scheduled) {
                job.state = JobState::Cancelled;
                job.completed_at = Some(Utc::now());
                job.updated_at = Utc::now();
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn claim_ready(&self, worker_id: &str, limit: i64, lease: Duration) -> Result<Vec<Job>> {
        let mut inner = self.lock();
        let now = Utc::now();

        let mut candidates: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| matches!(j.state, JobState::Pending | JobState::Scheduled) && j.scheduled_at <= now)
            .map(|j| j.id)
            .collect();
        candidates.sort_by(|a, b| {
            let ja = &inner.jobs[a];
            let jb = &inner.jobs[b];
            ja.priority
                .cmp(&jb.priority)
                .then(ja.scheduled_at.cmp(&jb.scheduled_at))
                .then(ja.id.cmp(&jb.id))
        });
        candidates.truncate(limit.max(0) as usize);

        let timeout_at = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(60));
        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let job = inner.jobs.get_mut(&id).expect("candidate id just selected from map");
            job.state = JobState::Processing;
            job.worker_lease = Some(worker_id.to_string());
            job.started_at.get_or_insert(now);
            job.timeout_at = Some(timeout_at);
            job.updated_at = now;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn start_step(&self, job_id: Uuid, step_index: usize) -> Result<()> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&job_id).context("job not found")?;
        let step = job.steps.get_mut(step_index).context("step index out of range")?;
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn save_step_state(&self, job_id: Uuid, step_state: serde_json::Value) -> Result<()> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&job_id).context("job not found")?;
        job.step_state = step_state;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn complete_step(
        &self,
        job_id: Uuid,
        step_index: usize,
        output: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&job_id).context("job not found")?;
        let step = job.steps.get_mut(step_index).context("step index out of range")?;
        step.status = StepStatus::Completed;
        step.completed_at = Some(Utc::now());
        step.output = output;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn fail_step(
        &self,
        job_id: Uuid,
        step_index: usize,
        error: &str,
        kind: FailureKind,
        retry_delay: Duration,
    ) -> Result<()> {
        let mut inner = self.lock();
        let exhausted = {
            let job = inner.jobs.get_mut(&job_id).context("job not found")?;
            let step = job.steps.get_mut(step_index).context("step index out of range")?;
            step.status = StepStatus::Failed;
            step.error = Some(error.to_string());
            step.completed_at = Some(Utc::now());
            job.last_error = Some(error.to_string());
            job.updated_at = Utc::now();
            job.attempt >= job.max_attempts
        };

        if kind == FailureKind::NonRetryable || exhausted {
            Self::archive_and_dead_letter(&mut inner, job_id, error);
        } else {
            let job = inner.jobs.get_mut(&job_id).context("job not found")?;
            job.state = JobState::Pending;
            job.attempt += 1;
            job.scheduled_at = Utc::now() + chrono::Duration::from_std(retry_delay).unwrap_or_default();
            job.worker_lease = None;
            job.timeout_at = None;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn complete_job(&self, job_id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&job_id).context("job not found")?;
        job.state = JobState::Completed;
        job.completed_at = Some(Utc::now());
        job.worker_lease = None;
        job.timeout_at = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn heartbeat(&self, job_id: Uuid, extend: Duration) -> Result<()> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&job_id).context("job not found")?;
        if job.state == JobState::Processing {
            job.timeout_at = Some(Utc::now() + chrono::Duration::from_std(extend).unwrap_or_default());
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn sweep_stalled(&self) -> Result<Vec<Uuid>> {
        let mut inner = self.lock();
        let now = Utc::now();
        let stalled: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| j.state == JobState::Processing && j.timeout_at.map_or(false, |t| t < now))
            .map(|j| j.id)
            .collect();

        for id in &stalled {
            let (exhausted,) = {
                let job = &inner.jobs[id];
                (job.attempt >= job.max_attempts,)
            };
            if exhausted {
                Self::archive_and_dead_letter(&mut inner, *id, "lease expired: worker stalled");
            } else {
                let job = inner.jobs.get_mut(id).expect("stalled id just selected from map");
                job.state = JobState::Pending;
                job.attempt += 1;
                job.worker_lease = None;
                job.timeout_at = None;
                job.last_error = Some("lease expired: worker stalled".to_string());
                job.updated_at = now;
            }
        }
        Ok(stalled)
    }

    async fn reclaim_worker(&self, worker_id: &str) -> Result<Vec<Uuid>> {
        let mut inner = self.lock();
        let ids: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| j.state == JobState::Processing && j.worker_lease.as_deref() == Some(worker_id))
            .map(|j| j.id)
            .collect();
        for id in &ids {
            let job = inner.jobs.get_mut(id).expect("id just selected from map");
            job.state = JobState::Pending;
            job.worker_lease = None;
            job.timeout_at = None;
            job.last_error = Some("worker restarted while holding lease".to_string());
            job.updated_at = Utc::now();
        }
        Ok(ids)
    }

    async fn list_dead_letter(&self, page: Pagination) -> Result<Vec<ArchiveEntry>> {
        let inner = self.lock();
        let mut entries: Vec<ArchiveEntry> = inner.archive.values().cloned().collect();
        entries.sort_by(|a, b| b.moved_at.cmp(&a.moved_at));
        let start = (page.offset.max(0) as usize).min(entries.len());
        let end = (start + page.limit.max(0) as usize).min(entries.len());
        Ok(entries[start..end].to_vec())
    }

    async fn replay_dead_letter(&self, archive_id: Uuid) -> Result<Uuid> {
        let mut inner = self.lock();
        let entry = inner.archive.remove(&archive_id).context("archive entry not found")?;
        let now = Utc::now();
        let step_names = if entry.step_names.is_empty() {
            vec!["execute".to_string()]
        } else {
            entry.step_names
        };
        let job = Job {
            id: Uuid::new_v4(),
            queue: entry.queue,
            job_type: entry.job_type,
            payload: entry.payload,
            tags: entry.tags,
            priority: Default::default(),
            idempotency_key: None,
            state: JobState::Pending,
            steps: step_names.iter().map(Step::pending).collect(),
            step_state: serde_json::json!({}),
            attempt: 1,
            max_attempts: 5,
            last_error: None,
            worker_lease: None,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            timeout_at: None,
            created_at: now,
            updated_at: now,
        };
        let new_id = job.id;
        inner.jobs.insert(new_id, job);
        Ok(new_id)
    }

    async fn refresh_stats(&self) -> Result<Vec<QueueStats>> {
        let mut inner = self.lock();
        let mut per_queue: HashMap<String, QueueStats> = HashMap::new();
        for job in inner.jobs.values() {
            let stats = per_queue.entry(job.queue.clone()).or_insert_with(|| QueueStats {
                queue: job.queue.clone(),
                pending: 0,
                scheduled: 0,
                processing: 0,
                completed: 0,
                dead_letter: 0,
                cancelled: 0,
                avg_wait_ms: 0.0,
                avg_processing_ms: 0.0,
                updated_at: Utc::now(),
            });
            match job.state {
                JobState::Pending => stats.pending += 1,
                JobState::Scheduled => stats.scheduled += 1,
                JobState::Processing => stats.processing += 1,
                JobState::Completed => stats.completed += 1,
                JobState::DeadLetter => stats.dead_letter += 1,
                JobState::Cancelled => stats.cancelled += 1,
                JobState::Failed => {}
            }
        }
        let values: Vec<QueueStats> = per_queue.into_values().collect();
        inner.stats = values.iter().cloned().map(|s| (s.queue.clone(), s)).collect();
        Ok(values)
    }

    async fn get_stats(&self, queue: &str) -> Result<Option<QueueStats>> {
        Ok(self.lock().stats.get(queue).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderqueue_core::job::Priority;

    fn options(job_type: &str) -> EnqueueOptions {
        EnqueueOptions::new("render", job_type, serde_json::json!({}))
    }

    #[tokio::test]
    async fn enqueue_then_get_roundtrips() {
        let store = InMemoryJobStore::new();
        let outcome = store.enqueue(options("video.render")).await.unwrap();
        assert!(!outcome.deduplicated);
        let job = store.get(outcome.job_id).await.unwrap().unwrap();
        assert_eq!(job.job_type, "video.render");
        assert_eq!(job.state, JobState::Pending);
    }

    #[tokio::test]
    async fn enqueue_deduplicates_on_idempotency_key() {
        let store = InMemoryJobStore::new();
        let mut opts = options("video.render");
        opts.idempotency_key = Some("key-1".to_string());
        let first = store.enqueue(opts.clone()).await.unwrap();
        let second = store.enqueue(opts).await.unwrap();
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.job_id, second.job_id);
    }

    #[tokio::test]
    async fn claim_ready_respects_priority_order() {
        let store = InMemoryJobStore::new();
        let mut low = options("video.render");
        low.priority = Priority::Low;
        let mut urgent = options("video.render");
        urgent.priority = Priority::Urgent;
        store.enqueue(low).await.unwrap();
        let urgent_outcome = store.enqueue(urgent).await.unwrap();

        let claimed = store.claim_ready("worker-1", 1, Duration::from_secs(30)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, urgent_outcome.job_id);
    }

    #[tokio::test]
    async fn fail_step_retries_until_attempts_exhausted() {
        let store = InMemoryJobStore::new();
        let mut opts = options("video.render");
        opts.max_attempts = 2;
        let outcome = store.enqueue(opts).await.unwrap();
        store.claim_ready("worker-1", 10, Duration::from_secs(30)).await.unwrap();

        store
            .fail_step(outcome.job_id, 0, "boom", FailureKind::Retryable, Duration::from_millis(1))
            .await
            .unwrap();
        let job = store.get(outcome.job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempt, 2);

        store.claim_ready("worker-1", 10, Duration::from_secs(30)).await.unwrap();
        store
            .fail_step(outcome.job_id, 0, "boom again", FailureKind::Retryable, Duration::from_millis(1))
            .await
            .unwrap();
        let job = store.get(outcome.job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::DeadLetter);
    }

    #[tokio::test]
    async fn sweep_stalled_reclaims_expired_leases() {
        let store = InMemoryJobStore::new();
        let outcome = store.enqueue(options("video.render")).await.unwrap();
        store
            .claim_ready("worker-1", 10, Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let reclaimed = store.sweep_stalled().await.unwrap();
        assert_eq!(reclaimed, vec![outcome.job_id]);
        let job = store.get(outcome.job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempt, 2);
    }

    #[tokio::test]
    async fn replay_dead_letter_creates_fresh_job() {
        let store = InMemoryJobStore::new();
        let mut opts = options("video.render");
        opts.max_attempts = 1;
        let outcome = store.enqueue(opts).await.unwrap();
        store.claim_ready("worker-1", 10, Duration::from_secs(30)).await.unwrap();
        store
            .fail_step(outcome.job_id, 0, "fatal", FailureKind::NonRetryable, Duration::ZERO)
            .await
            .unwrap();

        let archived = store.list_dead_letter(Pagination::default()).await.unwrap();
        assert_eq!(archived.len(), 1);

        let new_id = store.replay_dead_letter(archived[0].id).await.unwrap();
        assert_ne!(new_id, outcome.job_id);
        let job = store.get(new_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert!(store.list_dead_letter(Pagination::default()).await.unwrap().is_empty());
    }
}
