//! `PgJobStore`: the PostgreSQL implementation of [`renderqueue_core::JobStore`].
//!
//! Claims via `FOR UPDATE SKIP LOCKED`, retries with exponential backoff,
//! reclaims stalled leases, and archives exhausted jobs to the dead-letter
//! table, all on top of the step/step-state/idempotency job model.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use renderqueue_core::archive::ArchiveEntry;
use renderqueue_core::error::{CoreError, FailureKind};
use renderqueue_core::job::{EnqueueOptions, EnqueueOutcome, Job, JobFilter, JobState, Pagination, Priority, Step};
use renderqueue_core::stats::QueueStats;
use renderqueue_core::store::JobStore;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, QueryBuilder, Row};
use tokio::sync::Semaphore;
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, queue, job_type, payload, tags, priority, idempotency_key, \
    state::text AS state, steps, step_state, attempt, max_attempts, last_error, worker_lease, \
    scheduled_at, started_at, completed_at, timeout_at, created_at, updated_at";

/// PostgreSQL-backed [`JobStore`].
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    /// Bounds how many `claim_ready` calls may be in flight at once; callers
    /// beyond the ceiling fail fast with `ResourceExhausted` rather than
    /// queuing behind the pool's own connection wait.
    claim_wait_queue: Arc<Semaphore>,
}

impl PgJobStore {
    pub fn new(pool: PgPool, wait_queue_ceiling: usize) -> Self {
        Self {
            pool,
            claim_wait_queue: Arc::new(Semaphore::new(wait_queue_ceiling)),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn job_state_str(state: JobState) -> &'static str {
    state.as_str()
}

fn parse_job_state(raw: &str) -> Result<JobState> {
    Ok(match raw {
        "scheduled" => JobState::Scheduled,
        "pending" => JobState::Pending,
        "processing" => JobState::Processing,
        "completed" => JobState::Completed,
        "failed" => JobState::Failed,
        "dead_letter" => JobState::DeadLetter,
        "cancelled" => JobState::Cancelled,
        other => anyhow::bail!("unrecognized job state in database: {other}"),
    })
}

fn row_to_job(row: PgRow) -> Result<Job> {
    let state_raw: String = row.try_get("state")?;
    let steps_json: serde_json::Value = row.try_get("steps")?;
    let priority_raw: i16 = row.try_get("priority")?;
    Ok(Job {
        id: row.try_get("id")?,
        queue: row.try_get("queue")?,
        job_type: row.try_get("job_type")?,
        payload: row.try_get("payload")?,
        tags: row.try_get("tags")?,
        priority: Priority::from_i16(priority_raw).context("unrecognized priority in database")?,
        idempotency_key: row.try_get("idempotency_key")?,
        state: parse_job_state(&state_raw)?,
        steps: serde_json::from_value(steps_json).context("malformed steps json")?,
        step_state: row.try_get("step_state")?,
        attempt: row.try_get("attempt")?,
        max_attempts: row.try_get("max_attempts")?,
        last_error: row.try_get("last_error")?,
        worker_lease: row.try_get("worker_lease")?,
        scheduled_at: row.try_get("scheduled_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        timeout_at: row.try_get("timeout_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, options: EnqueueOptions) -> Result<EnqueueOutcome> {
        loop {
            let mut tx = self.pool.begin().await?;

            if let Some(key) = &options.idempotency_key {
                let existing: Option<Uuid> = sqlx::query_scalar(
                    "SELECT id FROM jobs WHERE idempotency_key = $1 \
                     AND state NOT IN ('completed', 'dead_letter', 'cancelled')",
                )
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;

                if let Some(job_id) = existing {
                    tx.commit().await?;
                    return Ok(EnqueueOutcome {
                        job_id,
                        deduplicated: true,
                    });
                }
            }

            let steps: Vec<Step> = options.steps.iter().map(Step::pending).collect();
            let steps_json = serde_json::to_value(&steps)?;
            let now = Utc::now();
            let scheduled_at = options.run_at.unwrap_or(now);
            let state = if scheduled_at > now { JobState::Scheduled } else { JobState::Pending };

            let insert = sqlx::query(
                "INSERT INTO jobs \
                 (queue, job_type, payload, tags, priority, idempotency_key, state, steps, max_attempts, scheduled_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7::job_state, $8, $9, $10) \
                 RETURNING id",
            )
            .bind(&options.queue)
            .bind(&options.job_type)
            .bind(&options.payload)
            .bind(&options.tags)
            .bind(options.priority.as_i16())
            .bind(&options.idempotency_key)
            .bind(job_state_str(state))
            .bind(steps_json)
            .bind(options.max_attempts)
            .bind(scheduled_at)
            .fetch_one(&mut *tx)
            .await;

            match insert {
                Ok(row) => {
                    let job_id: Uuid = row.try_get("id")?;
                    tx.commit().await?;
                    return Ok(EnqueueOutcome {
                        job_id,
                        deduplicated: false,
                    });
                }
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                    // Lost the race against a concurrent enqueue with the same
                    // idempotency key. Roll back and retry the dedup lookup.
                    tx.rollback().await.ok();
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_job).transpose()
    }

    async fn list(&self, filter: JobFilter, page: Pagination) -> Result<Vec<Job>> {
        let mut qb = QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE 1 = 1"));
        if let Some(queue) = &filter.queue {
            qb.push(" AND queue = ").push_bind(queue);
        }
        if let Some(job_type) = &filter.job_type {
            qb.push(" AND job_type = ").push_bind(job_type);
        }
        if let Some(tag) = &filter.tag {
            qb.push(" AND ").push_bind(tag).push(" = ANY(tags)");
        }
        if let Some(state) = filter.state {
            qb.push(" AND state = ").push_bind(job_state_str(state)).push("::job_state");
        }
        qb.push(" ORDER BY created_at DESC LIMIT ").push_bind(page.limit);
        qb.push(" OFFSET ").push_bind(page.offset);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_job).collect()
    }

    async fn cancel(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET state = 'cancelled', completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND state IN ('pending', 'scheduled')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // `attempt` starts at 1 (column default) and is left untouched here; the
    // first claim of a job's life is attempt 1 without needing an increment.
    // Later attempts are counted by `fail_step`/`sweep_stalled` when they put
    // a job back to `pending`, not by this transition, so the column always
    // reflects "the attempt currently in flight" by the time a job is next
    // claimed.
    async fn claim_ready(&self, worker_id: &str, limit: i64, lease: Duration) -> Result<Vec<Job>> {
        let _permit = self.claim_wait_queue.clone().try_acquire_owned().map_err(|_| {
            CoreError::ResourceExhausted("claim wait queue full".to_string())
        })?;
        let timeout_at = Utc::now() + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(60));
        let query = format!(
            "WITH claimable AS ( \
                 SELECT id FROM jobs \
                 WHERE state IN ('pending', 'scheduled') AND scheduled_at <= NOW() \
                 ORDER BY priority ASC, scheduled_at ASC, id ASC \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE jobs SET \
                 state = 'processing', \
                 worker_lease = $2, \
                 started_at = COALESCE(started_at, NOW()), \
                 timeout_at = $3, \
                 updated_at = NOW() \
             WHERE id IN (SELECT id FROM claimable) \
             RETURNING {JOB_COLUMNS}"
        );
        let rows = sqlx::query(&query)
            .bind(limit)
            .bind(worker_id)
            .bind(timeout_at)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_job).collect()
    }

    async fn start_step(&self, job_id: Uuid, step_index: usize) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET \
                 steps = jsonb_set(jsonb_set(steps, ARRAY[$2::text, 'status'], '\"running\"'), \
                                    ARRAY[$2::text, 'started_at'], to_jsonb(NOW())), \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(step_index.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_step_state(&self, job_id: Uuid, step_state: serde_json::Value) -> Result<()> {
        sqlx::query("UPDATE jobs SET step_state = $1, updated_at = NOW() WHERE id = $2")
            .bind(step_state)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn complete_step(
        &self,
        job_id: Uuid,
        step_index: usize,
        output: Option<serde_json::Value>,
    ) -> Result<()> {
        let output = output.unwrap_or(serde_json::Value::Null);
        sqlx::query(
            "UPDATE jobs SET \
                 steps = jsonb_set( \
                     jsonb_set(jsonb_set(steps, ARRAY[$2::text, 'status'], '\"completed\"'), \
                               ARRAY[$2::text, 'completed_at'], to_jsonb(NOW())), \
                     ARRAY[$2::text, 'output'], $3), \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(step_index.to_string())
        .bind(output)
        .execute(&self.pool)
        .await?;
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
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT queue, job_type, payload, tags, attempt, max_attempts, steps, step_state \
             FROM jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;

        let attempt: i32 = row.try_get("attempt")?;
        let max_attempts: i32 = row.try_get("max_attempts")?;
        let exhausted = attempt >= max_attempts;

        sqlx::query(
            "UPDATE jobs SET \
                 steps = jsonb_set( \
                     jsonb_set(jsonb_set(steps, ARRAY[$2::text, 'status'], '\"failed\"'), \
                               ARRAY[$2::text, 'error'], to_jsonb($3::text)), \
                     ARRAY[$2::text, 'completed_at'], to_jsonb(NOW())), \
                 last_error = $3, \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(step_index.to_string())
        .bind(error)
        .execute(&mut *tx)
        .await?;

        if kind == FailureKind::NonRetryable || exhausted {
            archive_and_dead_letter(&mut tx, job_id, error).await?;
        } else {
            let retry_at = Utc::now() + chrono::Duration::from_std(retry_delay).unwrap_or_default();
            sqlx::query(
                "UPDATE jobs SET \
                     state = 'pending', \
                     attempt = attempt + 1, \
                     scheduled_at = $2, \
                     worker_lease = NULL, \
                     timeout_at = NULL, \
                     updated_at = NOW() \
                 WHERE id = $1",
            )
            .bind(job_id)
            .bind(retry_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn complete_job(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET state = 'completed', completed_at = NOW(), \
                 worker_lease = NULL, timeout_at = NULL, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn heartbeat(&self, job_id: Uuid, extend: Duration) -> Result<()> {
        let timeout_at = Utc::now() + chrono::Duration::from_std(extend).unwrap_or(chrono::Duration::seconds(60));
        sqlx::query(
            "UPDATE jobs SET timeout_at = $2, updated_at = NOW() \
             WHERE id = $1 AND state = 'processing'",
        )
        .bind(job_id)
        .bind(timeout_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sweep_stalled(&self) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;

        let stalled = sqlx::query(
            "SELECT id, attempt, max_attempts FROM jobs \
             WHERE state = 'processing' AND timeout_at < NOW() \
             FOR UPDATE SKIP LOCKED",
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut affected = Vec::with_capacity(stalled.len());
        for row in stalled {
            let id: Uuid = row.try_get("id")?;
            let attempt: i32 = row.try_get("attempt")?;
            let max_attempts: i32 = row.try_get("max_attempts")?;

            if attempt >= max_attempts {
                archive_and_dead_letter(&mut tx, id, "lease expired: worker stalled").await?;
            } else {
                sqlx::query(
                    "UPDATE jobs SET \
                         state = 'pending', \
                         attempt = attempt + 1, \
                         worker_lease = NULL, \
                         timeout_at = NULL, \
                         last_error = 'lease expired: worker stalled', \
                         updated_at = NOW() \
                     WHERE id = $1",
                )
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
            affected.push(id);
        }

        tx.commit().await?;
        Ok(affected)
    }

    async fn reclaim_worker(&self, worker_id: &str) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "UPDATE jobs SET \
                 state = 'pending', \
                 worker_lease = NULL, \
                 timeout_at = NULL, \
                 last_error = 'worker restarted while holding lease', \
                 updated_at = NOW() \
             WHERE state = 'processing' AND worker_lease = $1 \
             RETURNING id",
        )
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|r| r.try_get::<Uuid, _>("id").map_err(Into::into)).collect()
    }

    async fn list_dead_letter(&self, page: Pagination) -> Result<Vec<ArchiveEntry>> {
        let rows = sqlx::query(
            "SELECT id, job_id, queue, job_type, payload, tags, final_error, attempt, \
                 step_names, step_state, moved_at \
             FROM dead_letter_jobs ORDER BY moved_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ArchiveEntry {
                    id: row.try_get("id")?,
                    job_id: row.try_get("job_id")?,
                    queue: row.try_get("queue")?,
                    job_type: row.try_get("job_type")?,
                    payload: row.try_get("payload")?,
                    tags: row.try_get("tags")?,
                    final_error: row.try_get("final_error")?,
                    attempt: row.try_get("attempt")?,
                    step_names: row.try_get("step_names")?,
                    step_state: row.try_get("step_state")?,
                    moved_at: row.try_get("moved_at")?,
                })
            })
            .collect()
    }

    async fn replay_dead_letter(&self, archive_id: Uuid) -> Result<Uuid> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT queue, job_type, payload, tags, step_names FROM dead_letter_jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(archive_id)
        .fetch_optional(&mut *tx)
        .await?
        .context("dead-letter archive entry not found")?;

        let queue: String = row.try_get("queue")?;
        let job_type: String = row.try_get("job_type")?;
        let payload: serde_json::Value = row.try_get("payload")?;
        let tags: Vec<String> = row.try_get("tags")?;
        let step_names: Vec<String> = row.try_get("step_names")?;

        let step_names = if step_names.is_empty() {
            vec!["execute".to_string()]
        } else {
            step_names
        };
        let steps = serde_json::to_value(step_names.iter().map(Step::pending).collect::<Vec<_>>())?;
        let new_id: Uuid = sqlx::query_scalar(
            "INSERT INTO jobs (queue, job_type, payload, tags, state, steps) \
             VALUES ($1, $2, $3, $4, 'pending', $5) RETURNING id",
        )
        .bind(&queue)
        .bind(&job_type)
        .bind(&payload)
        .bind(&tags)
        .bind(steps)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM dead_letter_jobs WHERE id = $1")
            .bind(archive_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(new_id)
    }

    async fn refresh_stats(&self) -> Result<Vec<QueueStats>> {
        sqlx::query(
            "INSERT INTO queue_stats (queue, pending, scheduled, processing, completed, dead_letter, cancelled, \
                 avg_wait_ms, avg_processing_ms, updated_at) \
             SELECT \
                 queue, \
                 COUNT(*) FILTER (WHERE state = 'pending'), \
                 COUNT(*) FILTER (WHERE state = 'scheduled'), \
                 COUNT(*) FILTER (WHERE state = 'processing'), \
                 COUNT(*) FILTER (WHERE state = 'completed'), \
                 COUNT(*) FILTER (WHERE state = 'dead_letter'), \
                 COUNT(*) FILTER (WHERE state = 'cancelled'), \
                 COALESCE(AVG(EXTRACT(EPOCH FROM (started_at - created_at)) * 1000) \
                     FILTER (WHERE started_at IS NOT NULL), 0), \
                 COALESCE(AVG(EXTRACT(EPOCH FROM (completed_at - started_at)) * 1000) \
                     FILTER (WHERE completed_at IS NOT NULL AND started_at IS NOT NULL), 0), \
                 NOW() \
             FROM jobs \
             GROUP BY queue \
             ON CONFLICT (queue) DO UPDATE SET \
                 pending = EXCLUDED.pending, \
                 scheduled = EXCLUDED.scheduled, \
                 processing = EXCLUDED.processing, \
                 completed = EXCLUDED.completed, \
                 dead_letter = EXCLUDED.dead_letter, \
                 cancelled = EXCLUDED.cancelled, \
                 avg_wait_ms = EXCLUDED.avg_wait_ms, \
                 avg_processing_ms = EXCLUDED.avg_processing_ms, \
                 updated_at = EXCLUDED.updated_at",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "INSERT INTO job_metrics_history \
                 (queue, pending, scheduled, processing, completed, dead_letter, cancelled, \
                  avg_wait_ms, avg_processing_ms, recorded_at) \
             SELECT queue, pending, scheduled, processing, completed, dead_letter, cancelled, \
                 avg_wait_ms, avg_processing_ms, updated_at \
             FROM queue_stats",
        )
        .execute(&self.pool)
        .await?;

        let rows = sqlx::query(
            "SELECT queue, pending, scheduled, processing, completed, dead_letter, cancelled, \
                 avg_wait_ms, avg_processing_ms, updated_at FROM queue_stats",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_stats).collect()
    }

    async fn get_stats(&self, queue: &str) -> Result<Option<QueueStats>> {
        let row = sqlx::query(
            "SELECT queue, pending, scheduled, processing, completed, dead_letter, cancelled, \
                 avg_wait_ms, avg_processing_ms, updated_at FROM queue_stats WHERE queue = $1",
        )
        .bind(queue)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_stats).transpose()
    }
}

fn row_to_stats(row: PgRow) -> Result<QueueStats> {
    Ok(QueueStats {
        queue: row.try_get("queue")?,
        pending: row.try_get("pending")?,
        scheduled: row.try_get("scheduled")?,
        processing: row.try_get("processing")?,
        completed: row.try_get("completed")?,
        dead_letter: row.try_get("dead_letter")?,
        cancelled: row.try_get("cancelled")?,
        avg_wait_ms: row.try_get("avg_wait_ms")?,
        avg_processing_ms: row.try_get("avg_processing_ms")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Shared by `fail_step` (exhausted retries) and `sweep_stalled` (stalled,
/// out of attempts): archive the job's final snapshot and move it to
/// `dead_letter`. Caller holds the row lock already.
async fn archive_and_dead_letter<'c>(
    tx: &mut sqlx::Transaction<'c, sqlx::Postgres>,
    job_id: Uuid,
    error: &str,
) -> Result<()> {
    let row = sqlx::query(
        "SELECT queue, job_type, payload, tags, attempt, steps, step_state FROM jobs WHERE id = $1",
    )
    .bind(job_id)
    .fetch_one(&mut **tx)
    .await?;

    let queue: String = row.try_get("queue")?;
    let job_type: String = row.try_get("job_type")?;
    let payload: serde_json::Value = row.try_get("payload")?;
    let tags: Vec<String> = row.try_get("tags")?;
    let attempt: i32 = row.try_get("attempt")?;
    let steps_json: serde_json::Value = row.try_get("steps")?;
    let step_state: serde_json::Value = row.try_get("step_state")?;
    let step_names: Vec<String> = serde_json::from_value::<Vec<Step>>(steps_json)
        .context("malformed steps json")?
        .into_iter()
        .map(|s| s.name)
        .collect();

    sqlx::query(
        "INSERT INTO dead_letter_jobs \
             (job_id, queue, job_type, payload, tags, final_error, attempt, step_names, step_state) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(job_id)
    .bind(&queue)
    .bind(&job_type)
    .bind(&payload)
    .bind(&tags)
    .bind(error)
    .bind(attempt)
    .bind(&step_names)
    .bind(&step_state)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        "UPDATE jobs SET state = 'dead_letter', last_error = $2, completed_at = NOW(), \
             worker_lease = NULL, timeout_at = NULL, updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(job_id)
    .bind(error)
    .execute(&mut **tx)
    .await?;

    Ok(())
}
