//! Step executor: drives a claimed job through its ordered list of steps,
//! one named step at a time, reporting each outcome back to the store.
//!
//! Claim, then run every remaining step to completion or failure — a single
//! job is executed by a single worker at a time, and steps run strictly in
//! order (spec §4.D), so the claiming worker keeps the job past each
//! individual step instead of giving it back to the claimable set between
//! steps.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use renderqueue_core::error::FailureKind;
use renderqueue_core::handler::{HandlerRegistry, StepContext};
use renderqueue_core::job::{Job, StepStatus};
use renderqueue_core::retry::{next_delay, BackoffStrategy};
use renderqueue_core::step_state::StepState;
use renderqueue_core::store::JobStore;
use uuid::Uuid;

/// Policy the executor applies between and after steps.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorPolicy {
    /// Strategy used when a step fails and the handler didn't say whether
    /// the error is retryable (defaults to retryable, the conservative
    /// choice).
    pub backoff_strategy: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// How far to extend `timeout_at` before running each step, so a
    /// multi-step job doesn't stall out mid-sequence while still holding
    /// its lease. Matches `Config::job_timeout` / `WorkerConfig::lease`.
    pub step_lease: Duration,
}

impl Default for ExecutorPolicy {
    fn default() -> Self {
        Self {
            backoff_strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
            step_lease: Duration::from_secs(60),
        }
    }
}

/// Run every remaining step of `job` through its registered handler, in
/// order, until the job completes, a step fails, or no handler is
/// registered for its type.
///
/// Returns `Ok(true)` if the job reached `completed`, `Ok(false)` if a step
/// failed (the job was routed to retry or dead-letter). A missing handler
/// for the job's type is a non-retryable failure: it dead-letters
/// immediately rather than retrying against a handler that will never show
/// up.
pub async fn run_step(
    store: &Arc<dyn JobStore>,
    registry: &HandlerRegistry,
    policy: ExecutorPolicy,
    job: &Job,
) -> Result<bool> {
    let Some(handler) = registry.get(&job.job_type) else {
        let Some(step_index) = job.next_runnable_step() else {
            store.complete_job(job.id).await?;
            return Ok(true);
        };
        store
            .fail_step(
                job.id,
                step_index,
                &format!("no handler registered for job type '{}'", job.job_type),
                FailureKind::NonRetryable,
                Duration::ZERO,
            )
            .await?;
        return Ok(false);
    };

    let mut steps = job.steps.clone();
    let mut state = StepState::from_value(job.step_state.clone());

    loop {
        let Some(step_index) = steps.iter().position(|s| s.status != StepStatus::Completed) else {
            store.complete_job(job.id).await?;
            return Ok(true);
        };
        let step_name = steps[step_index].name.clone();

        store.heartbeat(job.id, policy.step_lease).await?;
        store.start_step(job.id, step_index).await?;

        let mut ctx = StepContext::new(&step_name, job.attempt, state);

        match handler.handle(job, &mut ctx).await {
            Ok(output) => {
                state = ctx.into_state();
                store.save_step_state(job.id, state.clone().into_value()).await?;
                store.complete_step(job.id, step_index, output).await?;
                steps[step_index].status = StepStatus::Completed;

                if step_index + 1 == steps.len() {
                    store.complete_job(job.id).await?;
                    return Ok(true);
                }
            }
            Err(handler_err) => {
                state = ctx.into_state();
                store.save_step_state(job.id, state.into_value()).await?;
                let delay = next_delay(
                    policy.base_delay,
                    policy.max_delay,
                    policy.backoff_strategy,
                    job.attempt as u32,
                );
                store
                    .fail_step(job.id, step_index, &handler_err.message, handler_err.kind, delay)
                    .await?;
                return Ok(false);
            }
        }
    }
}

/// On worker startup, reclaim any jobs this worker id was still holding a
/// lease on before a prior crash.
pub async fn reclaim_on_startup(store: &Arc<dyn JobStore>, worker_id: &str) -> Result<Vec<Uuid>> {
    store.reclaim_worker(worker_id).await
}
