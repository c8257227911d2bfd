//! Job, Step, and related domain types.
//!
//! These are plain data: no I/O, no database handles. [`crate::store::JobStore`]
//! is the only thing that knows how to persist them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scheduling priority. Lower variants are claimed first.
///
/// Total order: `Urgent < High < Normal < Low`, matching the derived
/// discriminants so `ORDER BY priority` on the stored `i16` sorts the same
/// way as `Ord` does here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Priority {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(Priority::Urgent),
            1 => Some(Priority::High),
            2 => Some(Priority::Normal),
            3 => Some(Priority::Low),
            _ => None,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Lifecycle state of a job. `Failed` is a transient label used only while
/// retry handling is deciding the next state; it is never observed at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Pending,
    Processing,
    Completed,
    Failed,
    DeadLetter,
    Cancelled,
}

impl JobState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::DeadLetter | JobState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::DeadLetter => "dead_letter",
            JobState::Cancelled => "cancelled",
        }
    }
}

/// Status of a single step within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// A single named sub-unit of a job's work. Steps run strictly in index
/// order; a step whose status is `Completed` is never re-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub output: Option<serde_json::Value>,
}

impl Step {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            output: None,
        }
    }
}

/// The unit of scheduling.
///
/// Lifecycle invariants (valid state transitions, attempt bookkeeping,
/// idempotency-key uniqueness) are enforced by [`crate::store::JobStore`]
/// implementations, not by this struct itself, which is a plain snapshot
/// handed to handlers and callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub tags: Vec<String>,
    pub priority: Priority,
    pub idempotency_key: Option<String>,
    pub state: JobState,
    pub steps: Vec<Step>,
    /// Checkpoint bag: mapping from string key to opaque value, owned by the
    /// handler. See [`crate::step_state::StepState`] for the typed accessor.
    pub step_state: serde_json::Value,
    pub attempt: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub worker_lease: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Index of the first step that is not yet `Completed`, or `None` if
    /// every step has completed.
    pub fn next_runnable_step(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.status != StepStatus::Completed)
    }

    /// Wait time: created -> started. `None` until the job is claimed.
    pub fn wait_time(&self) -> Option<chrono::Duration> {
        self.started_at.map(|started| started - self.created_at)
    }

    /// Processing time: started -> completed. `None` until the job reaches
    /// a terminal state.
    pub fn processing_time(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }

    /// Total time: created -> completed.
    pub fn total_time(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|completed| completed - self.created_at)
    }

    /// Retry count is attempts beyond the first.
    pub fn retry_count(&self) -> i32 {
        (self.attempt - 1).max(0)
    }
}

/// Options accepted on ingestion. `steps` defaults to a single `execute`
/// step when omitted.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub tags: Vec<String>,
    pub priority: Priority,
    pub idempotency_key: Option<String>,
    pub steps: Vec<String>,
    /// Earliest runnable instant. `None` means "now" (job goes straight to
    /// `pending`); `Some` in the future puts the job in `scheduled`.
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: i32,
}

impl EnqueueOptions {
    pub fn new(queue: impl Into<String>, job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            queue: queue.into(),
            job_type: job_type.into(),
            payload,
            tags: Vec::new(),
            priority: Priority::default(),
            idempotency_key: None,
            steps: vec!["execute".to_string()],
            run_at: None,
            max_attempts: 5,
        }
    }
}

/// Result of an ingestion call. When `deduplicated` is true, `job_id` points
/// at the pre-existing job for that idempotency key rather than a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub job_id: Uuid,
    pub deduplicated: bool,
}

/// Filter for listing jobs (operator endpoint, §6).
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub queue: Option<String>,
    pub job_type: Option<String>,
    pub tag: Option<String>,
    pub state: Option<JobState>,
}

/// Offset/limit pagination for list queries.
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_urgent_first() {
        let mut priorities = vec![Priority::Low, Priority::Normal, Priority::Urgent, Priority::High];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![Priority::Urgent, Priority::High, Priority::Normal, Priority::Low]
        );
    }

    #[test]
    fn priority_roundtrips_through_i16() {
        for p in [Priority::Urgent, Priority::High, Priority::Normal, Priority::Low] {
            assert_eq!(Priority::from_i16(p.as_i16()), Some(p));
        }
        assert_eq!(Priority::from_i16(99), None);
    }

    #[test]
    fn terminal_states_are_exactly_three() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::DeadLetter.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Processing.is_terminal());
        assert!(!JobState::Scheduled.is_terminal());
        assert!(!JobState::Failed.is_terminal());
    }

    #[test]
    fn next_runnable_step_skips_completed() {
        let mut job = sample_job();
        job.steps = vec![
            Step {
                status: StepStatus::Completed,
                ..Step::pending("fetch")
            },
            Step::pending("render"),
            Step::pending("upload"),
        ];
        assert_eq!(job.next_runnable_step(), Some(1));
    }

    #[test]
    fn next_runnable_step_none_when_all_complete() {
        let mut job = sample_job();
        job.steps = vec![Step {
            status: StepStatus::Completed,
            ..Step::pending("execute")
        }];
        assert_eq!(job.next_runnable_step(), None);
    }

    #[test]
    fn retry_count_is_zero_on_first_attempt() {
        let mut job = sample_job();
        job.attempt = 1;
        assert_eq!(job.retry_count(), 0);
        job.attempt = 3;
        assert_eq!(job.retry_count(), 2);
    }

    fn sample_job() -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            queue: "render".into(),
            job_type: "video.render".into(),
            payload: serde_json::json!({}),
            tags: vec![],
            priority: Priority::Normal,
            idempotency_key: None,
            state: JobState::Pending,
            steps: vec![Step::pending("execute")],
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
        }
    }
}
