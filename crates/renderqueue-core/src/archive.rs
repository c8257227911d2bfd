//! Dead-letter archive entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable record of a terminally failed job.
///
/// Created once, when a job moves to [`crate::job::JobState::DeadLetter`],
/// and never mutated afterward. Replay consumes it (see
/// `JobStore::replay_dead_letter`) and removes the row on success; the
/// original job row stays in `dead_letter` for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub id: Uuid,
    pub job_id: Uuid,
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub tags: Vec<String>,
    pub final_error: String,
    pub attempt: i32,
    /// Original step names, in order, so replay can rebuild a job the
    /// handler recognizes instead of collapsing it to a single step.
    pub step_names: Vec<String>,
    pub step_state: serde_json::Value,
    pub moved_at: DateTime<Utc>,
}
