//! Per-queue rollup, refreshed periodically by the stats aggregator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Derived, may lag the live state of the store by up to the aggregator's
/// refresh interval. Consumers accept that staleness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue: String,
    pub pending: i64,
    pub scheduled: i64,
    pub processing: i64,
    pub completed: i64,
    pub dead_letter: i64,
    pub cancelled: i64,
    /// Moving average wait time (create -> claim) in milliseconds, over
    /// recently completed jobs.
    pub avg_wait_ms: f64,
    /// Moving average processing time (claim -> terminal) in milliseconds.
    pub avg_processing_ms: f64,
    pub updated_at: DateTime<Utc>,
}
