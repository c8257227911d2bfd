//! Convenience builders for scenario tests.

use renderqueue_core::job::{EnqueueOptions, Priority};

/// A minimal render job enqueue request, ready to have fields overridden.
pub fn render_job(queue: impl Into<String>) -> EnqueueOptions {
    EnqueueOptions::new(queue, "video.render", serde_json::json!({"video_id": "fixture"}))
}

/// Same as [`render_job`] but pre-populated with a priority, for ordering
/// tests.
pub fn render_job_with_priority(queue: impl Into<String>, priority: Priority) -> EnqueueOptions {
    let mut options = render_job(queue);
    options.priority = priority;
    options
}
