//! The handler contract and the registry that looks handlers up
//! by job type.
//!
//! A job handler is looked up once per job type, by string key, and
//! registration panics on a duplicate key rather than silently shadowing
//! the earlier handler. Step payloads stay opaque to the core.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::HandlerError;
use crate::job::Job;
use crate::step_state::StepState;

/// Mutable view into a job's step-state bag during handler execution.
///
/// Handlers read and write through this instead of touching the store
/// directly, so the core can decide when checkpoint writes are flushed
/// (immediately, item 3: "persist immediately").
pub struct StepContext<'a> {
    pub step: &'a str,
    pub attempt: i32,
    state: StepState,
}

impl<'a> StepContext<'a> {
    pub fn new(step: &'a str, attempt: i32, state: StepState) -> Self {
        Self {
            step,
            attempt,
            state,
        }
    }

    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.state.get(key)
    }

    pub fn set<T: serde::Serialize>(&mut self, key: impl Into<String>, value: T) {
        self.state.set(key, value);
    }

    pub fn delete(&mut self, key: &str) {
        self.state.delete(key);
    }

    pub fn into_state(self) -> StepState {
        self.state
    }
}

/// The contract a host registers, one implementation per job type.
///
/// Implementations MUST be safe to re-invoke after a crash before the step
/// is marked complete: a well-written handler writes a sentinel
/// as its first store-visible effect and checks for it on entry.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute one step of a job. Returning `Ok` marks the step complete
    /// with the returned opaque output (if any); returning `Err` fails the
    /// step and routes the job through the retry policy.
    async fn handle(
        &self,
        job: &Job,
        ctx: &mut StepContext<'_>,
    ) -> Result<Option<serde_json::Value>, HandlerError>;
}

/// Registry mapping job type strings to their handler.
///
/// Mirrors `CommandRegistry`: a plain `HashMap`, duplicate registration is a
/// programmer error and panics at startup rather than being silently
/// overwritten.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `job_type`.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered for this job type.
    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let job_type = job_type.into();
        if self.handlers.contains_key(&job_type) {
            panic!("handler already registered for job type: {job_type}");
        }
        self.handlers.insert(job_type, handler);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn has(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registered_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        async fn handle(
            &self,
            _job: &Job,
            _ctx: &mut StepContext<'_>,
        ) -> Result<Option<serde_json::Value>, HandlerError> {
            Ok(Some(serde_json::json!({"ok": true})))
        }
    }

    fn sample_job() -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            queue: "render".into(),
            job_type: "video.render".into(),
            payload: serde_json::json!({}),
            tags: vec![],
            priority: crate::job::Priority::Normal,
            idempotency_key: None,
            state: crate::job::JobState::Processing,
            steps: vec![crate::job::Step::pending("execute")],
            step_state: serde_json::json!({}),
            attempt: 1,
            max_attempts: 5,
            last_error: None,
            worker_lease: Some("worker-1".into()),
            scheduled_at: now,
            started_at: Some(now),
            completed_at: None,
            timeout_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = HandlerRegistry::new();
        registry.register("video.render", Arc::new(EchoHandler));
        assert!(registry.has("video.render"));
        assert!(registry.get("video.render").is_some());
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_registration_panics() {
        let mut registry = HandlerRegistry::new();
        registry.register("video.render", Arc::new(EchoHandler));
        registry.register("video.render", Arc::new(EchoHandler));
    }

    #[tokio::test]
    async fn handler_can_checkpoint_through_context() {
        let handler = EchoHandler;
        let job = sample_job();
        let mut ctx = StepContext::new("execute", 1, StepState::default());
        ctx.set("checkpoint", "started");
        let result = handler.handle(&job, &mut ctx).await;
        assert!(result.is_ok());
        assert_eq!(ctx.get::<String>("checkpoint"), Some("started".to_string()));
    }
}
