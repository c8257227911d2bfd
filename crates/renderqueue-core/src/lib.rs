//! # renderqueue-core
//!
//! Policy-light domain types and traits for a durable, priority-aware,
//! stepwise job queue and its webhook delivery subsystem.
//!
//! This crate has no I/O of its own: it defines `Job`, `Step`, `Priority`,
//! the `JobStore`/`WebhookStore` traits a persistence backend implements,
//! the handler contract a host registers per job type, and the pure retry
//! and signing math both the queue and the dispatcher depend on.
//!
//! ## Layout
//!
//! - [`job`] — `Job`, `Step`, `Priority`, `JobState`, ingestion options.
//! - [`step_state`] — typed accessors over a job's checkpoint bag.
//! - [`archive`] — dead-letter archive entries.
//! - [`stats`] — per-queue rollups.
//! - [`store`] — the `JobStore` trait a persistence backend implements.
//! - [`handler`] — the handler contract and its registry.
//! - [`retry`] — backoff math (pure, no I/O).
//! - [`error`] — the structured error taxonomy.
//! - [`webhook`] — webhook domain types and the closed event model.
//! - [`webhook_store`] — the `WebhookStore` trait.
//! - [`signing`] — HMAC request signing.
//! - [`config`] — environment-driven configuration.
//!
//! A Postgres implementation of the store traits lives in
//! `renderqueue-postgres` and `renderqueue-webhooks`; in-memory fakes for
//! tests live in `renderqueue-testing`.

pub mod archive;
pub mod config;
pub mod error;
pub mod handler;
pub mod job;
pub mod retry;
pub mod signing;
pub mod stats;
pub mod step_state;
pub mod store;
pub mod webhook;
pub mod webhook_store;

pub use archive::ArchiveEntry;
pub use config::Config;
pub use error::{Categorizable, CoreError, ErrorCategory, FailureKind, HandlerError};
pub use handler::{HandlerRegistry, JobHandler, StepContext};
pub use job::{
    EnqueueOptions, EnqueueOutcome, Job, JobFilter, JobState, Pagination, Priority, Step, StepStatus,
};
pub use retry::{compute_delay, next_delay, with_jitter, BackoffStrategy};
pub use stats::QueueStats;
pub use step_state::StepState;
pub use store::JobStore;
pub use webhook::{DeliveryState, SubscriptionStatus, WebhookDelivery, WebhookEvent, WebhookSubscription};
pub use webhook_store::WebhookStore;

// Convenience re-export so downstream crates implementing `JobHandler`
// or `JobStore` don't need their own `async-trait` dependency.
pub use async_trait::async_trait;
