//! PostgreSQL implementation of the renderqueue job store.
//!
//! This crate provides a production `JobStore` implementation (atomic
//! claiming with `FOR UPDATE SKIP LOCKED`, exponential backoff retries,
//! dead-letter archiving, worker heartbeats and stall recovery) plus the
//! background tasks a host process wires up around it: the worker loop,
//! the stall sweeper, and the stats aggregator.
//!
//! # Database schema
//!
//! Migrations live in `migrations/` and run automatically via
//! [`pool::connect`]. See `migrations/0001_init.sql` for the `jobs`,
//! `dead_letter_jobs`, `queue_stats`, and `job_metrics_history` tables.
//!
//! # Usage
//!
//! ```rust,ignore
//! use renderqueue_postgres::{pool, PgJobStore};
//!
//! let pg_pool = pool::connect(&database_url, 1, 10, acquire_timeout, idle_timeout).await?;
//! let store = PgJobStore::new(pg_pool, 100);
//! ```

pub mod executor;
pub mod pool;
pub mod stall;
pub mod stats;
pub mod store;
pub mod worker;

pub use store::PgJobStore;
pub use worker::WorkerConfig;
