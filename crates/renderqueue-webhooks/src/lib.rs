//! Outbound webhook delivery subsystem.
//!
//! Owns subscription/delivery persistence ([`PgWebhookStore`]) and the
//! dispatcher loop that signs and POSTs due deliveries, retrying with
//! capped exponential backoff and auto-disabling subscriptions after
//! `disable_after_failures` consecutive failures.
//!
//! Migrations live in `migrations/`; call [`migrate`] against a pool that
//! already has the core `jobs` schema applied (see
//! `renderqueue_postgres::pool::connect`).

pub mod dispatcher;
pub mod store;

pub use dispatcher::DispatcherConfig;
pub use store::PgWebhookStore;

use anyhow::{Context, Result};
use sqlx::PgPool;

pub async fn migrate(pool: &PgPool) -> Result<()> {
    // Shares `_sqlx_migrations` with `renderqueue_postgres::pool::connect`'s
    // migrator; ignore_missing so this migrator doesn't reject the core
    // migration's version as "applied but missing" from its own set.
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator.run(pool).await.context("failed to run webhook migrations")
}
