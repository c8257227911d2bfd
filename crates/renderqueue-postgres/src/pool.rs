//! Connection pool construction and migration runner.
//!
//! A single pool, sized by `Config::pool_max_connections`, is shared by
//! the worker, stall sweeper, and stats aggregator rather than splitting
//! reads and writes across separate pools.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::{PgPoolOptions, PgConnectOptions};
use sqlx::{ConnectOptions, PgPool};

/// Build a pool from `Config`-shaped settings and run pending migrations.
pub async fn connect(
    database_url: &str,
    min_connections: u32,
    max_connections: u32,
    acquire_timeout: Duration,
    idle_timeout: Duration,
) -> Result<PgPool> {
    let connect_options: PgConnectOptions = database_url
        .parse()
        .with_context(|| "DATABASE_URL is not a valid postgres connection string")?
        .disable_statement_logging();

    let pool = PgPoolOptions::new()
        .min_connections(min_connections)
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .idle_timeout(idle_timeout)
        .test_before_acquire(true)
        .connect_with(connect_options)
        .await
        .context("failed to connect to postgres")?;

    // `renderqueue-webhooks` migrates the same pool into the same
    // `_sqlx_migrations` table; ignore_missing keeps each migrator from
    // choking on versions the other applied but that aren't in its own set.
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator.run(&pool).await.context("failed to run migrations")?;

    Ok(pool)
}
