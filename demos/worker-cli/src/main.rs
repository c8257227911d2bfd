//! Reference worker process: wires a `JobHandler`, a `JobStore`, and a
//! `WebhookStore` into the worker loop, stall sweeper, stats aggregator,
//! and webhook dispatcher as concurrent tasks. Sets up `tracing_subscriber`
//! with an `EnvFilter`, loads `Config::from_env()`, and shares one
//! connection pool across all of the above.

mod render_handler;

use std::sync::Arc;

use anyhow::Result;
use renderqueue_core::handler::HandlerRegistry;
use renderqueue_core::store::JobStore;
use renderqueue_core::webhook_store::WebhookStore;
use renderqueue_core::Config;
use renderqueue_postgres::worker::WorkerConfig;
use renderqueue_postgres::{executor, stall, stats, PgJobStore};
use renderqueue_webhooks::{dispatcher, PgWebhookStore};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,renderqueue_postgres=debug,sqlx=warn".into()))
        .with(fmt::layer())
        .init();

    let config = Config::from_env()?;

    let pool = renderqueue_postgres::pool::connect(
        &config.database_url,
        config.pool_min_connections,
        config.pool_max_connections,
        config.pool_acquire_timeout,
        config.pool_idle_timeout,
    )
    .await?;
    renderqueue_webhooks::migrate(&pool).await?;

    let job_store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool.clone(), config.pool_wait_queue_ceiling));
    let webhook_store: Arc<dyn WebhookStore> = Arc::new(PgWebhookStore::new(pool));

    let mut registry = HandlerRegistry::new();
    registry.register("video.render", Arc::new(render_handler::VideoRenderHandler));
    let registry = Arc::new(registry);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let worker_id = format!("worker-{}", uuid::Uuid::new_v4());
    let worker_config = WorkerConfig {
        worker_id,
        concurrency: config.concurrency,
        batch_size: config.batch_size,
        poll_interval: config.poll_interval,
        lease: config.job_timeout,
        policy: executor::ExecutorPolicy {
            backoff_strategy: config.backoff_strategy,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            step_lease: config.job_timeout,
        },
    };

    let worker_task = tokio::spawn(renderqueue_postgres::worker::run(
        job_store.clone(),
        registry,
        worker_config,
        shutdown_rx.clone(),
    ));
    let stall_task = tokio::spawn(stall::run(job_store.clone(), config.stall_check_interval, shutdown_rx.clone()));
    let stats_task = tokio::spawn(stats::run(job_store.clone(), config.stats_refresh_interval, shutdown_rx.clone()));

    let dispatcher_config = dispatcher::DispatcherConfig {
        poll_interval: config.poll_interval,
        batch_size: config.batch_size,
        request_timeout: config.delivery_timeout,
        disable_after_failures: config.disable_after_failures,
        failure_streak_window: config.disable_after_failures,
    };
    let http_client = reqwest::Client::builder().timeout(config.delivery_timeout).build()?;
    let dispatcher_task = tokio::spawn(dispatcher::run(webhook_store, http_client, dispatcher_config, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining in-flight work");
    shutdown_tx.send(true).ok();

    let _ = worker_task.await?;
    stall_task.await?;
    stats_task.await?;
    dispatcher_task.await?;

    Ok(())
}
