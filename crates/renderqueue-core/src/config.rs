//! Environment-driven configuration.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::retry::BackoffStrategy;

/// Every runtime tunable. Loaded once at startup and passed down
/// to the worker, stall sweeper, stats aggregator, and webhook dispatcher.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    pub concurrency: usize,
    pub batch_size: i64,
    pub job_timeout: Duration,
    pub stall_check_interval: Duration,
    pub poll_interval: Duration,
    pub backoff_strategy: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: i32,

    pub delivery_timeout: Duration,
    pub delivery_max_retries: i32,
    pub disable_after_failures: i64,

    pub stats_refresh_interval: Duration,

    pub pool_min_connections: u32,
    pub pool_max_connections: u32,
    pub pool_acquire_timeout: Duration,
    pub pool_idle_timeout: Duration,
    /// Callers waiting to claim a batch beyond this many in flight fail
    /// fast with `CoreError::ResourceExhausted` instead of queuing.
    pub pool_wait_queue_ceiling: usize,
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// `.env` in development via `dotenvy::dotenv()`.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            database_url: env_var("DATABASE_URL").context("DATABASE_URL must be set")?,

            concurrency: env_parse("CONCURRENCY", 8)?,
            batch_size: env_parse("BATCH_SIZE", 10)?,
            job_timeout: env_duration_ms("JOB_TIMEOUT_MS", 60_000)?,
            stall_check_interval: env_duration_ms("STALL_CHECK_MS", 30_000)?,
            poll_interval: env_duration_ms("POLL_INTERVAL_MS", 1_000)?,
            backoff_strategy: env_backoff_strategy("BACKOFF_STRATEGY", BackoffStrategy::Exponential)?,
            base_delay: env_duration_ms("BASE_DELAY_MS", 1_000)?,
            max_delay: env_duration_ms("MAX_DELAY_MS", 3_600_000)?,
            max_attempts: env_parse("MAX_ATTEMPTS", 5)?,

            delivery_timeout: env_duration_ms("DELIVERY_TIMEOUT_MS", 10_000)?,
            delivery_max_retries: env_parse("DELIVERY_MAX_RETRIES", 5)?,
            disable_after_failures: env_parse("DISABLE_AFTER_FAILURES", 20)?,

            stats_refresh_interval: env_duration_ms("STATS_REFRESH_MS", 60_000)?,

            pool_min_connections: env_parse("POOL_MIN_CONNECTIONS", 1)?,
            pool_max_connections: env_parse("POOL_MAX_CONNECTIONS", 10)?,
            pool_acquire_timeout: env_duration_ms("POOL_ACQUIRE_TIMEOUT_MS", 5_000)?,
            pool_idle_timeout: env_duration_ms("POOL_IDLE_TIMEOUT_MS", 600_000)?,
            pool_wait_queue_ceiling: env_parse("POOL_WAIT_QUEUE_CEILING", 100)?,
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("{key} must be set"))
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} must be a valid value: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_duration_ms(key: &str, default_ms: u64) -> Result<Duration> {
    env_parse(key, default_ms).map(Duration::from_millis)
}

fn env_backoff_strategy(key: &str, default: BackoffStrategy) -> Result<BackoffStrategy> {
    match std::env::var(key) {
        Ok(raw) => match raw.as_str() {
            "fixed" => Ok(BackoffStrategy::Fixed),
            "linear" => Ok(BackoffStrategy::Linear),
            "exponential" => Ok(BackoffStrategy::Exponential),
            other => Err(anyhow::anyhow!("unknown backoff strategy: {other}")),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_to_default_when_unset() {
        std::env::remove_var("RENDERQUEUE_TEST_UNSET_KEY");
        let value: i64 = env_parse("RENDERQUEUE_TEST_UNSET_KEY", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn env_parse_rejects_invalid_values() {
        std::env::set_var("RENDERQUEUE_TEST_BAD_INT", "not-a-number");
        let result: Result<i64> = env_parse("RENDERQUEUE_TEST_BAD_INT", 1);
        assert!(result.is_err());
        std::env::remove_var("RENDERQUEUE_TEST_BAD_INT");
    }

    #[test]
    fn env_backoff_strategy_parses_known_values() {
        std::env::set_var("RENDERQUEUE_TEST_STRATEGY", "linear");
        let strategy = env_backoff_strategy("RENDERQUEUE_TEST_STRATEGY", BackoffStrategy::Fixed).unwrap();
        assert_eq!(strategy, BackoffStrategy::Linear);
        std::env::remove_var("RENDERQUEUE_TEST_STRATEGY");
    }

    #[test]
    fn env_backoff_strategy_rejects_unknown_values() {
        std::env::set_var("RENDERQUEUE_TEST_STRATEGY_BAD", "quadratic");
        let result = env_backoff_strategy("RENDERQUEUE_TEST_STRATEGY_BAD", BackoffStrategy::Fixed);
        assert!(result.is_err());
        std::env::remove_var("RENDERQUEUE_TEST_STRATEGY_BAD");
    }
}
