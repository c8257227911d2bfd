//! Periodic stats aggregator: recomputes `queue_stats` on an
//! interval so list/dashboard reads never hit a live aggregate query.

use std::sync::Arc;
use std::time::Duration;

use renderqueue_core::store::JobStore;
use tracing::{debug, error};

pub async fn run(
    store: Arc<dyn JobStore>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        match store.refresh_stats().await {
            Ok(rows) => debug!(queues = rows.len(), "refreshed queue stats"),
            Err(err) => error!(error = %err, "stats refresh failed"),
        }
    }
}
