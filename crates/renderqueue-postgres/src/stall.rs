//! Stall recovery sweep: periodically reclaims jobs whose lease expired
//! without a heartbeat, deciding dead-letter vs. retry based on remaining
//! attempts.

use std::sync::Arc;
use std::time::Duration;

use renderqueue_core::store::JobStore;
use tracing::{error, info};

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
        match store.sweep_stalled().await {
            Ok(reclaimed) if !reclaimed.is_empty() => {
                info!(count = reclaimed.len(), "swept stalled jobs");
            }
            Ok(_) => {}
            Err(err) => error!(error = %err, "stall sweep failed"),
        }
    }
}
