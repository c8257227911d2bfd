//! Outbound delivery: claims due deliveries, signs and POSTs them, and
//! applies retry/disable policy on failure. Exponential backoff capped at
//! one hour, plus a hard attempt ceiling that disables the subscription.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use renderqueue_core::signing::{self, DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use renderqueue_core::webhook::{DeliveryEnvelope, SubscriptionStatus, WebhookDelivery, WebhookEvent};
use renderqueue_core::webhook_store::WebhookStore;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Tunables for one dispatcher loop instance.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub request_timeout: Duration,
    /// Consecutive failures (within the `failure_streak_window`) that
    /// disable a subscription automatically.
    pub disable_after_failures: i64,
    pub failure_streak_window: i64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 50,
            request_timeout: Duration::from_secs(10),
            disable_after_failures: 20,
            failure_streak_window: 20,
        }
    }
}

/// Enqueue a delivery row for every active subscription listening for
/// `event`, within the owner it belongs to.
pub async fn fan_out(store: &Arc<dyn WebhookStore>, event: &WebhookEvent) -> anyhow::Result<usize> {
    let subscriptions = store.subscriptions_for_event(event.owner_id(), event.event_name()).await?;
    let mut created = 0;
    for sub in subscriptions {
        store.create_delivery(sub.id, event.event_name(), event.payload()).await?;
        created += 1;
    }
    Ok(created)
}

/// Run the claim-sign-send loop until `shutdown` resolves.
pub async fn run(
    store: Arc<dyn WebhookStore>,
    http: reqwest::Client,
    config: DispatcherConfig,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let due = match store.claim_due_deliveries(config.batch_size).await {
            Ok(due) => due,
            Err(err) => {
                error!(error = %err, "failed to claim due deliveries");
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }
        };

        if due.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
            continue;
        }

        for delivery in due {
            if let Err(err) = deliver_one(&store, &http, &config, delivery).await {
                error!(error = %err, "delivery attempt failed unexpectedly");
            }
        }
    }
}

async fn deliver_one(
    store: &Arc<dyn WebhookStore>,
    http: &reqwest::Client,
    config: &DispatcherConfig,
    delivery: WebhookDelivery,
) -> anyhow::Result<()> {
    let Some(subscription) = store.get_subscription(delivery.subscription_id).await? else {
        warn!(delivery_id = %delivery.id, "subscription vanished for pending delivery");
        return Ok(());
    };

    let envelope = DeliveryEnvelope {
        event: delivery.event_name.clone(),
        delivered_at: Utc::now(),
        delivery_id: delivery.id,
        data: delivery.payload.clone(),
    };
    let body = serde_json::to_vec(&envelope)?;
    let signature = signing::sign_body(&subscription.signing_secret, &body);
    let timestamp = Utc::now().timestamp().to_string();

    let mut request = http
        .post(&subscription.target_url)
        .header(SIGNATURE_HEADER, signature)
        .header(TIMESTAMP_HEADER, timestamp)
        .header(EVENT_HEADER, &delivery.event_name)
        .header(DELIVERY_HEADER, delivery.id.to_string())
        .timeout(config.request_timeout)
        .body(body);
    for (name, value) in &subscription.custom_headers {
        request = request.header(name, value);
    }

    let started = Instant::now();
    let outcome = request.send().await;
    let duration_ms = started.elapsed().as_millis() as i64;

    match outcome {
        Ok(response) if response.status().is_success() => {
            store
                .record_success(delivery.id, response.status().as_u16() as i32, duration_ms)
                .await?;
            info!(delivery_id = %delivery.id, subscription_id = %subscription.id, "webhook delivered");
        }
        Ok(response) => {
            let status = response.status().as_u16() as i32;
            handle_failure(
                store,
                &subscription.id,
                delivery.id,
                delivery.attempt_count,
                subscription.max_retries,
                &format!("non-success response: {status}"),
                duration_ms,
            )
            .await?;
        }
        Err(err) => {
            handle_failure(
                store,
                &subscription.id,
                delivery.id,
                delivery.attempt_count,
                subscription.max_retries,
                &format!("transport error: {err}"),
                duration_ms,
            )
            .await?;
        }
    }

    maybe_disable_subscription(store, &subscription.id, subscription.status, config).await?;
    Ok(())
}

async fn handle_failure(
    store: &Arc<dyn WebhookStore>,
    subscription_id: &Uuid,
    delivery_id: Uuid,
    attempt_count: i32,
    max_retries: i32,
    error: &str,
    duration_ms: i64,
) -> anyhow::Result<()> {
    let next_attempt = attempt_count + 1;
    let next_attempt_at = if next_attempt < max_retries {
        let delay = renderqueue_core::retry::next_delay(
            Duration::from_secs(30),
            Duration::from_secs(3600),
            renderqueue_core::retry::BackoffStrategy::Exponential,
            next_attempt as u32,
        );
        Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default())
    } else {
        None
    };

    store.record_failure(delivery_id, error, duration_ms, next_attempt_at).await?;
    warn!(
        delivery_id = %delivery_id,
        subscription_id = %subscription_id,
        will_retry = next_attempt_at.is_some(),
        "webhook delivery failed"
    );
    Ok(())
}

async fn maybe_disable_subscription(
    store: &Arc<dyn WebhookStore>,
    subscription_id: &Uuid,
    current_status: SubscriptionStatus,
    config: &DispatcherConfig,
) -> anyhow::Result<()> {
    if current_status != SubscriptionStatus::Active {
        return Ok(());
    }
    let streak = store
        .recent_failure_streak(*subscription_id, config.failure_streak_window)
        .await?;
    if streak >= config.disable_after_failures {
        store.set_status(*subscription_id, SubscriptionStatus::Disabled).await?;
        warn!(subscription_id = %subscription_id, streak, "subscription disabled after repeated failures");
    }
    Ok(())
}
