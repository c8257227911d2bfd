//! An in-memory [`WebhookStore`] for testing dispatch logic without a
//! database or a real HTTP endpoint.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use renderqueue_core::job::Pagination;
use renderqueue_core::webhook::{DeliveryState, SubscriptionStatus, WebhookDelivery, WebhookSubscription};
use renderqueue_core::webhook_store::WebhookStore;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    subscriptions: HashMap<Uuid, WebhookSubscription>,
    deliveries: HashMap<Uuid, WebhookDelivery>,
}

#[derive(Clone, Default)]
pub struct InMemoryWebhookStore {
    inner: std::sync::Arc<Mutex<Inner>>,
}

impl InMemoryWebhookStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("in-memory store mutex poisoned")
    }
}

#[async_trait]
impl WebhookStore for InMemoryWebhookStore {
    async fn create_subscription(
        &self,
        owner_id: Uuid,
        target_url: String,
        events: Vec<String>,
        max_retries: i32,
        custom_headers: Vec<(String, String)>,
    ) -> Result<WebhookSubscription> {
        let now = Utc::now();
        let subscription = WebhookSubscription {
            id: Uuid::new_v4(),
            owner_id,
            target_url,
            events,
            status: SubscriptionStatus::Active,
            signing_secret: format!("test-secret-{}", Uuid::new_v4()),
            custom_headers,
            max_retries,
            success_count: 0,
            failure_count: 0,
            last_triggered_at: None,
            last_success_at: None,
            last_failure_at: None,
            created_at: now,
            updated_at: now,
        };
        self.lock().subscriptions.insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    async fn get_subscription(&self, id: Uuid) -> Result<Option<WebhookSubscription>> {
        Ok(self.lock().subscriptions.get(&id).cloned())
    }

    async fn subscriptions_for_event(&self, owner_id: Uuid, event: &str) -> Result<Vec<WebhookSubscription>> {
        Ok(self
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.owner_id == owner_id && s.subscribes_to(event))
            .cloned()
            .collect())
    }

    async fn regenerate_secret(&self, id: Uuid) -> Result<String> {
        let mut inner = self.lock();
        let sub = inner.subscriptions.get_mut(&id).context("subscription not found")?;
        sub.signing_secret = format!("test-secret-{}", Uuid::new_v4());
        sub.updated_at = Utc::now();
        Ok(sub.signing_secret.clone())
    }

    async fn set_status(&self, id: Uuid, status: SubscriptionStatus) -> Result<()> {
        let mut inner = self.lock();
        let sub = inner.subscriptions.get_mut(&id).context("subscription not found")?;
        sub.status = status;
        sub.updated_at = Utc::now();
        Ok(())
    }

    async fn create_delivery(
        &self,
        subscription_id: Uuid,
        event_name: &str,
        payload: serde_json::Value,
    ) -> Result<WebhookDelivery> {
        let now = Utc::now();
        let delivery = WebhookDelivery {
            id: Uuid::new_v4(),
            subscription_id,
            event_name: event_name.to_string(),
            payload,
            state: DeliveryState::Pending,
            attempt_count: 0,
            response_status: None,
            error: None,
            duration_ms: None,
            next_attempt_at: Some(now),
            created_at: now,
            completed_at: None,
        };
        self.lock().deliveries.insert(delivery.id, delivery.clone());
        Ok(delivery)
    }

    async fn record_success(&self, delivery_id: Uuid, response_status: i32, duration_ms: i64) -> Result<()> {
        let mut inner = self.lock();
        let subscription_id = {
            let delivery = inner.deliveries.get_mut(&delivery_id).context("delivery not found")?;
            delivery.state = DeliveryState::Delivered;
            delivery.attempt_count += 1;
            delivery.response_status = Some(response_status);
            delivery.duration_ms = Some(duration_ms);
            delivery.completed_at = Some(Utc::now());
            delivery.subscription_id
        };
        if let Some(sub) = inner.subscriptions.get_mut(&subscription_id) {
            sub.success_count += 1;
            sub.last_triggered_at = Some(Utc::now());
            sub.last_success_at = Some(Utc::now());
            sub.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        delivery_id: Uuid,
        error: &str,
        duration_ms: i64,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let subscription_id = {
            let delivery = inner.deliveries.get_mut(&delivery_id).context("delivery not found")?;
            delivery.attempt_count += 1;
            delivery.error = Some(error.to_string());
            delivery.duration_ms = Some(duration_ms);
            if let Some(next) = next_attempt_at {
                delivery.state = DeliveryState::Retrying;
                delivery.next_attempt_at = Some(next);
            } else {
                delivery.state = DeliveryState::Failed;
                delivery.completed_at = Some(Utc::now());
            }
            delivery.subscription_id
        };
        if let Some(sub) = inner.subscriptions.get_mut(&subscription_id) {
            sub.failure_count += 1;
            sub.last_triggered_at = Some(Utc::now());
            sub.last_failure_at = Some(Utc::now());
            sub.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn claim_due_deliveries(&self, limit: i64) -> Result<Vec<WebhookDelivery>> {
        let mut inner = self.lock();
        let now = Utc::now();
        let mut ids: Vec<Uuid> = inner
            .deliveries
            .values()
            .filter(|d| matches!(d.state, DeliveryState::Pending | DeliveryState::Retrying))
            .filter(|d| d.next_attempt_at.map_or(false, |t| t <= now))
            .map(|d| d.id)
            .collect();
        ids.sort_by_key(|id| inner.deliveries[id].next_attempt_at);
        ids.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let delivery = inner.deliveries.get_mut(&id).expect("id just selected from map");
            delivery.next_attempt_at = Some(now + chrono::Duration::seconds(30));
            claimed.push(delivery.clone());
        }
        Ok(claimed)
    }

    async fn list_deliveries(&self, subscription_id: Uuid, page: Pagination) -> Result<Vec<WebhookDelivery>> {
        let inner = self.lock();
        let mut deliveries: Vec<WebhookDelivery> = inner
            .deliveries
            .values()
            .filter(|d| d.subscription_id == subscription_id)
            .cloned()
            .collect();
        deliveries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let start = (page.offset.max(0) as usize).min(deliveries.len());
        let end = (start + page.limit.max(0) as usize).min(deliveries.len());
        Ok(deliveries[start..end].to_vec())
    }

    async fn recent_failure_streak(&self, subscription_id: Uuid, window: i64) -> Result<i64> {
        let inner = self.lock();
        let mut deliveries: Vec<&WebhookDelivery> = inner
            .deliveries
            .values()
            .filter(|d| d.subscription_id == subscription_id)
            .filter(|d| matches!(d.state, DeliveryState::Delivered | DeliveryState::Failed))
            .collect();
        deliveries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        deliveries.truncate(window.max(0) as usize);

        let mut streak = 0i64;
        for d in deliveries {
            if d.state == DeliveryState::Failed {
                streak += 1;
            } else {
                break;
            }
        }
        Ok(streak)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriptions_for_event_filters_by_owner_and_event() {
        let store = InMemoryWebhookStore::new();
        let owner = Uuid::new_v4();
        let sub = store
            .create_subscription(owner, "https://example.com/hook".into(), vec!["video.completed".into()], 5, vec![])
            .await
            .unwrap();

        let matches = store.subscriptions_for_event(owner, "video.completed").await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, sub.id);

        let none = store.subscriptions_for_event(owner, "video.failed").await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn record_failure_then_success_updates_streak() {
        let store = InMemoryWebhookStore::new();
        let owner = Uuid::new_v4();
        let sub = store
            .create_subscription(owner, "https://example.com/hook".into(), vec!["video.completed".into()], 5, vec![])
            .await
            .unwrap();

        for _ in 0..3 {
            let delivery = store.create_delivery(sub.id, "video.completed", serde_json::json!({})).await.unwrap();
            store.record_failure(delivery.id, "timeout", 10, None).await.unwrap();
        }
        assert_eq!(store.recent_failure_streak(sub.id, 10).await.unwrap(), 3);

        let delivery = store.create_delivery(sub.id, "video.completed", serde_json::json!({})).await.unwrap();
        store.record_success(delivery.id, 200, 10).await.unwrap();
        assert_eq!(store.recent_failure_streak(sub.id, 10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn claim_due_deliveries_only_returns_due_pending_or_retrying() {
        let store = InMemoryWebhookStore::new();
        let owner = Uuid::new_v4();
        let sub = store
            .create_subscription(owner, "https://example.com/hook".into(), vec!["video.completed".into()], 5, vec![])
            .await
            .unwrap();
        store.create_delivery(sub.id, "video.completed", serde_json::json!({})).await.unwrap();

        let due = store.claim_due_deliveries(10).await.unwrap();
        assert_eq!(due.len(), 1);
        let due_again = store.claim_due_deliveries(10).await.unwrap();
        assert!(due_again.is_empty(), "claimed delivery should not be immediately due again");
    }
}
