//! Durable store interface for webhook subscriptions and deliveries
//!.

use chrono::{DateTime, Utc};
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::job::Pagination;
use crate::webhook::{SubscriptionStatus, WebhookDelivery, WebhookSubscription};

/// Everything the dispatcher and the operator-facing CRUD surface need from
/// persistence, kept separate from [`crate::store::JobStore`] because
/// subscriptions/deliveries have their own ownership and lifecycle (spec
/// §3: "Subscriptions are owned by their user; deliveries are owned by the
/// dispatcher").
#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn create_subscription(
        &self,
        owner_id: Uuid,
        target_url: String,
        events: Vec<String>,
        max_retries: i32,
        custom_headers: Vec<(String, String)>,
    ) -> Result<WebhookSubscription>;

    async fn get_subscription(&self, id: Uuid) -> Result<Option<WebhookSubscription>>;

    /// All active subscriptions owned by `owner_id` that list `event` among
    /// their subscribed events.
    async fn subscriptions_for_event(&self, owner_id: Uuid, event: &str) -> Result<Vec<WebhookSubscription>>;

    /// Atomically replace the signing secret; prior signatures become
    /// invalid as of this call.
    async fn regenerate_secret(&self, id: Uuid) -> Result<String>;

    async fn set_status(&self, id: Uuid, status: SubscriptionStatus) -> Result<()>;

    /// Create a `pending` delivery row for one attempt sequence.
    async fn create_delivery(
        &self,
        subscription_id: Uuid,
        event_name: &str,
        payload: serde_json::Value,
    ) -> Result<WebhookDelivery>;

    /// Record a successful HTTP attempt; transitions the delivery to
    /// `delivered` and bumps the subscription's success counters.
    async fn record_success(&self, delivery_id: Uuid, response_status: i32, duration_ms: i64) -> Result<()>;

    /// Record a failed attempt. `next_attempt_at` is `Some` while retries
    /// remain (delivery -> `retrying`), `None` once the ceiling is reached
    /// (delivery -> `failed`). Either way the owning subscription's failure
    /// counters are bumped.
    async fn record_failure(
        &self,
        delivery_id: Uuid,
        error: &str,
        duration_ms: i64,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Deliveries in `pending` or `retrying` whose `next_attempt_at` has
    /// passed, claimed for a dispatcher sweep.
    async fn claim_due_deliveries(&self, limit: i64) -> Result<Vec<WebhookDelivery>>;

    async fn list_deliveries(&self, subscription_id: Uuid, page: Pagination) -> Result<Vec<WebhookDelivery>>;

    /// How many of the most recent deliveries for this subscription were
    /// failures, counting back from the latest until a non-failure is hit
    /// or `window` is reached. Used to decide the disable-on-repeated-
    /// failure threshold.
    async fn recent_failure_streak(&self, subscription_id: Uuid, window: i64) -> Result<i64>;
}
