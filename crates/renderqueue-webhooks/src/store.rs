//! `PgWebhookStore`: the PostgreSQL implementation of
//! [`renderqueue_core::webhook_store::WebhookStore`].
//!
//! Claims due deliveries with `FOR UPDATE SKIP LOCKED`, mirroring the
//! claim/mark-published split used for outbox-style delivery tables.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use renderqueue_core::job::Pagination;
use renderqueue_core::webhook::{DeliveryState, SubscriptionStatus, WebhookDelivery, WebhookSubscription};
use renderqueue_core::webhook_store::WebhookStore;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Clone)]
pub struct PgWebhookStore {
    pool: PgPool,
}

impl PgWebhookStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn status_str(status: SubscriptionStatus) -> &'static str {
    match status {
        SubscriptionStatus::Active => "active",
        SubscriptionStatus::Inactive => "inactive",
        SubscriptionStatus::Disabled => "disabled",
    }
}

fn parse_status(raw: &str) -> Result<SubscriptionStatus> {
    Ok(match raw {
        "active" => SubscriptionStatus::Active,
        "inactive" => SubscriptionStatus::Inactive,
        "disabled" => SubscriptionStatus::Disabled,
        other => anyhow::bail!("unrecognized subscription status: {other}"),
    })
}

fn parse_delivery_state(raw: &str) -> Result<DeliveryState> {
    Ok(match raw {
        "pending" => DeliveryState::Pending,
        "delivered" => DeliveryState::Delivered,
        "failed" => DeliveryState::Failed,
        "retrying" => DeliveryState::Retrying,
        other => anyhow::bail!("unrecognized delivery state: {other}"),
    })
}

fn row_to_subscription(row: PgRow) -> Result<WebhookSubscription> {
    let status_raw: String = row.try_get("status")?;
    let headers_json: serde_json::Value = row.try_get("custom_headers")?;
    let custom_headers: Vec<(String, String)> =
        serde_json::from_value(headers_json).context("malformed custom_headers json")?;
    Ok(WebhookSubscription {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        target_url: row.try_get("target_url")?,
        events: row.try_get("events")?,
        status: parse_status(&status_raw)?,
        signing_secret: row.try_get("signing_secret")?,
        custom_headers,
        max_retries: row.try_get("max_retries")?,
        success_count: row.try_get("success_count")?,
        failure_count: row.try_get("failure_count")?,
        last_triggered_at: row.try_get("last_triggered_at")?,
        last_success_at: row.try_get("last_success_at")?,
        last_failure_at: row.try_get("last_failure_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_delivery(row: PgRow) -> Result<WebhookDelivery> {
    let state_raw: String = row.try_get("state")?;
    Ok(WebhookDelivery {
        id: row.try_get("id")?,
        subscription_id: row.try_get("subscription_id")?,
        event_name: row.try_get("event_name")?,
        payload: row.try_get("payload")?,
        state: parse_delivery_state(&state_raw)?,
        attempt_count: row.try_get("attempt_count")?,
        response_status: row.try_get("response_status")?,
        error: row.try_get("error")?,
        duration_ms: row.try_get("duration_ms")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

const SUBSCRIPTION_COLUMNS: &str = "id, owner_id, target_url, events, status::text AS status, \
    signing_secret, custom_headers, max_retries, success_count, failure_count, \
    last_triggered_at, last_success_at, last_failure_at, created_at, updated_at";

const DELIVERY_COLUMNS: &str = "id, subscription_id, event_name, payload, state::text AS state, \
    attempt_count, response_status, error, duration_ms, next_attempt_at, created_at, completed_at";

fn generate_secret() -> String {
    let bytes: [u8; 32] = std::array::from_fn(|_| fastrand::u8(..));
    hex::encode(bytes)
}

#[async_trait]
impl WebhookStore for PgWebhookStore {
    async fn create_subscription(
        &self,
        owner_id: Uuid,
        target_url: String,
        events: Vec<String>,
        max_retries: i32,
        custom_headers: Vec<(String, String)>,
    ) -> Result<WebhookSubscription> {
        let secret = generate_secret();
        let headers_json = serde_json::to_value(&custom_headers)?;
        let row = sqlx::query(&format!(
            "INSERT INTO webhook_subscriptions \
                 (owner_id, target_url, events, signing_secret, custom_headers, max_retries) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {SUBSCRIPTION_COLUMNS}"
        ))
        .bind(owner_id)
        .bind(&target_url)
        .bind(&events)
        .bind(&secret)
        .bind(headers_json)
        .bind(max_retries)
        .fetch_one(&self.pool)
        .await?;
        row_to_subscription(row)
    }

    async fn get_subscription(&self, id: Uuid) -> Result<Option<WebhookSubscription>> {
        let row = sqlx::query(&format!("SELECT {SUBSCRIPTION_COLUMNS} FROM webhook_subscriptions WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_subscription).transpose()
    }

    async fn subscriptions_for_event(&self, owner_id: Uuid, event: &str) -> Result<Vec<WebhookSubscription>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM webhook_subscriptions \
             WHERE owner_id = $1 AND status = 'active' AND $2 = ANY(events)"
        ))
        .bind(owner_id)
        .bind(event)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_subscription).collect()
    }

    async fn regenerate_secret(&self, id: Uuid) -> Result<String> {
        let secret = generate_secret();
        sqlx::query("UPDATE webhook_subscriptions SET signing_secret = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(&secret)
            .execute(&self.pool)
            .await?;
        Ok(secret)
    }

    async fn set_status(&self, id: Uuid, status: SubscriptionStatus) -> Result<()> {
        sqlx::query("UPDATE webhook_subscriptions SET status = $2::subscription_status, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status_str(status))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_delivery(
        &self,
        subscription_id: Uuid,
        event_name: &str,
        payload: serde_json::Value,
    ) -> Result<WebhookDelivery> {
        let row = sqlx::query(&format!(
            "INSERT INTO webhook_deliveries (subscription_id, event_name, payload) \
             VALUES ($1, $2, $3) RETURNING {DELIVERY_COLUMNS}"
        ))
        .bind(subscription_id)
        .bind(event_name)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;
        row_to_delivery(row)
    }

    async fn record_success(&self, delivery_id: Uuid, response_status: i32, duration_ms: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let subscription_id: Uuid = sqlx::query_scalar(
            "UPDATE webhook_deliveries SET \
                 state = 'delivered', attempt_count = attempt_count + 1, \
                 response_status = $2, duration_ms = $3, completed_at = NOW() \
             WHERE id = $1 RETURNING subscription_id",
        )
        .bind(delivery_id)
        .bind(response_status)
        .bind(duration_ms)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE webhook_subscriptions SET \
                 success_count = success_count + 1, \
                 last_triggered_at = NOW(), \
                 last_success_at = NOW(), \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(subscription_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        delivery_id: Uuid,
        error: &str,
        duration_ms: i64,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let state = if next_attempt_at.is_some() { "retrying" } else { "failed" };
        let completed_at = if next_attempt_at.is_some() { None } else { Some(Utc::now()) };

        let subscription_id: Uuid = sqlx::query_scalar(
            "UPDATE webhook_deliveries SET \
                 state = $2::delivery_state, \
                 attempt_count = attempt_count + 1, \
                 error = $3, \
                 duration_ms = $4, \
                 next_attempt_at = COALESCE($5, next_attempt_at), \
                 completed_at = $6 \
             WHERE id = $1 RETURNING subscription_id",
        )
        .bind(delivery_id)
        .bind(state)
        .bind(error)
        .bind(duration_ms)
        .bind(next_attempt_at)
        .bind(completed_at)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE webhook_subscriptions SET \
                 failure_count = failure_count + 1, \
                 last_triggered_at = NOW(), \
                 last_failure_at = NOW(), \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(subscription_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn claim_due_deliveries(&self, limit: i64) -> Result<Vec<WebhookDelivery>> {
        let query = format!(
            "WITH claimable AS ( \
                 SELECT id FROM webhook_deliveries \
                 WHERE state IN ('pending', 'retrying') AND next_attempt_at <= NOW() \
                 ORDER BY next_attempt_at ASC \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE webhook_deliveries SET next_attempt_at = NOW() + INTERVAL '30 seconds' \
             WHERE id IN (SELECT id FROM claimable) \
             RETURNING {DELIVERY_COLUMNS}"
        );
        let rows = sqlx::query(&query).bind(limit).fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_delivery).collect()
    }

    async fn list_deliveries(&self, subscription_id: Uuid, page: Pagination) -> Result<Vec<WebhookDelivery>> {
        let rows = sqlx::query(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries \
             WHERE subscription_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3"
        ))
        .bind(subscription_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_delivery).collect()
    }

    async fn recent_failure_streak(&self, subscription_id: Uuid, window: i64) -> Result<i64> {
        let row = sqlx::query(
            "SELECT state::text AS state FROM webhook_deliveries \
             WHERE subscription_id = $1 AND state IN ('delivered', 'failed') \
             ORDER BY created_at DESC LIMIT $2",
        )
        .bind(subscription_id)
        .bind(window)
        .fetch_all(&self.pool)
        .await?;

        let mut streak = 0i64;
        for r in row {
            let state: String = r.try_get("state")?;
            if state == "failed" {
                streak += 1;
            } else {
                break;
            }
        }
        Ok(streak)
    }
}
