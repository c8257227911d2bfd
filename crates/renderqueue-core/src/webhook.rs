//! Webhook domain types.
//!
//! The event model is a closed, typed enum rather than a dynamic
//! string-keyed bag: each variant carries its own payload struct, so new
//! fields can be added without breaking existing subscribers (additive
//! evolution only).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a webhook subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
    Disabled,
}

/// An owner's registration for a set of events at a target URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub target_url: String,
    pub events: Vec<String>,
    pub status: SubscriptionStatus,
    /// High-entropy HMAC key. Never logged or returned verbatim after
    /// creation except to the owner.
    pub signing_secret: String,
    pub custom_headers: Vec<(String, String)>,
    pub max_retries: i32,
    pub success_count: i64,
    pub failure_count: i64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookSubscription {
    pub fn subscribes_to(&self, event: &str) -> bool {
        self.status == SubscriptionStatus::Active && self.events.iter().any(|e| e == event)
    }
}

/// State of one delivery attempt record. Every attempt appends a row; the
/// latest row's state is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Delivered,
    Failed,
    Retrying,
}

/// One HTTP attempt of one subscription for one emitted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub event_name: String,
    pub payload: serde_json::Value,
    pub state: DeliveryState,
    pub attempt_count: i32,
    pub response_status: Option<i32>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The closed set of domain events that can trigger a webhook fan-out.
///
/// `event_name()` is the wire identifier used in the `X-Webhook-Event`
/// header and for subscription matching; `payload()` is the public,
/// additive-only JSON contract for that event.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    VideoCreated(VideoCreated),
    VideoCompleted(VideoCompleted),
    VideoFailed(VideoFailed),
    RenderStarted(RenderStarted),
    RenderCompleted(RenderCompleted),
    RenderFailed(RenderFailed),
    CreditsLow(CreditsLow),
    CreditsPurchased(CreditsPurchased),
    AutomationTriggered(AutomationTriggered),
    AutomationFailed(AutomationFailed),
}

impl WebhookEvent {
    pub fn owner_id(&self) -> Uuid {
        match self {
            WebhookEvent::VideoCreated(e) => e.owner_id,
            WebhookEvent::VideoCompleted(e) => e.owner_id,
            WebhookEvent::VideoFailed(e) => e.owner_id,
            WebhookEvent::RenderStarted(e) => e.owner_id,
            WebhookEvent::RenderCompleted(e) => e.owner_id,
            WebhookEvent::RenderFailed(e) => e.owner_id,
            WebhookEvent::CreditsLow(e) => e.owner_id,
            WebhookEvent::CreditsPurchased(e) => e.owner_id,
            WebhookEvent::AutomationTriggered(e) => e.owner_id,
            WebhookEvent::AutomationFailed(e) => e.owner_id,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            WebhookEvent::VideoCreated(_) => "video.created",
            WebhookEvent::VideoCompleted(_) => "video.completed",
            WebhookEvent::VideoFailed(_) => "video.failed",
            WebhookEvent::RenderStarted(_) => "render.started",
            WebhookEvent::RenderCompleted(_) => "render.completed",
            WebhookEvent::RenderFailed(_) => "render.failed",
            WebhookEvent::CreditsLow(_) => "credits.low",
            WebhookEvent::CreditsPurchased(_) => "credits.purchased",
            WebhookEvent::AutomationTriggered(_) => "automation.triggered",
            WebhookEvent::AutomationFailed(_) => "automation.failed",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            WebhookEvent::VideoCreated(e) => serde_json::to_value(e),
            WebhookEvent::VideoCompleted(e) => serde_json::to_value(e),
            WebhookEvent::VideoFailed(e) => serde_json::to_value(e),
            WebhookEvent::RenderStarted(e) => serde_json::to_value(e),
            WebhookEvent::RenderCompleted(e) => serde_json::to_value(e),
            WebhookEvent::RenderFailed(e) => serde_json::to_value(e),
            WebhookEvent::CreditsLow(e) => serde_json::to_value(e),
            WebhookEvent::CreditsPurchased(e) => serde_json::to_value(e),
            WebhookEvent::AutomationTriggered(e) => serde_json::to_value(e),
            WebhookEvent::AutomationFailed(e) => serde_json::to_value(e),
        }
        .unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoCreated {
    pub owner_id: Uuid,
    pub video_id: Uuid,
    pub project_id: Uuid,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoCompleted {
    pub owner_id: Uuid,
    pub video_id: Uuid,
    pub duration_seconds: f64,
    pub output_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoFailed {
    pub owner_id: Uuid,
    pub video_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderStarted {
    pub owner_id: Uuid,
    pub job_id: Uuid,
    pub video_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderCompleted {
    pub owner_id: Uuid,
    pub job_id: Uuid,
    pub video_id: Uuid,
    pub frames_rendered: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderFailed {
    pub owner_id: Uuid,
    pub job_id: Uuid,
    pub video_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditsLow {
    pub owner_id: Uuid,
    pub remaining_credits: i64,
    pub threshold: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditsPurchased {
    pub owner_id: Uuid,
    pub credits_added: i64,
    pub new_balance: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationTriggered {
    pub owner_id: Uuid,
    pub automation_id: Uuid,
    pub trigger: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationFailed {
    pub owner_id: Uuid,
    pub automation_id: Uuid,
    pub reason: String,
}

/// The envelope a delivery's POST body carries around the event payload.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryEnvelope {
    pub event: String,
    pub delivered_at: DateTime<Utc>,
    pub delivery_id: Uuid,
    #[serde(flatten)]
    pub data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_name_matches_wire_contract() {
        let owner_id = Uuid::new_v4();
        let event = WebhookEvent::VideoCompleted(VideoCompleted {
            owner_id,
            video_id: Uuid::new_v4(),
            duration_seconds: 12.5,
            output_url: "https://example.com/v.mp4".into(),
        });
        assert_eq!(event.event_name(), "video.completed");
        assert_eq!(event.owner_id(), owner_id);
    }

    #[test]
    fn payload_is_additive_json_object() {
        let event = WebhookEvent::CreditsLow(CreditsLow {
            owner_id: Uuid::new_v4(),
            remaining_credits: 5,
            threshold: 10,
        });
        let payload = event.payload();
        assert!(payload.is_object());
        assert_eq!(payload["remaining_credits"], 5);
    }

    #[test]
    fn subscription_matches_only_active_with_event() {
        let mut sub = sample_subscription();
        sub.events = vec!["video.completed".to_string()];
        sub.status = SubscriptionStatus::Active;
        assert!(sub.subscribes_to("video.completed"));
        assert!(!sub.subscribes_to("video.failed"));

        sub.status = SubscriptionStatus::Disabled;
        assert!(!sub.subscribes_to("video.completed"));
    }

    fn sample_subscription() -> WebhookSubscription {
        let now = Utc::now();
        WebhookSubscription {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            target_url: "https://example.com/hook".into(),
            events: vec![],
            status: SubscriptionStatus::Active,
            signing_secret: "secret".into(),
            custom_headers: vec![],
            max_retries: 5,
            success_count: 0,
            failure_count: 0,
            last_triggered_at: None,
            last_success_at: None,
            last_failure_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
