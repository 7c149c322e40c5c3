pub mod backoff;
pub mod event_id;
pub mod signing;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::alert::{AlertTransition, TransitionKind};
use crate::domain::notification::{DeliveryId, EventType, OutboxItem, OutboxState};

pub use backoff::RetryPolicy;
pub use event_id::derive_event_id;
pub use signing::{signature_header, verify_signature, SIGNATURE_PREFIX};

/// Wire payload posted to the webhook receiver. The `event_id` inside the
/// body mirrors the delivery header so receivers can dedup from either.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub event_id: String,
    pub event_type: EventType,
    pub policy_id: String,
    pub source_name: String,
    pub severity: String,
    pub occurred_at: DateTime<Utc>,
}

impl From<TransitionKind> for EventType {
    fn from(kind: TransitionKind) -> Self {
        match kind {
            TransitionKind::Firing => Self::AlertFiring,
            TransitionKind::Resolved => Self::AlertResolved,
        }
    }
}

/// Build the durable outbox row for a detected transition. The event id is
/// derived deterministically; the delivery id is fresh per row.
pub fn outbox_item_for(transition: &AlertTransition, now: DateTime<Utc>) -> OutboxItem {
    let event_id = derive_event_id(transition);
    let payload = NotificationPayload {
        event_id: event_id.0.clone(),
        event_type: transition.kind.into(),
        policy_id: transition.policy_id.0.clone(),
        source_name: transition.source_name.0.clone(),
        severity: transition.severity.as_str().to_string(),
        occurred_at: transition.occurred_at,
    };
    let payload_json = serde_json::to_string(&payload)
        .unwrap_or_else(|_| format!(r#"{{"event_id":"{}"}}"#, event_id.0));

    OutboxItem {
        delivery_id: DeliveryId(Uuid::new_v4().to_string()),
        event_id,
        event_type: transition.kind.into(),
        payload_json,
        state: OutboxState::Pending,
        attempt_count: 0,
        last_http_status: None,
        last_error_code: None,
        next_attempt_at: now,
        claimed_by: None,
        claimed_at: None,
        replayed_from_id: None,
        created_at: now,
        updated_at: now,
    }
}
