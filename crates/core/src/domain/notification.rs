use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryId(pub String);

/// Stable per-logical-transition identifier; the receiver-side dedup key.
/// Replays reuse it, new logical events never do.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AlertFiring,
    AlertResolved,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlertFiring => "alert_firing",
            Self::AlertResolved => "alert_resolved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "alert_firing" => Some(Self::AlertFiring),
            "alert_resolved" => Some(Self::AlertResolved),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxState {
    Pending,
    Sent,
    Retrying,
    Dead,
}

impl OutboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Retrying => "retrying",
            Self::Dead => "dead",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "retrying" => Some(Self::Retrying),
            "dead" => Some(Self::Dead),
            _ => None,
        }
    }

    /// Outbox items only move forward: PENDING -> {SENT | RETRYING} and
    /// RETRYING -> {SENT | RETRYING | DEAD}. SENT and DEAD are terminal.
    pub fn can_transition_to(&self, next: OutboxState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Sent)
                | (Self::Pending, Self::Retrying)
                | (Self::Pending, Self::Dead)
                | (Self::Retrying, Self::Sent)
                | (Self::Retrying, Self::Retrying)
                | (Self::Retrying, Self::Dead)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxItem {
    pub delivery_id: DeliveryId,
    pub event_id: EventId,
    pub event_type: EventType,
    pub payload_json: String,
    pub state: OutboxState,
    pub attempt_count: u32,
    pub last_http_status: Option<u16>,
    pub last_error_code: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub replayed_from_id: Option<DeliveryId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Delivered,
    TransientFailure,
    PermanentFailure,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::TransientFailure => "transient_failure",
            Self::PermanentFailure => "permanent_failure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "delivered" => Some(Self::Delivered),
            "transient_failure" => Some(Self::TransientFailure),
            "permanent_failure" => Some(Self::PermanentFailure),
            _ => None,
        }
    }
}

/// Immutable record of one dispatch attempt. Source of truth for retry and
/// latency analytics; never updated after insert.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub attempt_id: AttemptId,
    pub delivery_id: DeliveryId,
    pub attempted_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub http_status: Option<u16>,
    pub error_code: Option<String>,
    pub outcome: AttemptOutcome,
}

#[cfg(test)]
mod tests {
    use super::{AttemptOutcome, EventType, OutboxState};

    #[test]
    fn outbox_state_round_trips_from_storage_encoding() {
        for state in
            [OutboxState::Pending, OutboxState::Sent, OutboxState::Retrying, OutboxState::Dead]
        {
            assert_eq!(OutboxState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn event_type_and_outcome_round_trip_from_storage_encoding() {
        for event_type in [EventType::AlertFiring, EventType::AlertResolved] {
            assert_eq!(EventType::parse(event_type.as_str()), Some(event_type));
        }
        for outcome in [
            AttemptOutcome::Delivered,
            AttemptOutcome::TransientFailure,
            AttemptOutcome::PermanentFailure,
        ] {
            assert_eq!(AttemptOutcome::parse(outcome.as_str()), Some(outcome));
        }
    }

    #[test]
    fn outbox_state_never_moves_backward() {
        assert!(OutboxState::Pending.can_transition_to(OutboxState::Retrying));
        assert!(OutboxState::Retrying.can_transition_to(OutboxState::Sent));
        assert!(OutboxState::Retrying.can_transition_to(OutboxState::Dead));

        assert!(!OutboxState::Sent.can_transition_to(OutboxState::Pending));
        assert!(!OutboxState::Sent.can_transition_to(OutboxState::Retrying));
        assert!(!OutboxState::Dead.can_transition_to(OutboxState::Pending));
        assert!(!OutboxState::Retrying.can_transition_to(OutboxState::Pending));
    }
}
