use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::alert::PolicyId;
use crate::domain::run::SourceName;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditCategory {
    Evaluation,
    Notification,
    Silence,
    Acknowledgement,
    System,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Evaluation => "evaluation",
            Self::Notification => "notification",
            Self::Silence => "silence",
            Self::Acknowledgement => "acknowledgement",
            Self::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "evaluation" => Some(Self::Evaluation),
            "notification" => Some(Self::Notification),
            "silence" => Some(Self::Silence),
            "acknowledgement" => Some(Self::Acknowledgement),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOutcome {
    Success,
    Rejected,
    Failed,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "success" => Some(Self::Success),
            "rejected" => Some(Self::Rejected),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub policy_id: Option<PolicyId>,
    pub source_name: Option<SourceName>,
    pub correlation_id: String,
    pub event_type: String,
    pub category: AuditCategory,
    pub actor: String,
    pub outcome: AuditOutcome,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        policy_id: Option<PolicyId>,
        source_name: Option<SourceName>,
        correlation_id: impl Into<String>,
        event_type: impl Into<String>,
        category: AuditCategory,
        actor: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            policy_id,
            source_name,
            correlation_id: correlation_id.into(),
            event_type: event_type.into(),
            category,
            actor: actor.into(),
            outcome,
            metadata: BTreeMap::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use crate::audit::{AuditCategory, AuditEvent, AuditOutcome};
    use crate::domain::alert::PolicyId;
    use crate::domain::run::SourceName;

    #[test]
    fn events_carry_correlation_fields_and_accumulated_metadata() {
        let event = AuditEvent::new(
            Some(PolicyId("train-fail".to_owned())),
            Some(SourceName("train".to_owned())),
            "req-123",
            "alert.transition_applied",
            AuditCategory::Evaluation,
            "evaluation-engine",
            AuditOutcome::Success,
        )
        .with_metadata("from", "pending")
        .with_metadata("to", "firing");

        assert!(!event.event_id.is_empty());
        assert_eq!(event.correlation_id, "req-123");
        assert_eq!(event.policy_id.as_ref().map(|id| id.0.as_str()), Some("train-fail"));
        assert_eq!(event.metadata.get("from").map(String::as_str), Some("pending"));
        assert_eq!(event.metadata.get("to").map(String::as_str), Some("firing"));
    }

    #[test]
    fn category_and_outcome_round_trip_from_storage_encoding() {
        for category in [
            AuditCategory::Evaluation,
            AuditCategory::Notification,
            AuditCategory::Silence,
            AuditCategory::Acknowledgement,
            AuditCategory::System,
        ] {
            assert_eq!(AuditCategory::parse(category.as_str()), Some(category));
        }
        for outcome in [AuditOutcome::Success, AuditOutcome::Rejected, AuditOutcome::Failed] {
            assert_eq!(AuditOutcome::parse(outcome.as_str()), Some(outcome));
        }
    }
}
