use sha2::{Digest, Sha256};

use crate::domain::alert::AlertTransition;
use crate::domain::notification::EventId;

/// Derive the stable receiver-side dedup key for a logical transition.
///
/// The material is fully determined by the transition itself, so two ticks
/// that both detect the same transition derive the same event id and the
/// outbox conflict-ignore insert collapses them to one row.
pub fn derive_event_id(transition: &AlertTransition) -> EventId {
    let material = format!(
        "{}|{}|{}|{}",
        transition.policy_id.0,
        transition.source_name.0,
        transition.kind.as_str(),
        transition.occurred_at.to_rfc3339(),
    );
    EventId(sha256_hex(material.as_bytes()))
}

pub(crate) fn sha256_hex(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    encode_hex(digest.as_slice())
}

pub(crate) fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::derive_event_id;
    use crate::domain::alert::{AlertTransition, PolicyId, Severity, TransitionKind};
    use crate::domain::run::SourceName;

    fn transition(kind: TransitionKind) -> AlertTransition {
        AlertTransition {
            policy_id: PolicyId("train-fail".to_string()),
            source_name: SourceName("train".to_string()),
            kind,
            severity: Severity::High,
            occurred_at: Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).single().expect("timestamp"),
        }
    }

    #[test]
    fn same_transition_derives_same_event_id() {
        let first = derive_event_id(&transition(TransitionKind::Firing));
        let second = derive_event_id(&transition(TransitionKind::Firing));
        assert_eq!(first, second);
    }

    #[test]
    fn different_kind_or_timestamp_changes_event_id() {
        let firing = derive_event_id(&transition(TransitionKind::Firing));
        let resolved = derive_event_id(&transition(TransitionKind::Resolved));
        assert_ne!(firing, resolved);

        let mut later = transition(TransitionKind::Firing);
        later.occurred_at = later.occurred_at + Duration::seconds(1);
        assert_ne!(firing, derive_event_id(&later));
    }
}
