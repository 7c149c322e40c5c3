use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::alert::{PolicyId, Severity};
use crate::domain::run::SourceName;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SilenceId(pub String);

/// Operator-created suppression window. A matching silence suppresses the
/// notification for a transition, never the detection itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Silence {
    pub id: SilenceId,
    pub policy_id: Option<PolicyId>,
    pub source_name: Option<SourceName>,
    pub severity: Option<Severity>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub created_by: String,
    pub comment: Option<String>,
    pub expired: bool,
    pub created_at: DateTime<Utc>,
}

impl Silence {
    pub fn is_active(&self, at: DateTime<Utc>) -> bool {
        !self.expired && self.starts_at <= at && at < self.ends_at
    }

    /// An unset matcher field matches everything in that dimension.
    pub fn matches(
        &self,
        policy_id: &PolicyId,
        source_name: &SourceName,
        severity: Severity,
        at: DateTime<Utc>,
    ) -> bool {
        if !self.is_active(at) {
            return false;
        }
        if self.policy_id.as_ref().is_some_and(|scoped| scoped != policy_id) {
            return false;
        }
        if self.source_name.as_ref().is_some_and(|scoped| scoped != source_name) {
            return false;
        }
        if self.severity.is_some_and(|scoped| scoped != severity) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{Silence, SilenceId};
    use crate::domain::alert::{PolicyId, Severity};
    use crate::domain::run::SourceName;

    fn silence_fixture() -> Silence {
        let now = Utc::now();
        Silence {
            id: SilenceId("s-1".to_string()),
            policy_id: Some(PolicyId("train-fail".to_string())),
            source_name: None,
            severity: None,
            starts_at: now - Duration::hours(1),
            ends_at: now + Duration::hours(1),
            created_by: "ops".to_string(),
            comment: Some("planned backfill".to_string()),
            expired: false,
            created_at: now - Duration::hours(1),
        }
    }

    #[test]
    fn matches_scoped_policy_and_wildcards_other_dimensions() {
        let silence = silence_fixture();
        let now = Utc::now();

        assert!(silence.matches(
            &PolicyId("train-fail".to_string()),
            &SourceName("train".to_string()),
            Severity::High,
            now,
        ));
        assert!(!silence.matches(
            &PolicyId("other".to_string()),
            &SourceName("train".to_string()),
            Severity::High,
            now,
        ));
    }

    #[test]
    fn expired_or_out_of_window_silence_never_matches() {
        let mut silence = silence_fixture();
        let now = Utc::now();
        let policy = PolicyId("train-fail".to_string());
        let source = SourceName("train".to_string());

        silence.expired = true;
        assert!(!silence.matches(&policy, &source, Severity::High, now));

        silence.expired = false;
        assert!(!silence.matches(&policy, &source, Severity::High, now + Duration::hours(2)));
    }
}
