use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceName(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pass,
    Warn,
    Fail,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Warn => "warn",
            Self::Fail => "fail",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pass" => Some(Self::Pass),
            "warn" => Some(Self::Warn),
            "fail" => Some(Self::Fail),
            _ => None,
        }
    }
}

/// One finished execution of the upstream preflight pipeline for one source.
/// Rows are written by the pipeline and are immutable here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightRun {
    pub run_id: RunId,
    pub source_name: SourceName,
    pub created_at: DateTime<Utc>,
    pub validation_status: RunStatus,
    pub semantic_status: RunStatus,
    pub final_status: RunStatus,
    pub blocked: bool,
    pub summary_json: String,
}

impl PreflightRun {
    /// Blocked runs count as failures for every alert rule kind.
    pub fn counts_as_failure(&self) -> bool {
        self.blocked || self.final_status == RunStatus::Fail
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{PreflightRun, RunId, RunStatus, SourceName};

    #[test]
    fn run_status_round_trips_from_storage_encoding() {
        for status in [RunStatus::Pass, RunStatus::Warn, RunStatus::Fail] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("unknown"), None);
    }

    #[test]
    fn blocked_run_counts_as_failure_even_when_status_passes() {
        let run = PreflightRun {
            run_id: RunId("r-1".to_string()),
            source_name: SourceName("train".to_string()),
            created_at: Utc::now(),
            validation_status: RunStatus::Pass,
            semantic_status: RunStatus::Pass,
            final_status: RunStatus::Pass,
            blocked: true,
            summary_json: "{}".to_string(),
        };

        assert!(run.counts_as_failure());
    }
}
