use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::run::SourceName;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

/// Closed set of supported rule kinds. Evaluation is a single exhaustive
/// match, not a plugin registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertRule {
    /// The most recent `count` runs all failed.
    ConsecutiveFailures { count: u32 },
    /// At least `count` failures within the last `window_runs` runs.
    FailureCount { window_runs: u32, count: u32 },
    /// Failure fraction over the last `window_runs` runs is at least `ratio`,
    /// with a minimum number of observations before the rule can hold.
    FailureRatio { window_runs: u32, min_runs: u32, ratio: f64 },
}

impl AlertRule {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::ConsecutiveFailures { .. } => "consecutive_failures",
            Self::FailureCount { .. } => "failure_count",
            Self::FailureRatio { .. } => "failure_ratio",
        }
    }

    /// Number of most-recent runs the evaluator needs to fetch.
    pub fn window_runs(&self) -> u32 {
        match self {
            Self::ConsecutiveFailures { count } => *count,
            Self::FailureCount { window_runs, .. } | Self::FailureRatio { window_runs, .. } => {
                *window_runs
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertPolicy {
    pub id: PolicyId,
    pub name: String,
    pub source_name: SourceName,
    pub rule: AlertRule,
    pub severity: Severity,
    /// Consecutive true observations required before PENDING becomes FIRING.
    pub pending_observations: u32,
    pub enabled: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertPhase {
    Ok,
    Pending,
    Firing,
    Resolved,
}

impl AlertPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Pending => "pending",
            Self::Firing => "firing",
            Self::Resolved => "resolved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ok" => Some(Self::Ok),
            "pending" => Some(Self::Pending),
            "firing" => Some(Self::Firing),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

/// Authoritative per-(policy, source) alert record. Mutated only by the
/// evaluation engine; ack fields are operator annotations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertState {
    pub policy_id: PolicyId,
    pub source_name: SourceName,
    pub phase: AlertPhase,
    /// Consecutive evaluations for which the condition held; drives the
    /// PENDING -> FIRING debounce.
    pub observation_streak: u32,
    pub last_transition_at: Option<DateTime<Utc>>,
    pub fired_count: u32,
    pub acked: bool,
    pub acked_by: Option<String>,
    pub acked_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl AlertState {
    pub fn initial(policy_id: PolicyId, source_name: SourceName, now: DateTime<Utc>) -> Self {
        Self {
            policy_id,
            source_name,
            phase: AlertPhase::Ok,
            observation_streak: 0,
            last_transition_at: None,
            fired_count: 0,
            acked: false,
            acked_by: None,
            acked_at: None,
            updated_at: now,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Firing,
    Resolved,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Firing => "firing",
            Self::Resolved => "resolved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "firing" => Some(Self::Firing),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

/// A phase change that warrants exactly one notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertTransition {
    pub policy_id: PolicyId,
    pub source_name: SourceName,
    pub kind: TransitionKind,
    pub severity: Severity,
    pub occurred_at: DateTime<Utc>,
}
