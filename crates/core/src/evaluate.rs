//! Alert rule evaluation and phase transitions.
//!
//! Both halves are pure: `condition_holds` folds a window of recent runs into
//! a boolean, `advance_phase` folds that boolean plus the persisted state into
//! the next state and an optional transition. Given the same inputs the same
//! decision comes out, which is what makes repeated and concurrent evaluation
//! ticks safe.

use chrono::{DateTime, Utc};

use crate::domain::alert::{
    AlertPhase, AlertPolicy, AlertRule, AlertState, AlertTransition, TransitionKind,
};
use crate::domain::run::PreflightRun;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseDecision {
    pub next: AlertState,
    pub transition: Option<AlertTransition>,
}

/// Evaluate a rule predicate over a window of runs ordered newest first.
/// An empty window never satisfies any rule.
pub fn condition_holds(rule: &AlertRule, window: &[PreflightRun]) -> bool {
    match rule {
        AlertRule::ConsecutiveFailures { count } => {
            let required = *count as usize;
            required > 0
                && window.len() >= required
                && window.iter().take(required).all(PreflightRun::counts_as_failure)
        }
        AlertRule::FailureCount { window_runs, count } => {
            let failures = window
                .iter()
                .take(*window_runs as usize)
                .filter(|run| run.counts_as_failure())
                .count();
            *count > 0 && failures >= *count as usize
        }
        AlertRule::FailureRatio { window_runs, min_runs, ratio } => {
            let observed: Vec<&PreflightRun> = window.iter().take(*window_runs as usize).collect();
            if observed.is_empty() || observed.len() < *min_runs as usize {
                return false;
            }
            let failures = observed.iter().filter(|run| run.counts_as_failure()).count();
            (failures as f64 / observed.len() as f64) >= *ratio
        }
    }
}

/// Advance the persisted phase machine by one observation.
///
/// `observed_at` is the creation time of the newest run in the window (falling
/// back to the evaluation time for an empty window). Transition timestamps are
/// taken from it rather than the wall clock so the derived event id is stable
/// across overlapping ticks seeing the same data.
pub fn advance_phase(
    policy: &AlertPolicy,
    current: &AlertState,
    condition: bool,
    observed_at: DateTime<Utc>,
) -> PhaseDecision {
    let required = policy.pending_observations.max(1);
    let mut next = current.clone();
    next.updated_at = observed_at;

    if condition {
        next.observation_streak = current.observation_streak.saturating_add(1);

        match current.phase {
            AlertPhase::Firing => {
                // Still firing: telemetry only, no new transition.
                next.fired_count = current.fired_count.saturating_add(1);
                PhaseDecision { next, transition: None }
            }
            AlertPhase::Ok | AlertPhase::Pending | AlertPhase::Resolved => {
                if next.observation_streak >= required {
                    next.phase = AlertPhase::Firing;
                    next.last_transition_at = Some(observed_at);
                    next.fired_count = current.fired_count.saturating_add(1);
                    // Fresh firing cycle: prior ack no longer applies.
                    next.acked = false;
                    next.acked_by = None;
                    next.acked_at = None;
                    PhaseDecision {
                        next,
                        transition: Some(AlertTransition {
                            policy_id: policy.id.clone(),
                            source_name: policy.source_name.clone(),
                            kind: TransitionKind::Firing,
                            severity: policy.severity,
                            occurred_at: observed_at,
                        }),
                    }
                } else {
                    next.phase = AlertPhase::Pending;
                    PhaseDecision { next, transition: None }
                }
            }
        }
    } else {
        next.observation_streak = 0;

        match current.phase {
            AlertPhase::Firing => {
                next.phase = AlertPhase::Resolved;
                next.last_transition_at = Some(observed_at);
                PhaseDecision {
                    next,
                    transition: Some(AlertTransition {
                        policy_id: policy.id.clone(),
                        source_name: policy.source_name.clone(),
                        kind: TransitionKind::Resolved,
                        severity: policy.severity,
                        occurred_at: observed_at,
                    }),
                }
            }
            AlertPhase::Pending | AlertPhase::Resolved => {
                next.phase = AlertPhase::Ok;
                PhaseDecision { next, transition: None }
            }
            AlertPhase::Ok => PhaseDecision { next, transition: None },
        }
    }
}
