use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use vigil_core::audit::{AuditCategory, AuditEvent, AuditOutcome};
use vigil_core::config::AppConfig;
use vigil_core::domain::alert::{AlertPolicy, AlertState, AlertTransition};
use vigil_core::errors::ApplicationError;
use vigil_core::evaluate::{advance_phase, condition_holds};
use vigil_core::notify::outbox_item_for;
use vigil_db::repositories::{
    AlertRepository, RepositoryError, RunRegistry, SilenceRepository,
};

pub const EVALUATED_EVENT: &str = "alert.evaluated";
pub const FIRING_EVENT: &str = "alert.transition.firing";
pub const RESOLVED_EVENT: &str = "alert.transition.resolved";

pub(crate) fn app_error(error: RepositoryError) -> ApplicationError {
    match error {
        RepositoryError::NotFound { entity, id } => ApplicationError::NotFound { entity, id },
        other => ApplicationError::Persistence(other.to_string()),
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvaluationSummary {
    pub policies_evaluated: u32,
    pub transitions_applied: u32,
    pub notifications_enqueued: u32,
    pub suppressed: u32,
}

/// Walks every enabled policy once per tick: fetch the run window, fold it
/// through the pure phase machine, and persist the outcome atomically.
pub struct EvaluationService {
    runs: Arc<dyn RunRegistry>,
    alerts: Arc<dyn AlertRepository>,
    silences: Arc<dyn SilenceRepository>,
    policies: Vec<AlertPolicy>,
}

impl EvaluationService {
    pub fn new(
        runs: Arc<dyn RunRegistry>,
        alerts: Arc<dyn AlertRepository>,
        silences: Arc<dyn SilenceRepository>,
        config: &AppConfig,
    ) -> Self {
        Self { runs, alerts, silences, policies: config.policies.clone() }
    }

    pub fn policies(&self) -> &[AlertPolicy] {
        &self.policies
    }

    pub async fn run_tick(
        &self,
        now: DateTime<Utc>,
    ) -> Result<EvaluationSummary, ApplicationError> {
        let correlation_id = Uuid::new_v4().to_string();
        let mut summary = EvaluationSummary::default();

        for policy in self.policies.iter().filter(|policy| policy.enabled) {
            summary.policies_evaluated += 1;
            self.evaluate_policy(policy, now, &correlation_id, &mut summary).await?;
        }

        debug!(
            event_name = "alert.evaluate.tick_completed",
            correlation_id = %correlation_id,
            policies = summary.policies_evaluated,
            transitions = summary.transitions_applied,
            enqueued = summary.notifications_enqueued,
            suppressed = summary.suppressed,
            "evaluation tick completed"
        );

        Ok(summary)
    }

    async fn evaluate_policy(
        &self,
        policy: &AlertPolicy,
        now: DateTime<Utc>,
        correlation_id: &str,
        summary: &mut EvaluationSummary,
    ) -> Result<(), ApplicationError> {
        let window = self
            .runs
            .recent_for_source(&policy.source_name, policy.rule.window_runs().max(1))
            .await
            .map_err(app_error)?;

        let condition = condition_holds(&policy.rule, &window);
        // Transition timestamps come from the observed data, not the wall
        // clock, so overlapping ticks derive the same event id.
        let observed_at = window.first().map(|run| run.created_at).unwrap_or(now);

        let current = self
            .alerts
            .find_state(&policy.id, &policy.source_name)
            .await
            .map_err(app_error)?
            .unwrap_or_else(|| {
                AlertState::initial(policy.id.clone(), policy.source_name.clone(), observed_at)
            });

        let decision = advance_phase(policy, &current, condition, observed_at);
        if !materially_changed(&current, &decision.next) && decision.transition.is_none() {
            return Ok(());
        }

        let mut audit = audit_for(policy, &current, &decision.next, correlation_id);
        let mut outbox = None;

        if let Some(transition) = &decision.transition {
            summary.transitions_applied += 1;

            match self.matching_silence(policy, transition).await? {
                Some(silence_id) => {
                    summary.suppressed += 1;
                    audit = audit
                        .with_metadata("suppressed", "true")
                        .with_metadata("silence_id", silence_id);
                    info!(
                        event_name = "alert.notification_suppressed",
                        correlation_id = %correlation_id,
                        policy_id = %policy.id.0,
                        source_name = %policy.source_name.0,
                        transition = transition.kind.as_str(),
                        "transition recorded but notification suppressed by silence"
                    );
                }
                None => {
                    outbox = Some(outbox_item_for(transition, now));
                }
            }

            info!(
                event_name = "alert.transition_applied",
                correlation_id = %correlation_id,
                policy_id = %policy.id.0,
                source_name = %policy.source_name.0,
                from = current.phase.as_str(),
                to = decision.next.phase.as_str(),
                transition = transition.kind.as_str(),
                "alert phase transition applied"
            );
        }

        let enqueue_requested = outbox.is_some();
        let outcome = self
            .alerts
            .apply_evaluation(decision.next, audit, outbox)
            .await
            .map_err(app_error)?;

        if outcome.outbox_enqueued {
            summary.notifications_enqueued += 1;
        } else if enqueue_requested {
            debug!(
                event_name = "alert.notification_deduplicated",
                correlation_id = %correlation_id,
                policy_id = %policy.id.0,
                "outbox already holds this logical event"
            );
        }

        Ok(())
    }

    async fn matching_silence(
        &self,
        policy: &AlertPolicy,
        transition: &AlertTransition,
    ) -> Result<Option<String>, ApplicationError> {
        let active = self
            .silences
            .active_at(transition.occurred_at)
            .await
            .map_err(app_error)?;

        Ok(active
            .iter()
            .find(|silence| {
                silence.matches(
                    &policy.id,
                    &policy.source_name,
                    policy.severity,
                    transition.occurred_at,
                )
            })
            .map(|silence| silence.id.0.clone()))
    }
}

fn materially_changed(current: &AlertState, next: &AlertState) -> bool {
    current.phase != next.phase
        || current.observation_streak != next.observation_streak
        || current.fired_count != next.fired_count
        || current.acked != next.acked
}

fn audit_for(
    policy: &AlertPolicy,
    current: &AlertState,
    next: &AlertState,
    correlation_id: &str,
) -> AuditEvent {
    let event_type = if current.phase != next.phase {
        match next.phase {
            vigil_core::domain::alert::AlertPhase::Firing => FIRING_EVENT,
            vigil_core::domain::alert::AlertPhase::Resolved => RESOLVED_EVENT,
            _ => EVALUATED_EVENT,
        }
    } else {
        EVALUATED_EVENT
    };

    AuditEvent::new(
        Some(policy.id.clone()),
        Some(policy.source_name.clone()),
        correlation_id,
        event_type,
        AuditCategory::Evaluation,
        "evaluation-engine",
        AuditOutcome::Success,
    )
    .with_metadata("from", current.phase.as_str())
    .with_metadata("to", next.phase.as_str())
}
