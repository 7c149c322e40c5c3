use chrono::Utc;
use uuid::Uuid;

use crate::commands::{run_against_database, CommandResult, StepFailure};
use vigil_core::audit::{AuditCategory, AuditEvent, AuditOutcome};
use vigil_core::config::AppConfig;
use vigil_core::domain::alert::{AlertPhase, AlertState};
use vigil_core::evaluate::{advance_phase, condition_holds};
use vigil_core::notify::outbox_item_for;
use vigil_db::repositories::{
    AlertRepository, RunRegistry, SilenceRepository, SqlAlertRepository, SqlRunRegistry,
    SqlSilenceRepository,
};
use vigil_db::DbPool;

pub fn run() -> CommandResult {
    run_against_database("evaluate", |config, pool| async move {
        let totals = evaluate_once(&config, &pool)
            .await
            .map_err(|message| StepFailure::new("evaluation", message, 6))?;
        Ok(format!(
            "evaluated {} policies: {} transitions, {} notifications enqueued, {} suppressed",
            totals.policies, totals.transitions, totals.enqueued, totals.suppressed
        ))
    })
}

#[derive(Debug, Default)]
struct TickTotals {
    policies: u32,
    transitions: u32,
    enqueued: u32,
    suppressed: u32,
}

/// One-shot counterpart of the scheduled evaluation tick: same run window,
/// same phase machine, same silence and dedup behavior, attributed to "cli".
async fn evaluate_once(config: &AppConfig, pool: &DbPool) -> Result<TickTotals, String> {
    let runs = SqlRunRegistry::new(pool.clone());
    let alerts = SqlAlertRepository::new(pool.clone());
    let silences = SqlSilenceRepository::new(pool.clone());

    let correlation_id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let mut totals = TickTotals::default();

    for policy in config.policies.iter().filter(|policy| policy.enabled) {
        totals.policies += 1;

        let window = runs
            .recent_for_source(&policy.source_name, policy.rule.window_runs().max(1))
            .await
            .map_err(|error| error.to_string())?;
        let condition = condition_holds(&policy.rule, &window);
        let observed_at = window.first().map(|run| run.created_at).unwrap_or(now);

        let current = alerts
            .find_state(&policy.id, &policy.source_name)
            .await
            .map_err(|error| error.to_string())?
            .unwrap_or_else(|| {
                AlertState::initial(policy.id.clone(), policy.source_name.clone(), observed_at)
            });

        let decision = advance_phase(policy, &current, condition, observed_at);
        let unchanged = current.phase == decision.next.phase
            && current.observation_streak == decision.next.observation_streak
            && current.fired_count == decision.next.fired_count
            && current.acked == decision.next.acked;
        if unchanged && decision.transition.is_none() {
            continue;
        }

        let event_type = if current.phase == decision.next.phase {
            "alert.evaluated"
        } else {
            match decision.next.phase {
                AlertPhase::Firing => "alert.transition.firing",
                AlertPhase::Resolved => "alert.transition.resolved",
                _ => "alert.evaluated",
            }
        };
        let mut audit = AuditEvent::new(
            Some(policy.id.clone()),
            Some(policy.source_name.clone()),
            &correlation_id,
            event_type,
            AuditCategory::Evaluation,
            "cli",
            AuditOutcome::Success,
        )
        .with_metadata("from", current.phase.as_str())
        .with_metadata("to", decision.next.phase.as_str());

        let mut outbox = None;
        if let Some(transition) = &decision.transition {
            totals.transitions += 1;

            let active = silences
                .active_at(transition.occurred_at)
                .await
                .map_err(|error| error.to_string())?;
            let suppressing = active.iter().find(|silence| {
                silence.matches(
                    &policy.id,
                    &policy.source_name,
                    policy.severity,
                    transition.occurred_at,
                )
            });

            match suppressing {
                Some(silence) => {
                    totals.suppressed += 1;
                    audit = audit
                        .with_metadata("suppressed", "true")
                        .with_metadata("silence_id", silence.id.0.clone());
                }
                None => outbox = Some(outbox_item_for(transition, now)),
            }
        }

        let outcome = alerts
            .apply_evaluation(decision.next, audit, outbox)
            .await
            .map_err(|error| error.to_string())?;
        if outcome.outbox_enqueued {
            totals.enqueued += 1;
        }
    }

    Ok(totals)
}
