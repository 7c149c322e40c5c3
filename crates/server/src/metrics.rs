//! Prometheus text exporter computed from stored state on each scrape.
//!
//! There is no in-process metrics registry: every family is derived from the
//! database, so all server instances report the same numbers and a restart
//! loses nothing. Families render independently; one failing family is
//! omitted and counted, never failing the scrape.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use vigil_core::domain::alert::{AlertPolicy, PolicyId, Severity};
use vigil_core::domain::notification::OutboxState;
use vigil_db::repositories::{
    AlertRepository, LeaseRepository, LedgerRepository, OutboxRepository, RepositoryError,
    RunRegistry, SilenceRepository,
};

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Upper bounds for the delivery latency histogram, in milliseconds.
pub const LATENCY_BUCKET_BOUNDS_MS: &[u64] =
    &[10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000];

const TRANSITION_EVENT_PREFIX: &str = "alert.transition.";

pub struct MetricsRenderer {
    runs: Arc<dyn RunRegistry>,
    alerts: Arc<dyn AlertRepository>,
    silences: Arc<dyn SilenceRepository>,
    outbox: Arc<dyn OutboxRepository>,
    ledger: Arc<dyn LedgerRepository>,
    leases: Arc<dyn LeaseRepository>,
    severity_by_policy: HashMap<PolicyId, Severity>,
    render_errors: AtomicU64,
}

impl MetricsRenderer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runs: Arc<dyn RunRegistry>,
        alerts: Arc<dyn AlertRepository>,
        silences: Arc<dyn SilenceRepository>,
        outbox: Arc<dyn OutboxRepository>,
        ledger: Arc<dyn LedgerRepository>,
        leases: Arc<dyn LeaseRepository>,
        policies: &[AlertPolicy],
    ) -> Self {
        let severity_by_policy =
            policies.iter().map(|policy| (policy.id.clone(), policy.severity)).collect();
        Self {
            runs,
            alerts,
            silences,
            outbox,
            ledger,
            leases,
            severity_by_policy,
            render_errors: AtomicU64::new(0),
        }
    }

    pub fn render_error_count(&self) -> u64 {
        self.render_errors.load(Ordering::Relaxed)
    }

    /// Render the full exposition. Always succeeds; families whose reads fail
    /// are skipped and counted in `vigil_metrics_render_errors_total`.
    pub async fn render(&self, now: DateTime<Utc>) -> String {
        let mut out = String::with_capacity(4096);

        self.family(&mut out, "runs", self.render_runs().await);
        self.family(&mut out, "alerts", self.render_alerts().await);
        self.family(&mut out, "silences", self.render_silences(now).await);
        self.family(&mut out, "deliveries", self.render_deliveries().await);
        self.family(&mut out, "outbox", self.render_outbox(now).await);
        self.family(&mut out, "scheduler", self.render_scheduler().await);

        let render_errors = self.render_errors.load(Ordering::Relaxed);
        push_header(
            &mut out,
            "vigil_metrics_render_errors_total",
            "counter",
            "Metric families skipped because their read failed.",
        );
        let _ = writeln!(out, "vigil_metrics_render_errors_total {render_errors}");

        out
    }

    fn family(&self, out: &mut String, name: &str, rendered: Result<String, RepositoryError>) {
        match rendered {
            Ok(text) => out.push_str(&text),
            Err(error) => {
                self.render_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_name = "metrics.family_render_failed",
                    family = name,
                    error = %error,
                    "metric family omitted from scrape"
                );
            }
        }
    }

    async fn render_runs(&self) -> Result<String, RepositoryError> {
        let stats = self.runs.run_stats(None).await?;
        let mut out = String::new();
        push_header(&mut out, "vigil_runs_total", "counter", "Preflight runs recorded.");
        let _ = writeln!(out, "vigil_runs_total {}", stats.total);
        push_header(&mut out, "vigil_runs_blocked_total", "counter", "Runs marked blocked.");
        let _ = writeln!(out, "vigil_runs_blocked_total {}", stats.blocked);
        push_header(
            &mut out,
            "vigil_runs_final_status_total",
            "counter",
            "Runs by final status.",
        );
        let _ = writeln!(out, "vigil_runs_final_status_total{{status=\"pass\"}} {}", stats.passed);
        let _ = writeln!(out, "vigil_runs_final_status_total{{status=\"warn\"}} {}", stats.warned);
        let _ = writeln!(out, "vigil_runs_final_status_total{{status=\"fail\"}} {}", stats.failed);
        Ok(out)
    }

    async fn render_alerts(&self) -> Result<String, RepositoryError> {
        let firing = self.alerts.list_firing().await?;
        let mut by_severity: HashMap<&'static str, u64> = HashMap::new();
        for state in &firing {
            let label = self
                .severity_by_policy
                .get(&state.policy_id)
                .map(Severity::as_str)
                .unwrap_or("unknown");
            *by_severity.entry(label).or_insert(0) += 1;
        }

        let mut out = String::new();
        push_header(&mut out, "vigil_alerts_firing", "gauge", "Currently firing alerts.");
        for severity in ["high", "medium", "low", "unknown"] {
            let count = by_severity.get(severity).copied().unwrap_or(0);
            if count > 0 || severity != "unknown" {
                let _ = writeln!(out, "vigil_alerts_firing{{severity=\"{severity}\"}} {count}");
            }
        }

        push_header(
            &mut out,
            "vigil_alert_transitions_total",
            "counter",
            "Alert phase transitions recorded in the audit trail.",
        );
        let mut totals: HashMap<String, u64> = HashMap::new();
        for (event_type, count) in self.alerts.audit_counts_by_type().await? {
            if let Some(kind) = event_type.strip_prefix(TRANSITION_EVENT_PREFIX) {
                *totals.entry(kind.to_string()).or_insert(0) += count;
            }
        }
        for kind in ["firing", "resolved"] {
            let count = totals.get(kind).copied().unwrap_or(0);
            let _ = writeln!(out, "vigil_alert_transitions_total{{kind=\"{kind}\"}} {count}");
        }
        Ok(out)
    }

    async fn render_silences(&self, now: DateTime<Utc>) -> Result<String, RepositoryError> {
        let total = self.silences.list(true).await?.len();
        let active = self.silences.active_at(now).await?.len();
        let mut out = String::new();
        push_header(&mut out, "vigil_silences", "gauge", "Silences by activity.");
        let _ = writeln!(out, "vigil_silences{{window=\"active\"}} {active}");
        let _ = writeln!(out, "vigil_silences{{window=\"all\"}} {total}");
        Ok(out)
    }

    async fn render_deliveries(&self) -> Result<String, RepositoryError> {
        let mut out = String::new();
        push_header(
            &mut out,
            "vigil_delivery_attempts_total",
            "counter",
            "Webhook delivery attempts by outcome.",
        );
        let counts = self.ledger.outcome_counts().await?;
        for (outcome, count) in &counts {
            let _ = writeln!(
                out,
                "vigil_delivery_attempts_total{{outcome=\"{}\"}} {count}",
                outcome.as_str()
            );
        }

        let latency = self.ledger.latency_summary(LATENCY_BUCKET_BOUNDS_MS).await?;
        push_header(
            &mut out,
            "vigil_delivery_duration_milliseconds",
            "histogram",
            "Webhook delivery attempt duration.",
        );
        for (bound, cumulative) in LATENCY_BUCKET_BOUNDS_MS.iter().zip(&latency.bucket_counts) {
            let _ = writeln!(
                out,
                "vigil_delivery_duration_milliseconds_bucket{{le=\"{bound}\"}} {cumulative}"
            );
        }
        let _ = writeln!(
            out,
            "vigil_delivery_duration_milliseconds_bucket{{le=\"+Inf\"}} {}",
            latency.count
        );
        let _ = writeln!(out, "vigil_delivery_duration_milliseconds_count {}", latency.count);
        let _ = writeln!(out, "vigil_delivery_duration_milliseconds_sum {}", latency.sum_ms);
        Ok(out)
    }

    async fn render_outbox(&self, now: DateTime<Utc>) -> Result<String, RepositoryError> {
        let stats = self.outbox.stats(now).await?;
        let mut out = String::new();
        push_header(&mut out, "vigil_outbox_items", "gauge", "Outbox items by state.");
        for (state, count) in [
            (OutboxState::Pending, stats.pending),
            (OutboxState::Retrying, stats.retrying),
            (OutboxState::Sent, stats.sent),
            (OutboxState::Dead, stats.dead),
        ] {
            let _ = writeln!(out, "vigil_outbox_items{{state=\"{}\"}} {count}", state.as_str());
        }
        push_header(
            &mut out,
            "vigil_outbox_oldest_pending_age_seconds",
            "gauge",
            "Age of the oldest PENDING outbox item; 0 when the outbox is drained.",
        );
        let age = stats.oldest_pending_age_secs.unwrap_or(0).max(0);
        let _ = writeln!(out, "vigil_outbox_oldest_pending_age_seconds {age}");
        Ok(out)
    }

    async fn render_scheduler(&self) -> Result<String, RepositoryError> {
        let leases = self.leases.list().await?;
        let mut out = String::new();
        push_header(
            &mut out,
            "vigil_scheduler_last_tick_timestamp_seconds",
            "gauge",
            "Unix timestamp of the last completed guarded tick per lease.",
        );
        for lease in &leases {
            if let Some(last_tick_at) = lease.last_tick_at {
                let _ = writeln!(
                    out,
                    "vigil_scheduler_last_tick_timestamp_seconds{{lease=\"{}\"}} {}",
                    lease.lease_name,
                    last_tick_at.timestamp()
                );
            }
        }
        Ok(out)
    }
}

fn push_header(out: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}
