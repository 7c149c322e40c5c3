//! Operator-facing JSON API. Caller identity is resolved upstream; every
//! request gets a correlation id that is echoed in error responses.
//!
//! Read:
//! - `GET  /api/v1/runs`                                — list runs with filters
//! - `GET  /api/v1/runs/latest`                         — newest run per source
//! - `GET  /api/v1/runs/{source}/{run_id}`              — one run
//! - `GET  /api/v1/alerts/active`                       — currently firing alerts
//! - `GET  /api/v1/alerts/history`                      — audit trail
//! - `GET  /api/v1/alerts/policies`                     — configured policies
//! - `GET  /api/v1/silences`                            — list silences
//! - `GET  /api/v1/notifications`                       — list outbox items
//! - `GET  /api/v1/notifications/stats`                 — outbox and ledger stats
//! - `GET  /api/v1/notifications/{delivery_id}`         — one outbox item
//! - `GET  /api/v1/notifications/{delivery_id}/attempts` — its delivery ledger
//! - `GET  /metrics`                                    — Prometheus exposition
//!
//! Mutating:
//! - `POST /api/v1/silences`                            — create a silence
//! - `POST /api/v1/silences/{id}/expire`                — expire a silence early
//! - `POST /api/v1/alerts/{policy_id}/{source}/ack`     — acknowledge
//! - `POST /api/v1/alerts/{policy_id}/{source}/unack`   — clear acknowledgement
//! - `POST /api/v1/evaluate`                            — run one evaluation tick
//! - `POST /api/v1/dispatch`                            — run one dispatch tick
//! - `POST /api/v1/notifications/{delivery_id}/replay`  — replay one item
//! - `POST /api/v1/notifications/replay-dead`           — replay oldest DEAD items

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use vigil_core::audit::{AuditCategory, AuditEvent, AuditOutcome};
use vigil_core::domain::alert::{AlertPolicy, AlertState, PolicyId, Severity};
use vigil_core::domain::notification::{DeliveryId, OutboxItem, OutboxState};
use vigil_core::domain::run::{RunId, RunStatus, SourceName};
use vigil_core::domain::silence::{Silence, SilenceId};
use vigil_core::errors::{ApplicationError, DomainError, InterfaceError};
use vigil_db::repositories::{
    AlertRepository, LedgerRepository, OutboxRepository, RepositoryError, RunFilter, RunRegistry,
    SilenceRepository,
};
use vigil_webhook::WebhookDispatcher;

use crate::evaluator::{app_error, EvaluationService};
use crate::metrics::{self, MetricsRenderer};

#[derive(Clone)]
pub struct ApiState {
    pub runs: Arc<dyn RunRegistry>,
    pub alerts: Arc<dyn AlertRepository>,
    pub silences: Arc<dyn SilenceRepository>,
    pub outbox: Arc<dyn OutboxRepository>,
    pub ledger: Arc<dyn LedgerRepository>,
    pub evaluator: Arc<EvaluationService>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub metrics: Arc<MetricsRenderer>,
}

const DEFAULT_LIST_LIMIT: u32 = 100;
const DEFAULT_REPLAY_DEAD_LIMIT: u32 = 100;

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub correlation_id: String,
}

#[derive(Debug)]
pub struct ApiError(InterfaceError);

impl ApiError {
    fn bad_request(message: impl Into<String>, correlation_id: &str) -> Self {
        Self(InterfaceError::BadRequest {
            message: message.into(),
            correlation_id: correlation_id.to_string(),
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, correlation_id) = match self.0 {
            InterfaceError::BadRequest { message, correlation_id } => {
                (StatusCode::BAD_REQUEST, message, correlation_id)
            }
            InterfaceError::NotFound { message, correlation_id } => {
                (StatusCode::NOT_FOUND, message, correlation_id)
            }
            InterfaceError::ServiceUnavailable { message, correlation_id } => {
                (StatusCode::SERVICE_UNAVAILABLE, message, correlation_id)
            }
            InterfaceError::Internal { message, correlation_id } => {
                (StatusCode::INTERNAL_SERVER_ERROR, message, correlation_id)
            }
        };
        (status, Json(ErrorBody { error: message, correlation_id })).into_response()
    }
}

/// Repository failures surfaced to callers. Rejected transitions are caller
/// errors, not persistence faults.
fn repo_error(error: RepositoryError, correlation_id: &str) -> ApiError {
    let application = match error {
        RepositoryError::InvalidTransition { from, to } => {
            ApplicationError::Domain(DomainError::InvariantViolation(format!(
                "cannot transition from `{from}` to `{to}`"
            )))
        }
        other => app_error(other),
    };
    ApiError(application.into_interface(correlation_id))
}

fn application_error(error: ApplicationError, correlation_id: &str) -> ApiError {
    ApiError(error.into_interface(correlation_id))
}

fn correlation_id() -> String {
    Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/runs", get(list_runs))
        .route("/api/v1/runs/latest", get(latest_runs))
        .route("/api/v1/runs/{source}/{run_id}", get(get_run))
        .route("/api/v1/alerts/active", get(active_alerts))
        .route("/api/v1/alerts/history", get(alert_history))
        .route("/api/v1/alerts/policies", get(list_policies))
        .route("/api/v1/alerts/{policy_id}/{source}/ack", post(ack_alert))
        .route("/api/v1/alerts/{policy_id}/{source}/unack", post(unack_alert))
        .route("/api/v1/silences", get(list_silences).post(create_silence))
        .route("/api/v1/silences/{id}/expire", post(expire_silence))
        .route("/api/v1/notifications", get(list_notifications))
        .route("/api/v1/notifications/stats", get(notification_stats))
        .route("/api/v1/notifications/replay-dead", post(replay_dead))
        .route("/api/v1/notifications/{delivery_id}", get(get_notification))
        .route("/api/v1/notifications/{delivery_id}/attempts", get(list_attempts))
        .route("/api/v1/notifications/{delivery_id}/replay", post(replay_notification))
        .route("/api/v1/evaluate", post(evaluate_now))
        .route("/api/v1/dispatch", post(dispatch_now))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct RunListQuery {
    pub source: Option<String>,
    pub status: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

async fn list_runs(
    State(state): State<ApiState>,
    Query(query): Query<RunListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let correlation_id = correlation_id();

    let final_status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(RunStatus::parse(raw).ok_or_else(|| {
            ApiError::bad_request(format!("unknown run status `{raw}`"), &correlation_id)
        })?),
    };

    let filter = RunFilter {
        source_name: query.source.map(SourceName),
        final_status,
        since: query.since,
        until: query.until,
        limit: query.limit.unwrap_or(DEFAULT_LIST_LIMIT),
    };

    let runs = state
        .runs
        .list_runs(filter)
        .await
        .map_err(|error| repo_error(error, &correlation_id))?;

    Ok(Json(serde_json::json!({ "runs": runs })))
}

async fn latest_runs(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let correlation_id = correlation_id();
    let runs = state
        .runs
        .latest_per_source()
        .await
        .map_err(|error| repo_error(error, &correlation_id))?;
    Ok(Json(serde_json::json!({ "runs": runs })))
}

async fn get_run(
    State(state): State<ApiState>,
    Path((source, run_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let correlation_id = correlation_id();
    let run = state
        .runs
        .find_run(&RunId(run_id.clone()), &SourceName(source))
        .await
        .map_err(|error| repo_error(error, &correlation_id))?
        .ok_or_else(|| {
            application_error(
                ApplicationError::NotFound { entity: "preflight run", id: run_id },
                &correlation_id,
            )
        })?;
    Ok(Json(serde_json::json!({ "run": run })))
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ActiveAlert {
    #[serde(flatten)]
    pub state: AlertState,
    pub severity: Option<Severity>,
    pub policy_name: Option<String>,
}

async fn active_alerts(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let correlation_id = correlation_id();
    let firing = state
        .alerts
        .list_firing()
        .await
        .map_err(|error| repo_error(error, &correlation_id))?;

    let alerts: Vec<ActiveAlert> = firing
        .into_iter()
        .map(|alert| {
            let policy = state
                .evaluator
                .policies()
                .iter()
                .find(|policy| policy.id == alert.policy_id);
            ActiveAlert {
                severity: policy.map(|policy| policy.severity),
                policy_name: policy.map(|policy| policy.name.clone()),
                state: alert,
            }
        })
        .collect();

    Ok(Json(serde_json::json!({ "alerts": alerts })))
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub policy_id: Option<String>,
    pub limit: Option<u32>,
}

async fn alert_history(
    State(state): State<ApiState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let correlation_id = correlation_id();
    let policy_id = query.policy_id.map(PolicyId);
    let events = state
        .alerts
        .list_audit(policy_id.as_ref(), query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await
        .map_err(|error| repo_error(error, &correlation_id))?;
    Ok(Json(serde_json::json!({ "events": events })))
}

async fn list_policies(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let policies: &[AlertPolicy] = state.evaluator.policies();
    Json(serde_json::json!({ "policies": policies }))
}

#[derive(Debug, Deserialize)]
pub struct AckRequest {
    pub actor: String,
}

async fn ack_alert(
    State(state): State<ApiState>,
    Path((policy_id, source)): Path<(String, String)>,
    Json(body): Json<AckRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    set_ack(&state, policy_id, source, body.actor, true).await
}

async fn unack_alert(
    State(state): State<ApiState>,
    Path((policy_id, source)): Path<(String, String)>,
    Json(body): Json<AckRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    set_ack(&state, policy_id, source, body.actor, false).await
}

async fn set_ack(
    state: &ApiState,
    policy_id: String,
    source: String,
    actor: String,
    acked: bool,
) -> Result<Json<serde_json::Value>, ApiError> {
    let correlation_id = correlation_id();
    let actor = actor.trim().to_string();
    if actor.is_empty() {
        return Err(ApiError::bad_request("actor is required", &correlation_id));
    }

    let policy_id = PolicyId(policy_id);
    let source_name = SourceName(source);
    let audit = AuditEvent::new(
        Some(policy_id.clone()),
        Some(source_name.clone()),
        correlation_id.as_str(),
        if acked { "alert.acknowledged" } else { "alert.unacknowledged" },
        AuditCategory::Acknowledgement,
        actor.as_str(),
        AuditOutcome::Success,
    );

    let updated = state
        .alerts
        .set_ack(&policy_id, &source_name, acked, &actor, audit, Utc::now())
        .await
        .map_err(|error| repo_error(error, &correlation_id))?;

    info!(
        event_name = "alert.ack_changed",
        correlation_id = %correlation_id,
        policy_id = %updated.policy_id.0,
        source_name = %updated.source_name.0,
        acked,
        actor = %actor,
        "alert acknowledgement updated"
    );

    Ok(Json(serde_json::json!({ "alert": updated })))
}

// ---------------------------------------------------------------------------
// Silences
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct SilenceListQuery {
    pub include_expired: Option<bool>,
}

async fn list_silences(
    State(state): State<ApiState>,
    Query(query): Query<SilenceListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let correlation_id = correlation_id();
    let silences = state
        .silences
        .list(query.include_expired.unwrap_or(false))
        .await
        .map_err(|error| repo_error(error, &correlation_id))?;
    Ok(Json(serde_json::json!({ "silences": silences })))
}

#[derive(Debug, Deserialize)]
pub struct CreateSilenceRequest {
    pub policy_id: Option<String>,
    pub source_name: Option<String>,
    pub severity: Option<String>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: DateTime<Utc>,
    pub created_by: String,
    pub comment: Option<String>,
}

async fn create_silence(
    State(state): State<ApiState>,
    Json(body): Json<CreateSilenceRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let correlation_id = correlation_id();
    let now = Utc::now();
    let starts_at = body.starts_at.unwrap_or(now);

    if body.ends_at <= starts_at {
        return Err(application_error(
            ApplicationError::Domain(DomainError::InvalidSilenceWindow(
                "ends_at must be after starts_at".to_string(),
            )),
            &correlation_id,
        ));
    }
    let created_by = body.created_by.trim().to_string();
    if created_by.is_empty() {
        return Err(ApiError::bad_request("created_by is required", &correlation_id));
    }
    let severity = match body.severity.as_deref() {
        None => None,
        Some(raw) => Some(Severity::parse(raw).ok_or_else(|| {
            ApiError::bad_request(format!("unknown severity `{raw}`"), &correlation_id)
        })?),
    };

    let silence = Silence {
        id: SilenceId(Uuid::new_v4().to_string()),
        policy_id: body.policy_id.map(PolicyId),
        source_name: body.source_name.map(SourceName),
        severity,
        starts_at,
        ends_at: body.ends_at,
        created_by: created_by.clone(),
        comment: body.comment,
        expired: false,
        created_at: now,
    };

    state
        .silences
        .create(silence.clone())
        .await
        .map_err(|error| repo_error(error, &correlation_id))?;

    let audit = AuditEvent::new(
        silence.policy_id.clone(),
        silence.source_name.clone(),
        correlation_id.as_str(),
        "silence.created",
        AuditCategory::Silence,
        created_by.as_str(),
        AuditOutcome::Success,
    )
    .with_metadata("silence_id", silence.id.0.clone());
    state
        .alerts
        .append_audit(audit)
        .await
        .map_err(|error| repo_error(error, &correlation_id))?;

    info!(
        event_name = "silence.created",
        correlation_id = %correlation_id,
        silence_id = %silence.id.0,
        created_by = %created_by,
        "silence created"
    );

    Ok((StatusCode::CREATED, Json(serde_json::json!({ "silence": silence }))))
}

async fn expire_silence(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let correlation_id = correlation_id();
    let silence = state
        .silences
        .expire(&SilenceId(id))
        .await
        .map_err(|error| repo_error(error, &correlation_id))?;

    let audit = AuditEvent::new(
        silence.policy_id.clone(),
        silence.source_name.clone(),
        correlation_id.as_str(),
        "silence.expired",
        AuditCategory::Silence,
        "api",
        AuditOutcome::Success,
    )
    .with_metadata("silence_id", silence.id.0.clone());
    state
        .alerts
        .append_audit(audit)
        .await
        .map_err(|error| repo_error(error, &correlation_id))?;

    Ok(Json(serde_json::json!({ "silence": silence })))
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct NotificationListQuery {
    pub state: Option<String>,
    pub limit: Option<u32>,
}

async fn list_notifications(
    State(state): State<ApiState>,
    Query(query): Query<NotificationListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let correlation_id = correlation_id();
    let outbox_state = match query.state.as_deref() {
        None => None,
        Some(raw) => Some(OutboxState::parse(raw).ok_or_else(|| {
            ApiError::bad_request(format!("unknown outbox state `{raw}`"), &correlation_id)
        })?),
    };

    let items: Vec<OutboxItem> = state
        .outbox
        .list(outbox_state, query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await
        .map_err(|error| repo_error(error, &correlation_id))?;
    Ok(Json(serde_json::json!({ "notifications": items })))
}

async fn get_notification(
    State(state): State<ApiState>,
    Path(delivery_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let correlation_id = correlation_id();
    let item = state
        .outbox
        .find(&DeliveryId(delivery_id.clone()))
        .await
        .map_err(|error| repo_error(error, &correlation_id))?
        .ok_or_else(|| {
            application_error(
                ApplicationError::NotFound { entity: "outbox item", id: delivery_id },
                &correlation_id,
            )
        })?;
    Ok(Json(serde_json::json!({ "notification": item })))
}

async fn list_attempts(
    State(state): State<ApiState>,
    Path(delivery_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let correlation_id = correlation_id();
    let delivery_id = DeliveryId(delivery_id);

    if state
        .outbox
        .find(&delivery_id)
        .await
        .map_err(|error| repo_error(error, &correlation_id))?
        .is_none()
    {
        return Err(application_error(
            ApplicationError::NotFound { entity: "outbox item", id: delivery_id.0 },
            &correlation_id,
        ));
    }

    let attempts = state
        .ledger
        .list_for_delivery(&delivery_id)
        .await
        .map_err(|error| repo_error(error, &correlation_id))?;
    Ok(Json(serde_json::json!({ "attempts": attempts })))
}

async fn notification_stats(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let correlation_id = correlation_id();
    let now = Utc::now();

    let outbox = state
        .outbox
        .stats(now)
        .await
        .map_err(|error| repo_error(error, &correlation_id))?;
    let outcomes = state
        .ledger
        .outcome_counts()
        .await
        .map_err(|error| repo_error(error, &correlation_id))?;
    let error_codes = state
        .ledger
        .error_code_counts(10)
        .await
        .map_err(|error| repo_error(error, &correlation_id))?;

    let outcomes: serde_json::Map<String, serde_json::Value> = outcomes
        .into_iter()
        .map(|(outcome, count)| (outcome.as_str().to_string(), serde_json::json!(count)))
        .collect();
    let error_codes: Vec<serde_json::Value> = error_codes
        .into_iter()
        .map(|(code, count)| serde_json::json!({ "code": code, "count": count }))
        .collect();

    Ok(Json(serde_json::json!({
        "outbox": {
            "pending": outbox.pending,
            "retrying": outbox.retrying,
            "sent": outbox.sent,
            "dead": outbox.dead,
            "oldest_pending_age_secs": outbox.oldest_pending_age_secs,
        },
        "attempt_outcomes": outcomes,
        "top_error_codes": error_codes,
    })))
}

async fn replay_notification(
    State(state): State<ApiState>,
    Path(delivery_id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let correlation_id = correlation_id();
    let replayed = state
        .outbox
        .replay(&DeliveryId(delivery_id.clone()), Utc::now())
        .await
        .map_err(|error| repo_error(error, &correlation_id))?;

    info!(
        event_name = "notify.replay.requested",
        correlation_id = %correlation_id,
        original_delivery_id = %delivery_id,
        new_delivery_id = %replayed.delivery_id.0,
        "outbox item replayed"
    );

    Ok((StatusCode::CREATED, Json(serde_json::json!({ "notification": replayed }))))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReplayDeadRequest {
    pub limit: Option<u32>,
}

async fn replay_dead(
    State(state): State<ApiState>,
    Json(body): Json<ReplayDeadRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let correlation_id = correlation_id();
    let limit = body.limit.unwrap_or(DEFAULT_REPLAY_DEAD_LIMIT);

    let replayed = state
        .outbox
        .replay_dead(limit, Utc::now())
        .await
        .map_err(|error| repo_error(error, &correlation_id))?;

    info!(
        event_name = "notify.replay_dead.completed",
        correlation_id = %correlation_id,
        replayed = replayed.len(),
        "dead outbox items replayed"
    );

    Ok(Json(serde_json::json!({
        "replayed": replayed.len(),
        "notifications": replayed,
    })))
}

// ---------------------------------------------------------------------------
// Ticks and metrics
// ---------------------------------------------------------------------------

async fn evaluate_now(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let correlation_id = correlation_id();
    let summary = state
        .evaluator
        .run_tick(Utc::now())
        .await
        .map_err(|error| application_error(error, &correlation_id))?;

    Ok(Json(serde_json::json!({
        "policies_evaluated": summary.policies_evaluated,
        "transitions_applied": summary.transitions_applied,
        "notifications_enqueued": summary.notifications_enqueued,
        "suppressed": summary.suppressed,
    })))
}

async fn dispatch_now(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let correlation_id = correlation_id();
    let summary = state.dispatcher.run_tick(Utc::now()).await.map_err(|error| {
        application_error(ApplicationError::Persistence(error.to_string()), &correlation_id)
    })?;

    Ok(Json(serde_json::json!({
        "claimed": summary.claimed,
        "sent": summary.sent,
        "retried": summary.retried,
        "dead": summary.dead,
    })))
}

async fn render_metrics(State(state): State<ApiState>) -> Response {
    let body = state.metrics.render(Utc::now()).await;
    ([(header::CONTENT_TYPE, metrics::CONTENT_TYPE)], body).into_response()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::{Path, Query, State};
    use axum::http::StatusCode;
    use axum::Json;
    use chrono::{Duration, Utc};
    use secrecy::SecretString;
    use uuid::Uuid;

    use vigil_core::config::AppConfig;
    use vigil_core::domain::alert::{AlertPolicy, AlertRule, PolicyId, Severity};
    use vigil_core::domain::notification::{
        DeliveryId, EventId, EventType, OutboxItem, OutboxState,
    };
    use vigil_core::domain::run::{PreflightRun, RunId, RunStatus, SourceName};
    use vigil_core::notify::RetryPolicy;
    use vigil_db::repositories::{
        OutboxRepository, RunRegistry, SilenceRepository, SqlAlertRepository, SqlLeaseRepository,
        SqlLedgerRepository, SqlOutboxRepository, SqlRunRegistry, SqlSilenceRepository,
    };
    use vigil_db::{connect_with_settings, migrations, DbPool};
    use vigil_webhook::{DispatcherConfig, HttpWebhookTransport, WebhookDispatcher};

    use super::*;
    use crate::evaluator::EvaluationService;
    use crate::metrics::MetricsRenderer;

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn policy() -> AlertPolicy {
        AlertPolicy {
            id: PolicyId("train-fail".to_string()),
            name: "train consecutive failures".to_string(),
            source_name: SourceName("train".to_string()),
            rule: AlertRule::ConsecutiveFailures { count: 3 },
            severity: Severity::High,
            pending_observations: 1,
            enabled: true,
        }
    }

    fn api_state(pool: &DbPool) -> ApiState {
        let runs = Arc::new(SqlRunRegistry::new(pool.clone()));
        let alerts = Arc::new(SqlAlertRepository::new(pool.clone()));
        let silences = Arc::new(SqlSilenceRepository::new(pool.clone()));
        let outbox = Arc::new(SqlOutboxRepository::new(pool.clone()));
        let ledger = Arc::new(SqlLedgerRepository::new(pool.clone()));
        let leases = Arc::new(SqlLeaseRepository::new(pool.clone()));

        let config = AppConfig { policies: vec![policy()], ..AppConfig::default() };
        let evaluator = Arc::new(EvaluationService::new(
            runs.clone(),
            alerts.clone(),
            silences.clone(),
            &config,
        ));
        let dispatcher = Arc::new(WebhookDispatcher::new(
            outbox.clone(),
            Arc::new(HttpWebhookTransport::new(5).expect("transport")),
            DispatcherConfig {
                endpoint_url: None,
                secret: None::<SecretString>,
                retry: RetryPolicy::default(),
                batch_size: 10,
                claim_stale_after: Duration::seconds(120),
                worker: "test".to_string(),
            },
        ));
        let metrics = Arc::new(MetricsRenderer::new(
            runs.clone(),
            alerts.clone(),
            silences.clone(),
            outbox.clone(),
            ledger.clone(),
            leases,
            &config.policies,
        ));

        ApiState { runs, alerts, silences, outbox, ledger, evaluator, dispatcher, metrics }
    }

    fn run(id: &str, status: RunStatus) -> PreflightRun {
        PreflightRun {
            run_id: RunId(id.to_string()),
            source_name: SourceName("train".to_string()),
            created_at: Utc::now(),
            validation_status: status,
            semantic_status: status,
            final_status: status,
            blocked: false,
            summary_json: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn get_run_returns_404_for_unknown_run() {
        let pool = setup_pool().await;
        let state = api_state(&pool);

        let result = get_run(
            State(state),
            Path(("train".to_string(), "missing".to_string())),
        )
        .await;

        assert!(result.is_err());

        pool.close().await;
    }

    #[tokio::test]
    async fn list_runs_rejects_unknown_status_filter() {
        let pool = setup_pool().await;
        let state = api_state(&pool);

        let query =
            RunListQuery { status: Some("exploded".to_string()), ..RunListQuery::default() };
        let result = list_runs(State(state), Query(query)).await;

        assert!(result.is_err());

        pool.close().await;
    }

    #[tokio::test]
    async fn list_runs_filters_by_final_status() {
        let pool = setup_pool().await;
        let state = api_state(&pool);

        state.runs.insert_run(run("r-1", RunStatus::Pass)).await.expect("insert");
        state.runs.insert_run(run("r-2", RunStatus::Fail)).await.expect("insert");

        let query = RunListQuery { status: Some("fail".to_string()), ..RunListQuery::default() };
        let Json(body) = list_runs(State(state), Query(query)).await.expect("list runs");
        let runs = body["runs"].as_array().expect("runs array");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0]["run_id"], "r-2");

        pool.close().await;
    }

    #[tokio::test]
    async fn create_silence_rejects_inverted_window() {
        let pool = setup_pool().await;
        let state = api_state(&pool);
        let now = Utc::now();

        let result = create_silence(
            State(state.clone()),
            Json(CreateSilenceRequest {
                policy_id: None,
                source_name: None,
                severity: None,
                starts_at: Some(now),
                ends_at: now - Duration::hours(1),
                created_by: "ops".to_string(),
                comment: None,
            }),
        )
        .await;

        assert!(result.is_err());
        assert!(state.silences.list(true).await.expect("list").is_empty());

        pool.close().await;
    }

    #[tokio::test]
    async fn create_and_expire_silence_round_trip() {
        let pool = setup_pool().await;
        let state = api_state(&pool);
        let now = Utc::now();

        let (status, Json(created)) = create_silence(
            State(state.clone()),
            Json(CreateSilenceRequest {
                policy_id: Some("train-fail".to_string()),
                source_name: None,
                severity: Some("high".to_string()),
                starts_at: None,
                ends_at: now + Duration::hours(2),
                created_by: "ops".to_string(),
                comment: Some("maintenance".to_string()),
            }),
        )
        .await
        .expect("create silence");
        assert_eq!(status, StatusCode::CREATED);

        let silence_id = created["silence"]["id"].as_str().expect("id").to_string();
        let Json(expired) = expire_silence(State(state.clone()), Path(silence_id.clone()))
            .await
            .expect("expire");
        assert_eq!(expired["silence"]["expired"], true);

        // Expiring an unknown silence is a 404, not a silent success.
        let result =
            expire_silence(State(state), Path(Uuid::new_v4().to_string())).await;
        assert!(result.is_err());

        pool.close().await;
    }

    #[tokio::test]
    async fn ack_requires_a_firing_alert() {
        let pool = setup_pool().await;
        let state = api_state(&pool);

        let result = ack_alert(
            State(state),
            Path(("train-fail".to_string(), "train".to_string())),
            Json(AckRequest { actor: "ops".to_string() }),
        )
        .await;

        assert!(result.is_err());

        pool.close().await;
    }

    #[tokio::test]
    async fn evaluate_then_ack_then_unack() {
        let pool = setup_pool().await;
        let state = api_state(&pool);

        for index in 0..3 {
            state
                .runs
                .insert_run(run(&format!("r-{index}"), RunStatus::Fail))
                .await
                .expect("insert");
        }

        let Json(summary) = evaluate_now(State(state.clone())).await.expect("evaluate");
        assert_eq!(summary["transitions_applied"], 1);
        assert_eq!(summary["notifications_enqueued"], 1);

        let Json(acked) = ack_alert(
            State(state.clone()),
            Path(("train-fail".to_string(), "train".to_string())),
            Json(AckRequest { actor: "ops".to_string() }),
        )
        .await
        .expect("ack");
        assert_eq!(acked["alert"]["acked"], true);

        let Json(unacked) = unack_alert(
            State(state),
            Path(("train-fail".to_string(), "train".to_string())),
            Json(AckRequest { actor: "ops".to_string() }),
        )
        .await
        .expect("unack");
        assert_eq!(unacked["alert"]["acked"], false);

        pool.close().await;
    }

    fn dead_item(event_id: &str) -> OutboxItem {
        let now = Utc::now();
        OutboxItem {
            delivery_id: DeliveryId(Uuid::new_v4().to_string()),
            event_id: EventId(event_id.to_string()),
            event_type: EventType::AlertFiring,
            payload_json: "{}".to_string(),
            state: OutboxState::Pending,
            attempt_count: 0,
            last_http_status: None,
            last_error_code: None,
            next_attempt_at: now,
            claimed_by: None,
            claimed_at: None,
            replayed_from_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn replay_dead_caps_at_the_requested_limit() {
        let pool = setup_pool().await;
        let state = api_state(&pool);
        let now = Utc::now();

        for index in 0..15 {
            let item = dead_item(&format!("evt-{index}"));
            let delivery_id = item.delivery_id.clone();
            assert!(state.outbox.enqueue(item).await.expect("enqueue"));
            state
                .outbox
                .record_attempt(
                    &delivery_id,
                    vigil_core::domain::notification::DeliveryAttempt {
                        attempt_id: vigil_core::domain::notification::AttemptId(
                            Uuid::new_v4().to_string(),
                        ),
                        delivery_id: delivery_id.clone(),
                        attempted_at: now,
                        duration_ms: 5,
                        http_status: Some(400),
                        error_code: Some("http_400".to_string()),
                        outcome: vigil_core::domain::notification::AttemptOutcome::PermanentFailure,
                    },
                    vigil_db::repositories::AttemptDisposition::Dead,
                    now,
                )
                .await
                .expect("dead-letter");
        }

        let Json(body) = replay_dead(
            State(state.clone()),
            Json(ReplayDeadRequest { limit: Some(10) }),
        )
        .await
        .expect("replay dead");
        assert_eq!(body["replayed"], 10);

        let pending = state
            .outbox
            .list(Some(OutboxState::Pending), 50)
            .await
            .expect("list pending");
        assert_eq!(pending.len(), 10);
        assert!(pending.iter().all(|item| item.replayed_from_id.is_some()));

        pool.close().await;
    }

    #[tokio::test]
    async fn notification_stats_reflects_outbox_contents() {
        let pool = setup_pool().await;
        let state = api_state(&pool);

        assert!(state.outbox.enqueue(dead_item("evt-stats")).await.expect("enqueue"));

        let Json(stats) = notification_stats(State(state)).await.expect("stats");
        assert_eq!(stats["outbox"]["pending"], 1);
        assert_eq!(stats["outbox"]["dead"], 0);

        pool.close().await;
    }

    #[tokio::test]
    async fn list_notifications_rejects_unknown_state() {
        let pool = setup_pool().await;
        let state = api_state(&pool);

        let query = NotificationListQuery {
            state: Some("zombie".to_string()),
            ..NotificationListQuery::default()
        };
        let result = list_notifications(State(state), Query(query)).await;
        assert!(result.is_err());

        pool.close().await;
    }
}
