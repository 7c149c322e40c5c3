use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use vigil_core::audit::AuditEvent;
use vigil_core::domain::alert::{AlertState, PolicyId};
use vigil_core::domain::lease::SchedulerLease;
use vigil_core::domain::notification::{
    AttemptOutcome, DeliveryAttempt, DeliveryId, OutboxItem, OutboxState,
};
use vigil_core::domain::run::{PreflightRun, RunId, RunStatus, SourceName};
use vigil_core::domain::silence::{Silence, SilenceId};

pub mod alerts;
pub mod leases;
pub mod ledger;
pub mod outbox;
pub mod runs;
pub mod silences;

pub use alerts::SqlAlertRepository;
pub use leases::SqlLeaseRepository;
pub use ledger::SqlLedgerRepository;
pub use outbox::SqlOutboxRepository;
pub use runs::SqlRunRegistry;
pub use silences::SqlSilenceRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("{entity} not found: `{id}`")]
    NotFound { entity: &'static str, id: String },
    #[error("invalid outbox transition from `{from}` to `{to}`")]
    InvalidTransition { from: String, to: String },
}

#[derive(Clone, Debug, Default)]
pub struct RunFilter {
    pub source_name: Option<SourceName>,
    pub final_status: Option<RunStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    pub total: u64,
    pub blocked: u64,
    pub passed: u64,
    pub warned: u64,
    pub failed: u64,
}

/// Read model over finished preflight runs. The pipeline writes these rows
/// out-of-band; `insert_run` exists for fixtures and ingestion tooling.
#[async_trait]
pub trait RunRegistry: Send + Sync {
    async fn find_run(
        &self,
        run_id: &RunId,
        source_name: &SourceName,
    ) -> Result<Option<PreflightRun>, RepositoryError>;

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<PreflightRun>, RepositoryError>;

    async fn latest_per_source(&self) -> Result<Vec<PreflightRun>, RepositoryError>;

    async fn recent_for_source(
        &self,
        source_name: &SourceName,
        limit: u32,
    ) -> Result<Vec<PreflightRun>, RepositoryError>;

    async fn insert_run(&self, run: PreflightRun) -> Result<(), RepositoryError>;

    async fn run_stats(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<RunStats, RepositoryError>;
}

/// Result of one atomic evaluation write.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EvaluationWriteOutcome {
    /// False when the outbox insert hit the event-id dedup index (a
    /// concurrent tick already enqueued this logical event) or when no
    /// enqueue was requested.
    pub outbox_enqueued: bool,
}

#[async_trait]
pub trait AlertRepository: Send + Sync {
    async fn find_state(
        &self,
        policy_id: &PolicyId,
        source_name: &SourceName,
    ) -> Result<Option<AlertState>, RepositoryError>;

    async fn list_states(&self) -> Result<Vec<AlertState>, RepositoryError>;

    async fn list_firing(&self) -> Result<Vec<AlertState>, RepositoryError>;

    /// Persist a new alert state, its audit row, and the optional outbox
    /// item as one transaction. A crash can never leave a transition
    /// without its notification or the other way around.
    async fn apply_evaluation(
        &self,
        state: AlertState,
        audit: AuditEvent,
        outbox: Option<OutboxItem>,
    ) -> Result<EvaluationWriteOutcome, RepositoryError>;

    /// Operator annotation; requires the alert to currently be FIRING.
    async fn set_ack(
        &self,
        policy_id: &PolicyId,
        source_name: &SourceName,
        acked: bool,
        actor: &str,
        audit: AuditEvent,
        now: DateTime<Utc>,
    ) -> Result<AlertState, RepositoryError>;

    async fn append_audit(&self, event: AuditEvent) -> Result<(), RepositoryError>;

    async fn list_audit(
        &self,
        policy_id: Option<&PolicyId>,
        limit: u32,
    ) -> Result<Vec<AuditEvent>, RepositoryError>;

    /// (event_type, count) pairs for transition-total metrics.
    async fn audit_counts_by_type(&self) -> Result<Vec<(String, u64)>, RepositoryError>;
}

#[async_trait]
pub trait SilenceRepository: Send + Sync {
    async fn create(&self, silence: Silence) -> Result<(), RepositoryError>;

    async fn find(&self, id: &SilenceId) -> Result<Option<Silence>, RepositoryError>;

    async fn expire(&self, id: &SilenceId) -> Result<Silence, RepositoryError>;

    async fn list(&self, include_expired: bool) -> Result<Vec<Silence>, RepositoryError>;

    /// Silences whose window covers `at` and which are not expired.
    async fn active_at(&self, at: DateTime<Utc>) -> Result<Vec<Silence>, RepositoryError>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutboxStats {
    pub pending: u64,
    pub retrying: u64,
    pub sent: u64,
    pub dead: u64,
    pub oldest_pending_age_secs: Option<i64>,
}

/// Disposition of an outbox item after one dispatch attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptDisposition {
    Sent,
    Retry { next_attempt_at: DateTime<Utc> },
    Dead,
}

#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Insert-or-ignore keyed by event id among original rows. Returns
    /// whether a row was actually inserted.
    async fn enqueue(&self, item: OutboxItem) -> Result<bool, RepositoryError>;

    async fn find(&self, delivery_id: &DeliveryId) -> Result<Option<OutboxItem>, RepositoryError>;

    async fn list(
        &self,
        state: Option<OutboxState>,
        limit: u32,
    ) -> Result<Vec<OutboxItem>, RepositoryError>;

    /// Claim-then-process: atomically select due PENDING/RETRYING items that
    /// are unclaimed (or whose claim is older than `stale_after`), stamp the
    /// claim, and return them. Overlapping ticks never claim the same row.
    async fn claim_due(
        &self,
        limit: u32,
        worker: &str,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<Vec<OutboxItem>, RepositoryError>;

    /// Record one attempt: append the immutable ledger row and move the item
    /// forward, in one transaction. The item is only "handled" for the tick
    /// once both are durable.
    async fn record_attempt(
        &self,
        delivery_id: &DeliveryId,
        attempt: DeliveryAttempt,
        disposition: AttemptDisposition,
        now: DateTime<Utc>,
    ) -> Result<OutboxItem, RepositoryError>;

    /// New PENDING row with a fresh delivery id, the same event id, and a
    /// lineage pointer; the original row is never mutated.
    async fn replay(
        &self,
        delivery_id: &DeliveryId,
        now: DateTime<Utc>,
    ) -> Result<OutboxItem, RepositoryError>;

    /// Replay the oldest `limit` DEAD items.
    async fn replay_dead(
        &self,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxItem>, RepositoryError>;

    async fn stats(&self, now: DateTime<Utc>) -> Result<OutboxStats, RepositoryError>;
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LatencySummary {
    /// Cumulative counts per upper bound, in the order of the supplied
    /// bounds; the final implicit +Inf bucket equals `count`.
    pub bucket_counts: Vec<u64>,
    pub count: u64,
    pub sum_ms: u64,
}

#[async_trait]
pub trait LedgerRepository: Send + Sync {
    async fn list_for_delivery(
        &self,
        delivery_id: &DeliveryId,
    ) -> Result<Vec<DeliveryAttempt>, RepositoryError>;

    async fn list_recent(&self, limit: u32) -> Result<Vec<DeliveryAttempt>, RepositoryError>;

    async fn outcome_counts(&self) -> Result<Vec<(AttemptOutcome, u64)>, RepositoryError>;

    async fn error_code_counts(&self, limit: u32)
        -> Result<Vec<(String, u64)>, RepositoryError>;

    async fn latency_summary(
        &self,
        bucket_bounds_ms: &[u64],
    ) -> Result<LatencySummary, RepositoryError>;
}

#[async_trait]
pub trait LeaseRepository: Send + Sync {
    /// Conditional acquire/renew: succeeds iff the lease row is absent,
    /// expired, or already held by `holder`. Returns false otherwise.
    async fn acquire(
        &self,
        lease_name: &str,
        holder: &str,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Heartbeat stamp after a guarded tick completes under a held lease.
    async fn record_tick(
        &self,
        lease_name: &str,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn find(&self, lease_name: &str) -> Result<Option<SchedulerLease>, RepositoryError>;

    async fn list(&self) -> Result<Vec<SchedulerLease>, RepositoryError>;
}

// Fixed-width UTC encoding so string comparison in SQL matches time order.
pub(crate) fn fmt_ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn fmt_ts_opt(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(fmt_ts)
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_u64(column: &str, value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u64): {value}"
        ))
    })
}

pub(crate) fn parse_http_status(
    column: &str,
    value: Option<i64>,
) -> Result<Option<u16>, RepositoryError> {
    value
        .map(|status| {
            u16::try_from(status).map_err(|_| {
                RepositoryError::Decode(format!("invalid http status in `{column}`: {status}"))
            })
        })
        .transpose()
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}
