use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use vigil_core::audit::{AuditCategory, AuditEvent, AuditOutcome};
use vigil_core::domain::alert::{AlertPhase, AlertState, PolicyId};
use vigil_core::domain::notification::OutboxItem;
use vigil_core::domain::run::SourceName;

use super::outbox::insert_outbox_item;
use super::{
    fmt_ts, fmt_ts_opt, parse_optional_timestamp, parse_timestamp, parse_u32, parse_u64,
    AlertRepository, EvaluationWriteOutcome, RepositoryError,
};
use crate::DbPool;

const STATE_COLUMNS: &str = "policy_id, source_name, phase, observation_streak, \
     last_transition_at, fired_count, acked, acked_by, acked_at, updated_at";

const AUDIT_COLUMNS: &str = "event_id, policy_id, source_name, correlation_id, event_type, \
     category, actor, outcome, metadata_json, occurred_at";

pub struct SqlAlertRepository {
    pool: DbPool,
}

impl SqlAlertRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AlertRepository for SqlAlertRepository {
    async fn find_state(
        &self,
        policy_id: &PolicyId,
        source_name: &SourceName,
    ) -> Result<Option<AlertState>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {STATE_COLUMNS} FROM alert_state WHERE policy_id = ? AND source_name = ?"
        ))
        .bind(&policy_id.0)
        .bind(&source_name.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(state_from_row).transpose()
    }

    async fn list_states(&self) -> Result<Vec<AlertState>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {STATE_COLUMNS} FROM alert_state ORDER BY policy_id ASC, source_name ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(state_from_row).collect()
    }

    async fn list_firing(&self) -> Result<Vec<AlertState>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {STATE_COLUMNS} FROM alert_state
             WHERE phase = 'firing'
             ORDER BY policy_id ASC, source_name ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(state_from_row).collect()
    }

    async fn apply_evaluation(
        &self,
        state: AlertState,
        audit: AuditEvent,
        outbox: Option<OutboxItem>,
    ) -> Result<EvaluationWriteOutcome, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO alert_state (
                policy_id,
                source_name,
                phase,
                observation_streak,
                last_transition_at,
                fired_count,
                acked,
                acked_by,
                acked_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (policy_id, source_name) DO UPDATE SET
                phase = excluded.phase,
                observation_streak = excluded.observation_streak,
                last_transition_at = excluded.last_transition_at,
                fired_count = excluded.fired_count,
                acked = excluded.acked,
                acked_by = excluded.acked_by,
                acked_at = excluded.acked_at,
                updated_at = excluded.updated_at",
        )
        .bind(&state.policy_id.0)
        .bind(&state.source_name.0)
        .bind(state.phase.as_str())
        .bind(i64::from(state.observation_streak))
        .bind(fmt_ts_opt(state.last_transition_at))
        .bind(i64::from(state.fired_count))
        .bind(i64::from(state.acked))
        .bind(&state.acked_by)
        .bind(fmt_ts_opt(state.acked_at))
        .bind(fmt_ts(state.updated_at))
        .execute(&mut *tx)
        .await?;

        insert_audit_event(&mut tx, &audit).await?;

        let outbox_enqueued = match outbox {
            Some(item) => insert_outbox_item(&mut tx, &item).await?,
            None => false,
        };

        tx.commit().await?;

        Ok(EvaluationWriteOutcome { outbox_enqueued })
    }

    async fn set_ack(
        &self,
        policy_id: &PolicyId,
        source_name: &SourceName,
        acked: bool,
        actor: &str,
        audit: AuditEvent,
        now: DateTime<Utc>,
    ) -> Result<AlertState, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {STATE_COLUMNS} FROM alert_state WHERE policy_id = ? AND source_name = ?"
        ))
        .bind(&policy_id.0)
        .bind(&source_name.0)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RepositoryError::NotFound {
            entity: "alert state",
            id: format!("{}/{}", policy_id.0, source_name.0),
        })?;

        let mut state = state_from_row(row)?;
        if state.phase != AlertPhase::Firing {
            return Err(RepositoryError::InvalidTransition {
                from: state.phase.as_str().to_string(),
                to: if acked { "acked".to_string() } else { "unacked".to_string() },
            });
        }

        state.acked = acked;
        state.acked_by = acked.then(|| actor.to_string());
        state.acked_at = acked.then_some(now);
        state.updated_at = now;

        sqlx::query(
            "UPDATE alert_state
             SET acked = ?, acked_by = ?, acked_at = ?, updated_at = ?
             WHERE policy_id = ? AND source_name = ?",
        )
        .bind(i64::from(state.acked))
        .bind(&state.acked_by)
        .bind(fmt_ts_opt(state.acked_at))
        .bind(fmt_ts(state.updated_at))
        .bind(&policy_id.0)
        .bind(&source_name.0)
        .execute(&mut *tx)
        .await?;

        insert_audit_event(&mut tx, &audit).await?;

        tx.commit().await?;

        Ok(state)
    }

    async fn append_audit(&self, event: AuditEvent) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        insert_audit_event(&mut tx, &event).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_audit(
        &self,
        policy_id: Option<&PolicyId>,
        limit: u32,
    ) -> Result<Vec<AuditEvent>, RepositoryError> {
        let rows = match policy_id {
            Some(policy_id) => {
                sqlx::query(&format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_event
                     WHERE policy_id = ?
                     ORDER BY occurred_at DESC
                     LIMIT ?"
                ))
                .bind(&policy_id.0)
                .bind(i64::from(limit.max(1)))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_event
                     ORDER BY occurred_at DESC
                     LIMIT ?"
                ))
                .bind(i64::from(limit.max(1)))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(audit_from_row).collect()
    }

    async fn audit_counts_by_type(&self) -> Result<Vec<(String, u64)>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT event_type, COUNT(*) AS count
             FROM audit_event
             GROUP BY event_type
             ORDER BY event_type ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let event_type = row.try_get::<String, _>("event_type")?;
                let count = parse_u64("count", row.try_get("count")?)?;
                Ok((event_type, count))
            })
            .collect()
    }
}

async fn insert_audit_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    event: &AuditEvent,
) -> Result<(), RepositoryError> {
    let metadata_json = serde_json::to_string(&event.metadata)
        .map_err(|error| RepositoryError::Decode(format!("encode audit metadata: {error}")))?;

    sqlx::query(
        "INSERT INTO audit_event (
            event_id,
            policy_id,
            source_name,
            correlation_id,
            event_type,
            category,
            actor,
            outcome,
            metadata_json,
            occurred_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&event.event_id)
    .bind(event.policy_id.as_ref().map(|id| id.0.clone()))
    .bind(event.source_name.as_ref().map(|source| source.0.clone()))
    .bind(&event.correlation_id)
    .bind(&event.event_type)
    .bind(event.category.as_str())
    .bind(event.actor.as_str())
    .bind(event.outcome.as_str())
    .bind(metadata_json)
    .bind(fmt_ts(event.occurred_at))
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn state_from_row(row: SqliteRow) -> Result<AlertState, RepositoryError> {
    let phase_raw = row.try_get::<String, _>("phase")?;
    let phase = AlertPhase::parse(&phase_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown alert phase: `{phase_raw}`"))
    })?;

    Ok(AlertState {
        policy_id: PolicyId(row.try_get("policy_id")?),
        source_name: SourceName(row.try_get("source_name")?),
        phase,
        observation_streak: parse_u32("observation_streak", row.try_get("observation_streak")?)?,
        last_transition_at: parse_optional_timestamp(
            "last_transition_at",
            row.try_get("last_transition_at")?,
        )?,
        fired_count: parse_u32("fired_count", row.try_get("fired_count")?)?,
        acked: row.try_get::<i64, _>("acked")? != 0,
        acked_by: row.try_get("acked_by")?,
        acked_at: parse_optional_timestamp("acked_at", row.try_get("acked_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn audit_from_row(row: SqliteRow) -> Result<AuditEvent, RepositoryError> {
    let category_raw = row.try_get::<String, _>("category")?;
    let category = AuditCategory::parse(&category_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown audit category: `{category_raw}`"))
    })?;
    let outcome_raw = row.try_get::<String, _>("outcome")?;
    let outcome = AuditOutcome::parse(&outcome_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown audit outcome: `{outcome_raw}`"))
    })?;
    let metadata_json = row.try_get::<String, _>("metadata_json")?;
    let metadata = serde_json::from_str(&metadata_json)
        .map_err(|error| RepositoryError::Decode(format!("decode audit metadata: {error}")))?;

    Ok(AuditEvent {
        event_id: row.try_get("event_id")?,
        policy_id: row.try_get::<Option<String>, _>("policy_id")?.map(PolicyId),
        source_name: row.try_get::<Option<String>, _>("source_name")?.map(SourceName),
        correlation_id: row.try_get("correlation_id")?,
        event_type: row.try_get("event_type")?,
        category,
        actor: row.try_get("actor")?,
        outcome,
        metadata,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}
