use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use vigil_core::domain::notification::{
    DeliveryAttempt, DeliveryId, EventId, EventType, OutboxItem, OutboxState,
};

use super::{
    fmt_ts, fmt_ts_opt, parse_http_status, parse_optional_timestamp, parse_timestamp, parse_u32,
    parse_u64, AttemptDisposition, OutboxRepository, OutboxStats, RepositoryError,
};
use crate::DbPool;

const OUTBOX_COLUMNS: &str = "delivery_id, event_id, event_type, payload_json, state, \
     attempt_count, last_http_status, last_error_code, next_attempt_at, claimed_by, \
     claimed_at, replayed_from_id, created_at, updated_at";

pub struct SqlOutboxRepository {
    pool: DbPool,
}

impl SqlOutboxRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Insert-or-ignore against the original-rows dedup index. Shared with the
/// evaluation write path so enqueue can ride the same transaction as the
/// alert state change.
pub(crate) async fn insert_outbox_item(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    item: &OutboxItem,
) -> Result<bool, RepositoryError> {
    let result = sqlx::query(
        "INSERT INTO notification_outbox (
            delivery_id,
            event_id,
            event_type,
            payload_json,
            state,
            attempt_count,
            last_http_status,
            last_error_code,
            next_attempt_at,
            claimed_by,
            claimed_at,
            replayed_from_id,
            created_at,
            updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT DO NOTHING",
    )
    .bind(&item.delivery_id.0)
    .bind(&item.event_id.0)
    .bind(item.event_type.as_str())
    .bind(&item.payload_json)
    .bind(item.state.as_str())
    .bind(i64::from(item.attempt_count))
    .bind(item.last_http_status.map(i64::from))
    .bind(&item.last_error_code)
    .bind(fmt_ts(item.next_attempt_at))
    .bind(&item.claimed_by)
    .bind(fmt_ts_opt(item.claimed_at))
    .bind(item.replayed_from_id.as_ref().map(|id| id.0.clone()))
    .bind(fmt_ts(item.created_at))
    .bind(fmt_ts(item.updated_at))
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() > 0)
}

#[async_trait]
impl OutboxRepository for SqlOutboxRepository {
    async fn enqueue(&self, item: OutboxItem) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let inserted = insert_outbox_item(&mut tx, &item).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn find(&self, delivery_id: &DeliveryId) -> Result<Option<OutboxItem>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM notification_outbox WHERE delivery_id = ?"
        ))
        .bind(&delivery_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(item_from_row).transpose()
    }

    async fn list(
        &self,
        state: Option<OutboxState>,
        limit: u32,
    ) -> Result<Vec<OutboxItem>, RepositoryError> {
        let rows = match state {
            Some(state) => {
                sqlx::query(&format!(
                    "SELECT {OUTBOX_COLUMNS} FROM notification_outbox
                     WHERE state = ?
                     ORDER BY created_at DESC
                     LIMIT ?"
                ))
                .bind(state.as_str())
                .bind(i64::from(limit.max(1)))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {OUTBOX_COLUMNS} FROM notification_outbox
                     ORDER BY created_at DESC
                     LIMIT ?"
                ))
                .bind(i64::from(limit.max(1)))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(item_from_row).collect()
    }

    async fn claim_due(
        &self,
        limit: u32,
        worker: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Vec<OutboxItem>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let claim_cutoff = now - stale_after;

        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM notification_outbox
             WHERE state IN ('pending', 'retrying')
               AND next_attempt_at <= ?
               AND (claimed_at IS NULL OR claimed_at <= ?)
             ORDER BY next_attempt_at ASC, created_at ASC
             LIMIT ?"
        ))
        .bind(fmt_ts(now))
        .bind(fmt_ts(claim_cutoff))
        .bind(i64::from(limit.max(1)))
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let mut item = item_from_row(row)?;
            sqlx::query(
                "UPDATE notification_outbox
                 SET claimed_by = ?, claimed_at = ?, updated_at = ?
                 WHERE delivery_id = ?",
            )
            .bind(worker)
            .bind(fmt_ts(now))
            .bind(fmt_ts(now))
            .bind(&item.delivery_id.0)
            .execute(&mut *tx)
            .await?;

            item.claimed_by = Some(worker.to_string());
            item.claimed_at = Some(now);
            item.updated_at = now;
            claimed.push(item);
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn record_attempt(
        &self,
        delivery_id: &DeliveryId,
        attempt: DeliveryAttempt,
        disposition: AttemptDisposition,
        now: DateTime<Utc>,
    ) -> Result<OutboxItem, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM notification_outbox WHERE delivery_id = ?"
        ))
        .bind(&delivery_id.0)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RepositoryError::NotFound {
            entity: "outbox item",
            id: delivery_id.0.clone(),
        })?;

        let mut item = item_from_row(row)?;

        let next_state = match &disposition {
            AttemptDisposition::Sent => OutboxState::Sent,
            AttemptDisposition::Retry { .. } => OutboxState::Retrying,
            AttemptDisposition::Dead => OutboxState::Dead,
        };
        if !item.state.can_transition_to(next_state) {
            return Err(RepositoryError::InvalidTransition {
                from: item.state.as_str().to_string(),
                to: next_state.as_str().to_string(),
            });
        }

        sqlx::query(
            "INSERT INTO delivery_attempt (
                attempt_id,
                delivery_id,
                attempted_at,
                duration_ms,
                http_status,
                error_code,
                outcome
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&attempt.attempt_id.0)
        .bind(&delivery_id.0)
        .bind(fmt_ts(attempt.attempted_at))
        .bind(i64::try_from(attempt.duration_ms).unwrap_or(i64::MAX))
        .bind(attempt.http_status.map(i64::from))
        .bind(&attempt.error_code)
        .bind(attempt.outcome.as_str())
        .execute(&mut *tx)
        .await?;

        item.state = next_state;
        item.attempt_count += 1;
        item.last_http_status = attempt.http_status;
        item.last_error_code = attempt.error_code.clone();
        if let AttemptDisposition::Retry { next_attempt_at } = &disposition {
            item.next_attempt_at = *next_attempt_at;
        }
        item.claimed_by = None;
        item.claimed_at = None;
        item.updated_at = now;

        sqlx::query(
            "UPDATE notification_outbox
             SET state = ?,
                 attempt_count = ?,
                 last_http_status = ?,
                 last_error_code = ?,
                 next_attempt_at = ?,
                 claimed_by = NULL,
                 claimed_at = NULL,
                 updated_at = ?
             WHERE delivery_id = ?",
        )
        .bind(item.state.as_str())
        .bind(i64::from(item.attempt_count))
        .bind(item.last_http_status.map(i64::from))
        .bind(&item.last_error_code)
        .bind(fmt_ts(item.next_attempt_at))
        .bind(fmt_ts(item.updated_at))
        .bind(&delivery_id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(item)
    }

    async fn replay(
        &self,
        delivery_id: &DeliveryId,
        now: DateTime<Utc>,
    ) -> Result<OutboxItem, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let replayed = replay_in_tx(&mut tx, delivery_id, now).await?;
        tx.commit().await?;
        Ok(replayed)
    }

    async fn replay_dead(
        &self,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxItem>, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "SELECT delivery_id FROM notification_outbox
             WHERE state = 'dead'
             ORDER BY created_at ASC
             LIMIT ?",
        )
        .bind(i64::from(limit.max(1)))
        .fetch_all(&mut *tx)
        .await?;

        let mut replayed = Vec::with_capacity(rows.len());
        for row in rows {
            let delivery_id = DeliveryId(row.try_get("delivery_id")?);
            replayed.push(replay_in_tx(&mut tx, &delivery_id, now).await?);
        }

        tx.commit().await?;
        Ok(replayed)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<OutboxStats, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                COALESCE(SUM(state = 'pending'), 0) AS pending,
                COALESCE(SUM(state = 'retrying'), 0) AS retrying,
                COALESCE(SUM(state = 'sent'), 0) AS sent,
                COALESCE(SUM(state = 'dead'), 0) AS dead,
                MIN(CASE WHEN state = 'pending' THEN created_at END) AS oldest_pending
             FROM notification_outbox",
        )
        .fetch_one(&self.pool)
        .await?;

        let oldest_pending = parse_optional_timestamp(
            "oldest_pending",
            row.try_get::<Option<String>, _>("oldest_pending")?,
        )?;

        Ok(OutboxStats {
            pending: parse_u64("pending", row.try_get("pending")?)?,
            retrying: parse_u64("retrying", row.try_get("retrying")?)?,
            sent: parse_u64("sent", row.try_get("sent")?)?,
            dead: parse_u64("dead", row.try_get("dead")?)?,
            oldest_pending_age_secs: oldest_pending
                .map(|created_at| (now - created_at).num_seconds()),
        })
    }
}

/// Replays leave the source row untouched and insert a fresh PENDING row that
/// reuses the event id so receiver-side dedup still works.
async fn replay_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    delivery_id: &DeliveryId,
    now: DateTime<Utc>,
) -> Result<OutboxItem, RepositoryError> {
    let row = sqlx::query(&format!(
        "SELECT {OUTBOX_COLUMNS} FROM notification_outbox WHERE delivery_id = ?"
    ))
    .bind(&delivery_id.0)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| RepositoryError::NotFound {
        entity: "outbox item",
        id: delivery_id.0.clone(),
    })?;

    let source = item_from_row(row)?;
    if !matches!(source.state, OutboxState::Sent | OutboxState::Dead) {
        return Err(RepositoryError::InvalidTransition {
            from: source.state.as_str().to_string(),
            to: "replayed".to_string(),
        });
    }

    let replayed = OutboxItem {
        delivery_id: DeliveryId(Uuid::new_v4().to_string()),
        event_id: source.event_id.clone(),
        event_type: source.event_type,
        payload_json: source.payload_json.clone(),
        state: OutboxState::Pending,
        attempt_count: 0,
        last_http_status: None,
        last_error_code: None,
        next_attempt_at: now,
        claimed_by: None,
        claimed_at: None,
        replayed_from_id: Some(source.delivery_id.clone()),
        created_at: now,
        updated_at: now,
    };

    insert_outbox_item(tx, &replayed).await?;
    Ok(replayed)
}

fn item_from_row(row: SqliteRow) -> Result<OutboxItem, RepositoryError> {
    let state_raw = row.try_get::<String, _>("state")?;
    let state = OutboxState::parse(&state_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown outbox state: `{state_raw}`"))
    })?;
    let event_type_raw = row.try_get::<String, _>("event_type")?;
    let event_type = EventType::parse(&event_type_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown outbox event type: `{event_type_raw}`"))
    })?;

    Ok(OutboxItem {
        delivery_id: DeliveryId(row.try_get("delivery_id")?),
        event_id: EventId(row.try_get("event_id")?),
        event_type,
        payload_json: row.try_get("payload_json")?,
        state,
        attempt_count: parse_u32("attempt_count", row.try_get("attempt_count")?)?,
        last_http_status: parse_http_status("last_http_status", row.try_get("last_http_status")?)?,
        last_error_code: row.try_get("last_error_code")?,
        next_attempt_at: parse_timestamp("next_attempt_at", row.try_get("next_attempt_at")?)?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: parse_optional_timestamp("claimed_at", row.try_get("claimed_at")?)?,
        replayed_from_id: row
            .try_get::<Option<String>, _>("replayed_from_id")?
            .map(DeliveryId),
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
