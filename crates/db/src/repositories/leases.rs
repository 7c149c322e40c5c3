use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use vigil_core::domain::lease::SchedulerLease;

use super::{fmt_ts, parse_optional_timestamp, parse_timestamp, LeaseRepository, RepositoryError};
use crate::DbPool;

const LEASE_COLUMNS: &str = "lease_name, holder, acquired_at, expires_at, last_tick_at";

pub struct SqlLeaseRepository {
    pool: DbPool,
}

impl SqlLeaseRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseRepository for SqlLeaseRepository {
    async fn acquire(
        &self,
        lease_name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let expires_at = now + ttl;

        // Single conditional upsert: take the row when it is absent, expired,
        // or already ours; a live lease held elsewhere leaves it untouched.
        let result = sqlx::query(
            "INSERT INTO scheduler_lease (lease_name, holder, acquired_at, expires_at, last_tick_at)
             VALUES (?, ?, ?, ?, NULL)
             ON CONFLICT (lease_name) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = CASE
                    WHEN scheduler_lease.holder = excluded.holder
                         AND scheduler_lease.expires_at > excluded.acquired_at
                    THEN scheduler_lease.acquired_at
                    ELSE excluded.acquired_at
                END,
                expires_at = excluded.expires_at,
                last_tick_at = CASE
                    WHEN scheduler_lease.holder = excluded.holder
                         AND scheduler_lease.expires_at > excluded.acquired_at
                    THEN scheduler_lease.last_tick_at
                    ELSE NULL
                END
             WHERE scheduler_lease.expires_at <= excluded.acquired_at
                OR scheduler_lease.holder = excluded.holder",
        )
        .bind(lease_name)
        .bind(holder)
        .bind(fmt_ts(now))
        .bind(fmt_ts(expires_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_tick(
        &self,
        lease_name: &str,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE scheduler_lease
             SET last_tick_at = ?
             WHERE lease_name = ? AND holder = ?",
        )
        .bind(fmt_ts(now))
        .bind(lease_name)
        .bind(holder)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound {
                entity: "scheduler lease",
                id: format!("{lease_name}/{holder}"),
            });
        }

        Ok(())
    }

    async fn find(&self, lease_name: &str) -> Result<Option<SchedulerLease>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {LEASE_COLUMNS} FROM scheduler_lease WHERE lease_name = ?"
        ))
        .bind(lease_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(lease_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<SchedulerLease>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {LEASE_COLUMNS} FROM scheduler_lease ORDER BY lease_name ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(lease_from_row).collect()
    }
}

fn lease_from_row(row: SqliteRow) -> Result<SchedulerLease, RepositoryError> {
    Ok(SchedulerLease {
        lease_name: row.try_get("lease_name")?,
        holder: row.try_get("holder")?,
        acquired_at: parse_timestamp("acquired_at", row.try_get("acquired_at")?)?,
        expires_at: parse_timestamp("expires_at", row.try_get("expires_at")?)?,
        last_tick_at: parse_optional_timestamp("last_tick_at", row.try_get("last_tick_at")?)?,
    })
}
