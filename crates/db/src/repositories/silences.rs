use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use vigil_core::domain::alert::{PolicyId, Severity};
use vigil_core::domain::run::SourceName;
use vigil_core::domain::silence::{Silence, SilenceId};

use super::{fmt_ts, parse_timestamp, RepositoryError, SilenceRepository};
use crate::DbPool;

const SILENCE_COLUMNS: &str = "id, policy_id, source_name, severity, starts_at, ends_at, \
     created_by, comment, expired, created_at";

pub struct SqlSilenceRepository {
    pool: DbPool,
}

impl SqlSilenceRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SilenceRepository for SqlSilenceRepository {
    async fn create(&self, silence: Silence) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO silence (
                id,
                policy_id,
                source_name,
                severity,
                starts_at,
                ends_at,
                created_by,
                comment,
                expired,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&silence.id.0)
        .bind(silence.policy_id.as_ref().map(|id| id.0.clone()))
        .bind(silence.source_name.as_ref().map(|source| source.0.clone()))
        .bind(silence.severity.map(|severity| severity.as_str()))
        .bind(fmt_ts(silence.starts_at))
        .bind(fmt_ts(silence.ends_at))
        .bind(&silence.created_by)
        .bind(&silence.comment)
        .bind(i64::from(silence.expired))
        .bind(fmt_ts(silence.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(&self, id: &SilenceId) -> Result<Option<Silence>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {SILENCE_COLUMNS} FROM silence WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(silence_from_row).transpose()
    }

    async fn expire(&self, id: &SilenceId) -> Result<Silence, RepositoryError> {
        let result = sqlx::query("UPDATE silence SET expired = 1 WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound { entity: "silence", id: id.0.clone() });
        }

        self.find(id).await?.ok_or_else(|| RepositoryError::NotFound {
            entity: "silence",
            id: id.0.clone(),
        })
    }

    async fn list(&self, include_expired: bool) -> Result<Vec<Silence>, RepositoryError> {
        let rows = if include_expired {
            sqlx::query(&format!(
                "SELECT {SILENCE_COLUMNS} FROM silence ORDER BY created_at DESC"
            ))
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {SILENCE_COLUMNS} FROM silence WHERE expired = 0 ORDER BY created_at DESC"
            ))
            .fetch_all(&self.pool)
            .await?
        };

        rows.into_iter().map(silence_from_row).collect()
    }

    async fn active_at(&self, at: DateTime<Utc>) -> Result<Vec<Silence>, RepositoryError> {
        let at = fmt_ts(at);
        let rows = sqlx::query(&format!(
            "SELECT {SILENCE_COLUMNS} FROM silence
             WHERE expired = 0 AND starts_at <= ? AND ? < ends_at
             ORDER BY created_at DESC"
        ))
        .bind(&at)
        .bind(&at)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(silence_from_row).collect()
    }
}

fn silence_from_row(row: SqliteRow) -> Result<Silence, RepositoryError> {
    let severity = row
        .try_get::<Option<String>, _>("severity")?
        .map(|raw| {
            Severity::parse(&raw).ok_or_else(|| {
                RepositoryError::Decode(format!("unknown silence severity: `{raw}`"))
            })
        })
        .transpose()?;

    Ok(Silence {
        id: SilenceId(row.try_get("id")?),
        policy_id: row.try_get::<Option<String>, _>("policy_id")?.map(PolicyId),
        source_name: row.try_get::<Option<String>, _>("source_name")?.map(SourceName),
        severity,
        starts_at: parse_timestamp("starts_at", row.try_get("starts_at")?)?,
        ends_at: parse_timestamp("ends_at", row.try_get("ends_at")?)?,
        created_by: row.try_get("created_by")?,
        comment: row.try_get("comment")?,
        expired: row.try_get::<i64, _>("expired")? != 0,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}
