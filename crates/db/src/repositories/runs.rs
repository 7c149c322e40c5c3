use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row};

use vigil_core::domain::run::{PreflightRun, RunId, RunStatus, SourceName};

use super::{
    fmt_ts, parse_timestamp, parse_u64, RepositoryError, RunFilter, RunRegistry, RunStats,
};
use crate::DbPool;

const RUN_COLUMNS: &str = "run_id, source_name, created_at, validation_status, \
     semantic_status, final_status, blocked, summary_json";

pub struct SqlRunRegistry {
    pool: DbPool,
}

impl SqlRunRegistry {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunRegistry for SqlRunRegistry {
    async fn find_run(
        &self,
        run_id: &RunId,
        source_name: &SourceName,
    ) -> Result<Option<PreflightRun>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM preflight_run WHERE run_id = ? AND source_name = ?"
        ))
        .bind(&run_id.0)
        .bind(&source_name.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(run_from_row).transpose()
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<PreflightRun>, RepositoryError> {
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {RUN_COLUMNS} FROM preflight_run WHERE 1 = 1"));

        if let Some(source_name) = &filter.source_name {
            builder.push(" AND source_name = ").push_bind(source_name.0.clone());
        }
        if let Some(final_status) = filter.final_status {
            builder.push(" AND final_status = ").push_bind(final_status.as_str());
        }
        if let Some(since) = filter.since {
            builder.push(" AND created_at >= ").push_bind(fmt_ts(since));
        }
        if let Some(until) = filter.until {
            builder.push(" AND created_at < ").push_bind(fmt_ts(until));
        }
        builder.push(" ORDER BY created_at DESC");
        builder.push(" LIMIT ").push_bind(i64::from(filter.limit.max(1)));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(run_from_row).collect()
    }

    async fn latest_per_source(&self) -> Result<Vec<PreflightRun>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM preflight_run
             WHERE created_at = (
                 SELECT MAX(newer.created_at)
                 FROM preflight_run AS newer
                 WHERE newer.source_name = preflight_run.source_name
             )
             GROUP BY source_name
             ORDER BY source_name ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(run_from_row).collect()
    }

    async fn recent_for_source(
        &self,
        source_name: &SourceName,
        limit: u32,
    ) -> Result<Vec<PreflightRun>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM preflight_run
             WHERE source_name = ?
             ORDER BY created_at DESC
             LIMIT ?"
        ))
        .bind(&source_name.0)
        .bind(i64::from(limit.max(1)))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(run_from_row).collect()
    }

    async fn insert_run(&self, run: PreflightRun) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO preflight_run (
                run_id,
                source_name,
                created_at,
                validation_status,
                semantic_status,
                final_status,
                blocked,
                summary_json
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.run_id.0)
        .bind(&run.source_name.0)
        .bind(fmt_ts(run.created_at))
        .bind(run.validation_status.as_str())
        .bind(run.semantic_status.as_str())
        .bind(run.final_status.as_str())
        .bind(i64::from(run.blocked))
        .bind(&run.summary_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn run_stats(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<RunStats, RepositoryError> {
        let since = since.map(fmt_ts).unwrap_or_else(|| "".to_string());
        let row = sqlx::query(
            "SELECT
                COUNT(*) AS total,
                COALESCE(SUM(blocked), 0) AS blocked,
                COALESCE(SUM(final_status = 'pass'), 0) AS passed,
                COALESCE(SUM(final_status = 'warn'), 0) AS warned,
                COALESCE(SUM(final_status = 'fail'), 0) AS failed
             FROM preflight_run
             WHERE created_at >= ?",
        )
        .bind(&since)
        .fetch_one(&self.pool)
        .await?;

        Ok(RunStats {
            total: parse_u64("total", row.try_get("total")?)?,
            blocked: parse_u64("blocked", row.try_get("blocked")?)?,
            passed: parse_u64("passed", row.try_get("passed")?)?,
            warned: parse_u64("warned", row.try_get("warned")?)?,
            failed: parse_u64("failed", row.try_get("failed")?)?,
        })
    }
}

fn run_from_row(row: SqliteRow) -> Result<PreflightRun, RepositoryError> {
    let validation_raw = row.try_get::<String, _>("validation_status")?;
    let semantic_raw = row.try_get::<String, _>("semantic_status")?;
    let final_raw = row.try_get::<String, _>("final_status")?;

    Ok(PreflightRun {
        run_id: RunId(row.try_get("run_id")?),
        source_name: SourceName(row.try_get("source_name")?),
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        validation_status: parse_status("validation_status", &validation_raw)?,
        semantic_status: parse_status("semantic_status", &semantic_raw)?,
        final_status: parse_status("final_status", &final_raw)?,
        blocked: row.try_get::<i64, _>("blocked")? != 0,
        summary_json: row.try_get("summary_json")?,
    })
}

fn parse_status(column: &str, value: &str) -> Result<RunStatus, RepositoryError> {
    RunStatus::parse(value).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown run status in `{column}`: `{value}`"))
    })
}
