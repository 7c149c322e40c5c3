use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row};

use vigil_core::domain::notification::{
    AttemptId, AttemptOutcome, DeliveryAttempt, DeliveryId,
};

use super::{
    parse_http_status, parse_timestamp, parse_u64, LatencySummary, LedgerRepository,
    RepositoryError,
};
use crate::DbPool;

const ATTEMPT_COLUMNS: &str =
    "attempt_id, delivery_id, attempted_at, duration_ms, http_status, error_code, outcome";

pub struct SqlLedgerRepository {
    pool: DbPool,
}

impl SqlLedgerRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerRepository for SqlLedgerRepository {
    async fn list_for_delivery(
        &self,
        delivery_id: &DeliveryId,
    ) -> Result<Vec<DeliveryAttempt>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempt
             WHERE delivery_id = ?
             ORDER BY attempted_at ASC"
        ))
        .bind(&delivery_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(attempt_from_row).collect()
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<DeliveryAttempt>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempt
             ORDER BY attempted_at DESC
             LIMIT ?"
        ))
        .bind(i64::from(limit.max(1)))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(attempt_from_row).collect()
    }

    async fn outcome_counts(&self) -> Result<Vec<(AttemptOutcome, u64)>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT outcome, COUNT(*) AS count
             FROM delivery_attempt
             GROUP BY outcome
             ORDER BY outcome ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let raw = row.try_get::<String, _>("outcome")?;
                let outcome = AttemptOutcome::parse(&raw).ok_or_else(|| {
                    RepositoryError::Decode(format!("unknown attempt outcome: `{raw}`"))
                })?;
                let count = parse_u64("count", row.try_get("count")?)?;
                Ok((outcome, count))
            })
            .collect()
    }

    async fn error_code_counts(
        &self,
        limit: u32,
    ) -> Result<Vec<(String, u64)>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT error_code, COUNT(*) AS count
             FROM delivery_attempt
             WHERE error_code IS NOT NULL
             GROUP BY error_code
             ORDER BY count DESC, error_code ASC
             LIMIT ?",
        )
        .bind(i64::from(limit.max(1)))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let error_code = row.try_get::<String, _>("error_code")?;
                let count = parse_u64("count", row.try_get("count")?)?;
                Ok((error_code, count))
            })
            .collect()
    }

    async fn latency_summary(
        &self,
        bucket_bounds_ms: &[u64],
    ) -> Result<LatencySummary, RepositoryError> {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "SELECT COUNT(*) AS count, COALESCE(SUM(duration_ms), 0) AS sum_ms",
        );
        for (index, bound) in bucket_bounds_ms.iter().enumerate() {
            builder.push(", COALESCE(SUM(duration_ms <= ");
            builder.push_bind(i64::try_from(*bound).unwrap_or(i64::MAX));
            builder.push(format!("), 0) AS bucket_{index}"));
        }
        builder.push(" FROM delivery_attempt");

        let row = builder.build().fetch_one(&self.pool).await?;

        let mut bucket_counts = Vec::with_capacity(bucket_bounds_ms.len());
        for index in 0..bucket_bounds_ms.len() {
            let column = format!("bucket_{index}");
            bucket_counts.push(parse_u64(&column, row.try_get(column.as_str())?)?);
        }

        Ok(LatencySummary {
            bucket_counts,
            count: parse_u64("count", row.try_get("count")?)?,
            sum_ms: parse_u64("sum_ms", row.try_get("sum_ms")?)?,
        })
    }
}

fn attempt_from_row(row: SqliteRow) -> Result<DeliveryAttempt, RepositoryError> {
    let outcome_raw = row.try_get::<String, _>("outcome")?;
    let outcome = AttemptOutcome::parse(&outcome_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown attempt outcome: `{outcome_raw}`"))
    })?;

    Ok(DeliveryAttempt {
        attempt_id: AttemptId(row.try_get("attempt_id")?),
        delivery_id: DeliveryId(row.try_get("delivery_id")?),
        attempted_at: parse_timestamp("attempted_at", row.try_get("attempted_at")?)?,
        duration_ms: parse_u64("duration_ms", row.try_get("duration_ms")?)?,
        http_status: parse_http_status("http_status", row.try_get("http_status")?)?,
        error_code: row.try_get("error_code")?,
        outcome,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use vigil_core::domain::notification::{
        AttemptId, AttemptOutcome, DeliveryAttempt, DeliveryId,
    };

    use super::SqlLedgerRepository;
    use crate::repositories::outbox::tests::outbox_fixture;
    use crate::repositories::{
        AttemptDisposition, LedgerRepository, OutboxRepository, SqlOutboxRepository,
    };
    use crate::test_support::setup_pool;

    async fn seed_attempts(pool: &crate::DbPool) {
        let outbox = SqlOutboxRepository::new(pool.clone());
        let now = Utc::now();
        outbox.enqueue(outbox_fixture("d-1", "evt-1")).await.expect("enqueue");

        let attempts = [
            (AttemptOutcome::TransientFailure, Some(503), Some("http_503"), 10, 0),
            (AttemptOutcome::TransientFailure, Some(503), Some("http_503"), 120, 1),
            (AttemptOutcome::Delivered, Some(200), None, 45, 2),
        ];
        for (index, (outcome, status, error_code, duration_ms, minute)) in
            attempts.into_iter().enumerate()
        {
            let disposition = match outcome {
                AttemptOutcome::Delivered => AttemptDisposition::Sent,
                _ => AttemptDisposition::Retry {
                    next_attempt_at: now + Duration::minutes(minute + 1),
                },
            };
            outbox
                .record_attempt(
                    &DeliveryId("d-1".to_string()),
                    DeliveryAttempt {
                        attempt_id: AttemptId(format!("a-{index}")),
                        delivery_id: DeliveryId("d-1".to_string()),
                        attempted_at: now + Duration::minutes(minute),
                        duration_ms,
                        http_status: status,
                        error_code: error_code.map(str::to_string),
                        outcome,
                    },
                    disposition,
                    now,
                )
                .await
                .expect("record attempt");
        }
    }

    #[tokio::test]
    async fn list_for_delivery_returns_attempts_in_order() {
        let pool = setup_pool().await;
        seed_attempts(&pool).await;
        let ledger = SqlLedgerRepository::new(pool.clone());

        let attempts = ledger
            .list_for_delivery(&DeliveryId("d-1".to_string()))
            .await
            .expect("list attempts");

        assert_eq!(attempts.len(), 3);
        assert_eq!(
            attempts.iter().map(|a| a.attempt_id.0.as_str()).collect::<Vec<_>>(),
            vec!["a-0", "a-1", "a-2"]
        );
        assert_eq!(attempts[2].outcome, AttemptOutcome::Delivered);

        let recent = ledger.list_recent(2).await.expect("recent attempts");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].attempt_id.0, "a-2");

        pool.close().await;
    }

    #[tokio::test]
    async fn outcome_and_error_code_counts_aggregate_the_ledger() {
        let pool = setup_pool().await;
        seed_attempts(&pool).await;
        let ledger = SqlLedgerRepository::new(pool.clone());

        let outcomes = ledger.outcome_counts().await.expect("outcome counts");
        assert!(outcomes.contains(&(AttemptOutcome::Delivered, 1)));
        assert!(outcomes.contains(&(AttemptOutcome::TransientFailure, 2)));

        let error_codes = ledger.error_code_counts(10).await.expect("error code counts");
        assert_eq!(error_codes, vec![("http_503".to_string(), 2)]);

        pool.close().await;
    }

    #[tokio::test]
    async fn latency_summary_buckets_are_cumulative() {
        let pool = setup_pool().await;
        seed_attempts(&pool).await;
        let ledger = SqlLedgerRepository::new(pool.clone());

        // Durations seeded: 10ms, 120ms, 45ms.
        let summary = ledger.latency_summary(&[25, 100, 500]).await.expect("latency summary");

        assert_eq!(summary.count, 3);
        assert_eq!(summary.sum_ms, 175);
        assert_eq!(summary.bucket_counts, vec![1, 2, 3]);

        pool.close().await;
    }
}
