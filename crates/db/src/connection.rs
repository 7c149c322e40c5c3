use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;

use vigil_core::config::DatabaseConfig;

pub type DbPool = sqlx::SqlitePool;

/// Session pragmas applied to every pooled connection. WAL lets dispatcher
/// claim transactions run alongside API reads, foreign keys guard the
/// outbox -> delivery_attempt lineage, and the busy timeout rides out writer
/// contention between the evaluate and dispatch ticks.
const SESSION_PRAGMAS: &[&str] = &[
    "PRAGMA foreign_keys = ON",
    "PRAGMA journal_mode = WAL",
    "PRAGMA busy_timeout = 5000",
];

/// Open the pool described by the `[database]` section of the config.
pub async fn connect(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    connect_with_settings(&config.url, config.max_connections, config.timeout_secs).await
}

pub async fn connect_with_settings(
    url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(timeout_secs.max(1)))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                for pragma in SESSION_PRAGMAS {
                    sqlx::query(pragma).execute(&mut *conn).await?;
                }
                Ok(())
            })
        })
        .connect(url)
        .await
}
