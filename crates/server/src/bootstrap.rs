use std::sync::Arc;

use chrono::Duration;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use vigil_core::config::{AppConfig, ConfigError, LoadOptions};
use vigil_db::repositories::{
    LeaseRepository, SqlAlertRepository, SqlLeaseRepository, SqlLedgerRepository,
    SqlOutboxRepository, SqlRunRegistry, SqlSilenceRepository,
};
use vigil_db::{connect, migrations, DbPool};
use vigil_webhook::{
    DispatcherConfig, HttpWebhookTransport, TransportError, WebhookDispatcher,
};

use vigil_core::notify::RetryPolicy;

use crate::api::ApiState;
use crate::evaluator::EvaluationService;
use crate::metrics::MetricsRenderer;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    /// Stable per-process identity used as lease holder and claim worker id.
    pub instance_id: String,
    pub leases: Arc<dyn LeaseRepository>,
    pub evaluator: Arc<EvaluationService>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub api_state: ApiState,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("webhook transport initialization failed: {0}")]
    Transport(#[source] TransportError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let instance_id = format!("vigil-{}", &Uuid::new_v4().simple().to_string()[..12]);

    let runs = Arc::new(SqlRunRegistry::new(db_pool.clone()));
    let alerts = Arc::new(SqlAlertRepository::new(db_pool.clone()));
    let silences = Arc::new(SqlSilenceRepository::new(db_pool.clone()));
    let outbox = Arc::new(SqlOutboxRepository::new(db_pool.clone()));
    let ledger = Arc::new(SqlLedgerRepository::new(db_pool.clone()));
    let leases: Arc<dyn LeaseRepository> = Arc::new(SqlLeaseRepository::new(db_pool.clone()));

    let evaluator = Arc::new(EvaluationService::new(
        runs.clone(),
        alerts.clone(),
        silences.clone(),
        &config,
    ));

    let transport = Arc::new(
        HttpWebhookTransport::new(config.webhook.timeout_secs)
            .map_err(BootstrapError::Transport)?,
    );
    let dispatcher = Arc::new(WebhookDispatcher::new(
        outbox.clone(),
        transport,
        DispatcherConfig {
            endpoint_url: config.webhook.endpoint_url.clone(),
            secret: config.webhook.secret.clone(),
            retry: RetryPolicy {
                max_attempts: config.webhook.max_attempts,
                base_delay_secs: config.webhook.base_delay_secs,
                max_delay_secs: config.webhook.max_delay_secs,
            },
            batch_size: config.webhook.batch_size,
            // Abandoned claims become reclaimable once the dispatch lease
            // they were claimed under has certainly expired.
            claim_stale_after: Duration::seconds(config.scheduler.lease_ttl_secs as i64),
            worker: instance_id.clone(),
        },
    ));

    let metrics = Arc::new(MetricsRenderer::new(
        runs.clone(),
        alerts.clone(),
        silences.clone(),
        outbox.clone(),
        ledger.clone(),
        leases.clone(),
        &config.policies,
    ));

    let api_state = ApiState {
        runs,
        alerts,
        silences,
        outbox,
        ledger,
        evaluator: evaluator.clone(),
        dispatcher: dispatcher.clone(),
        metrics,
    };

    info!(
        event_name = "system.bootstrap.completed",
        correlation_id = "bootstrap",
        instance_id = %instance_id,
        policies = config.policies.len(),
        webhook_configured = config.webhook.endpoint_url.is_some(),
        "application bootstrap completed"
    );

    Ok(Application { config, db_pool, instance_id, leases, evaluator, dispatcher, api_state })
}
