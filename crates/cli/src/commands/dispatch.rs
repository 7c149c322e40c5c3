use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::commands::{run_against_database, CommandResult, StepFailure};
use vigil_core::notify::RetryPolicy;
use vigil_db::repositories::SqlOutboxRepository;
use vigil_webhook::{DispatcherConfig, HttpWebhookTransport, WebhookDispatcher};

pub fn run() -> CommandResult {
    run_against_database("dispatch", |config, pool| async move {
        if config.webhook.endpoint_url.is_none() {
            return Ok("no webhook endpoint configured; nothing to dispatch".to_string());
        }

        let transport = HttpWebhookTransport::new(config.webhook.timeout_secs)
            .map_err(|error| StepFailure::new("transport_init", error.to_string(), 6))?;
        let dispatcher = WebhookDispatcher::new(
            Arc::new(SqlOutboxRepository::new(pool.clone())),
            Arc::new(transport),
            DispatcherConfig {
                endpoint_url: config.webhook.endpoint_url.clone(),
                secret: config.webhook.secret.clone(),
                retry: RetryPolicy {
                    max_attempts: config.webhook.max_attempts,
                    base_delay_secs: config.webhook.base_delay_secs,
                    max_delay_secs: config.webhook.max_delay_secs,
                },
                batch_size: config.webhook.batch_size,
                claim_stale_after: Duration::seconds(config.scheduler.lease_ttl_secs as i64),
                worker: "vigil-cli".to_string(),
            },
        );

        let summary = dispatcher
            .run_tick(Utc::now())
            .await
            .map_err(|error| StepFailure::new("dispatch", error.to_string(), 7))?;
        Ok(format!(
            "claimed {}, sent {}, retried {}, dead {}",
            summary.claimed, summary.sent, summary.retried, summary.dead
        ))
    })
}
