use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vigil_core::domain::notification::{AttemptId, AttemptOutcome, DeliveryAttempt, OutboxItem};
use vigil_core::notify::{signature_header, RetryPolicy};
use vigil_db::repositories::{AttemptDisposition, OutboxRepository, RepositoryError};

use crate::transport::{TransportError, WebhookRequest, WebhookResponse, WebhookTransport};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Clone)]
pub struct DispatcherConfig {
    pub endpoint_url: Option<String>,
    pub secret: Option<SecretString>,
    pub retry: RetryPolicy,
    pub batch_size: u32,
    /// Claims older than this are treated as abandoned and reclaimed.
    pub claim_stale_after: Duration,
    pub worker: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub claimed: u32,
    pub sent: u32,
    pub retried: u32,
    pub dead: u32,
}

pub struct WebhookDispatcher {
    outbox: Arc<dyn OutboxRepository>,
    transport: Arc<dyn WebhookTransport>,
    config: DispatcherConfig,
}

impl WebhookDispatcher {
    pub fn new(
        outbox: Arc<dyn OutboxRepository>,
        transport: Arc<dyn WebhookTransport>,
        config: DispatcherConfig,
    ) -> Self {
        Self { outbox, transport, config }
    }

    /// One dispatch tick: claim due items, deliver each, and record every
    /// attempt in the ledger before the item counts as handled.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> Result<DispatchSummary, DispatchError> {
        let Some(endpoint_url) = self.config.endpoint_url.clone() else {
            debug!(
                event_name = "notify.dispatch.skipped",
                reason = "no webhook endpoint configured",
                "skipping dispatch tick"
            );
            return Ok(DispatchSummary::default());
        };

        let claimed = self
            .outbox
            .claim_due(
                self.config.batch_size,
                &self.config.worker,
                now,
                self.config.claim_stale_after,
            )
            .await?;

        let mut summary = DispatchSummary { claimed: claimed.len() as u32, ..Default::default() };

        for item in claimed {
            let disposition = self.deliver_one(&endpoint_url, &item, now).await?;
            match disposition {
                AttemptDisposition::Sent => summary.sent += 1,
                AttemptDisposition::Retry { .. } => summary.retried += 1,
                AttemptDisposition::Dead => summary.dead += 1,
            }
        }

        if summary.claimed > 0 {
            info!(
                event_name = "notify.dispatch.tick_completed",
                claimed = summary.claimed,
                sent = summary.sent,
                retried = summary.retried,
                dead = summary.dead,
                "dispatch tick completed"
            );
        }

        Ok(summary)
    }

    async fn deliver_one(
        &self,
        endpoint_url: &str,
        item: &OutboxItem,
        now: DateTime<Utc>,
    ) -> Result<AttemptDisposition, DispatchError> {
        let timestamp = now.timestamp();
        let signature = self.config.secret.as_ref().and_then(|secret| {
            signature_header(secret.expose_secret().as_bytes(), timestamp, &item.payload_json)
        });

        let request = WebhookRequest {
            endpoint_url: endpoint_url.to_string(),
            delivery_id: item.delivery_id.0.clone(),
            event_id: item.event_id.0.clone(),
            timestamp,
            signature,
            payload_json: item.payload_json.clone(),
        };

        let started = std::time::Instant::now();
        let result = self.transport.deliver(&request).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (outcome, http_status, error_code) = classify_response(&result);
        let attempt_count_after = item.attempt_count + 1;
        let disposition =
            disposition_for(outcome, attempt_count_after, &self.config.retry, now);

        let attempt = DeliveryAttempt {
            attempt_id: AttemptId(Uuid::new_v4().to_string()),
            delivery_id: item.delivery_id.clone(),
            attempted_at: now,
            duration_ms,
            http_status,
            error_code: error_code.clone(),
            outcome,
        };

        self.outbox
            .record_attempt(&item.delivery_id, attempt, disposition.clone(), now)
            .await?;

        match &disposition {
            AttemptDisposition::Sent => info!(
                event_name = "notify.dispatch.delivered",
                delivery_id = %item.delivery_id.0,
                event_id = %item.event_id.0,
                attempt = attempt_count_after,
                duration_ms,
                "webhook delivered"
            ),
            AttemptDisposition::Retry { next_attempt_at } => warn!(
                event_name = "notify.dispatch.retry_scheduled",
                delivery_id = %item.delivery_id.0,
                event_id = %item.event_id.0,
                attempt = attempt_count_after,
                http_status = http_status.map(i64::from).unwrap_or(-1),
                error_code = error_code.as_deref().unwrap_or("none"),
                next_attempt_at = %next_attempt_at,
                "webhook delivery failed; retry scheduled"
            ),
            AttemptDisposition::Dead => warn!(
                event_name = "notify.dispatch.dead_lettered",
                delivery_id = %item.delivery_id.0,
                event_id = %item.event_id.0,
                attempt = attempt_count_after,
                http_status = http_status.map(i64::from).unwrap_or(-1),
                error_code = error_code.as_deref().unwrap_or("none"),
                "webhook delivery dead-lettered"
            ),
        }

        Ok(disposition)
    }
}

/// 2xx delivers; 4xx other than 429 is permanent; everything else (5xx, 429,
/// timeouts, connection failures) is transient.
pub fn classify_response(
    result: &Result<WebhookResponse, TransportError>,
) -> (AttemptOutcome, Option<u16>, Option<String>) {
    match result {
        Ok(response) => {
            let status = response.status;
            match status {
                200..=299 => (AttemptOutcome::Delivered, Some(status), None),
                429 => {
                    (AttemptOutcome::TransientFailure, Some(status), Some(format!("http_{status}")))
                }
                400..=499 => {
                    (AttemptOutcome::PermanentFailure, Some(status), Some(format!("http_{status}")))
                }
                _ => {
                    (AttemptOutcome::TransientFailure, Some(status), Some(format!("http_{status}")))
                }
            }
        }
        Err(error) => {
            (AttemptOutcome::TransientFailure, None, Some(error.error_code().to_string()))
        }
    }
}

pub fn disposition_for(
    outcome: AttemptOutcome,
    attempt_count_after: u32,
    retry: &RetryPolicy,
    now: DateTime<Utc>,
) -> AttemptDisposition {
    match outcome {
        AttemptOutcome::Delivered => AttemptDisposition::Sent,
        AttemptOutcome::PermanentFailure => AttemptDisposition::Dead,
        AttemptOutcome::TransientFailure => {
            if retry.attempts_exhausted(attempt_count_after) {
                AttemptDisposition::Dead
            } else {
                let delay = retry.backoff_with_jitter(attempt_count_after);
                AttemptDisposition::Retry {
                    next_attempt_at: now + Duration::seconds(delay.as_secs() as i64),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use secrecy::SecretString;
    use tokio::sync::Mutex;

    use vigil_core::domain::notification::{
        AttemptOutcome, DeliveryId, EventId, EventType, OutboxItem, OutboxState,
    };
    use vigil_core::notify::{verify_signature, RetryPolicy};
    use vigil_db::repositories::{
        AttemptDisposition, LedgerRepository, OutboxRepository, SqlLedgerRepository,
        SqlOutboxRepository,
    };
    use vigil_db::{connect_with_settings, migrations, DbPool};

    use super::{
        classify_response, disposition_for, DispatcherConfig, WebhookDispatcher,
    };
    use crate::transport::{TransportError, WebhookRequest, WebhookResponse, WebhookTransport};

    struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<WebhookResponse, TransportError>>>,
        requests: Mutex<Vec<WebhookRequest>>,
    }

    impl ScriptedTransport {
        fn with_script(responses: Vec<Result<WebhookResponse, TransportError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        async fn requests(&self) -> Vec<WebhookRequest> {
            self.requests.lock().await.clone()
        }
    }

    #[async_trait]
    impl WebhookTransport for ScriptedTransport {
        async fn deliver(
            &self,
            request: &WebhookRequest,
        ) -> Result<WebhookResponse, TransportError> {
            self.requests.lock().await.push(request.clone());
            self.responses
                .lock()
                .await
                .pop_front()
                .unwrap_or(Ok(WebhookResponse { status: 200 }))
        }
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn outbox_item(delivery_id: &str, event_id: &str) -> OutboxItem {
        let now = Utc::now();
        OutboxItem {
            delivery_id: DeliveryId(delivery_id.to_string()),
            event_id: EventId(event_id.to_string()),
            event_type: EventType::AlertFiring,
            payload_json: r#"{"event_type":"alert_firing","source_name":"train"}"#.to_string(),
            state: OutboxState::Pending,
            attempt_count: 0,
            last_http_status: None,
            last_error_code: None,
            next_attempt_at: now - Duration::seconds(1),
            claimed_by: None,
            claimed_at: None,
            replayed_from_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn config(secret: Option<&str>, max_attempts: u32) -> DispatcherConfig {
        DispatcherConfig {
            endpoint_url: Some("https://receiver.example/hook".to_string()),
            secret: secret.map(|value| SecretString::from(value.to_string())),
            retry: RetryPolicy { max_attempts, base_delay_secs: 30, max_delay_secs: 900 },
            batch_size: 10,
            claim_stale_after: Duration::minutes(5),
            worker: "test-worker".to_string(),
        }
    }

    fn dispatcher(
        pool: &DbPool,
        transport: Arc<ScriptedTransport>,
        config: DispatcherConfig,
    ) -> WebhookDispatcher {
        WebhookDispatcher::new(
            Arc::new(SqlOutboxRepository::new(pool.clone())),
            transport,
            config,
        )
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success_with_full_ledger() {
        let pool = setup_pool().await;
        let outbox = SqlOutboxRepository::new(pool.clone());
        let ledger = SqlLedgerRepository::new(pool.clone());
        let delivery_id = DeliveryId("d-1".to_string());

        outbox.enqueue(outbox_item("d-1", "evt-1")).await.expect("enqueue");

        let transport = Arc::new(ScriptedTransport::with_script(vec![
            Ok(WebhookResponse { status: 503 }),
            Ok(WebhookResponse { status: 503 }),
            Ok(WebhookResponse { status: 503 }),
            Ok(WebhookResponse { status: 200 }),
        ]));
        let dispatcher = dispatcher(&pool, transport.clone(), config(None, 8));

        // Walk time forward far enough to clear each scheduled backoff.
        let mut now = Utc::now();
        for _ in 0..4 {
            dispatcher.run_tick(now).await.expect("tick");
            now += Duration::seconds(2000);
        }

        let item = outbox.find(&delivery_id).await.expect("find").expect("present");
        assert_eq!(item.state, OutboxState::Sent);
        assert_eq!(item.attempt_count, 4);

        let attempts = ledger.list_for_delivery(&delivery_id).await.expect("ledger");
        assert_eq!(attempts.len(), 4);
        assert_eq!(attempts[0].outcome, AttemptOutcome::TransientFailure);
        assert_eq!(attempts[3].outcome, AttemptOutcome::Delivered);
        assert_eq!(attempts[3].http_status, Some(200));

        pool.close().await;
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_after_exactly_one_attempt() {
        let pool = setup_pool().await;
        let outbox = SqlOutboxRepository::new(pool.clone());
        let ledger = SqlLedgerRepository::new(pool.clone());
        let delivery_id = DeliveryId("d-1".to_string());

        outbox.enqueue(outbox_item("d-1", "evt-1")).await.expect("enqueue");

        let transport = Arc::new(ScriptedTransport::with_script(vec![Ok(WebhookResponse {
            status: 400,
        })]));
        let dispatcher = dispatcher(&pool, transport.clone(), config(None, 8));

        let summary = dispatcher.run_tick(Utc::now()).await.expect("tick");
        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.dead, 1);

        let item = outbox.find(&delivery_id).await.expect("find").expect("present");
        assert_eq!(item.state, OutboxState::Dead);
        assert_eq!(item.attempt_count, 1);
        assert_eq!(item.last_http_status, Some(400));

        let attempts = ledger.list_for_delivery(&delivery_id).await.expect("ledger");
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::PermanentFailure);

        pool.close().await;
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_the_item() {
        let pool = setup_pool().await;
        let outbox = SqlOutboxRepository::new(pool.clone());

        outbox.enqueue(outbox_item("d-1", "evt-1")).await.expect("enqueue");

        let transport = Arc::new(ScriptedTransport::with_script(vec![
            Err(TransportError::Timeout("deadline exceeded".to_string())),
            Err(TransportError::Connect("refused".to_string())),
        ]));
        let dispatcher = dispatcher(&pool, transport.clone(), config(None, 2));

        let mut now = Utc::now();
        dispatcher.run_tick(now).await.expect("first tick");
        now += Duration::seconds(2000);
        let summary = dispatcher.run_tick(now).await.expect("second tick");
        assert_eq!(summary.dead, 1);

        let item = outbox
            .find(&DeliveryId("d-1".to_string()))
            .await
            .expect("find")
            .expect("present");
        assert_eq!(item.state, OutboxState::Dead);
        assert_eq!(item.attempt_count, 2);
        assert_eq!(item.last_error_code.as_deref(), Some("connect"));

        pool.close().await;
    }

    #[tokio::test]
    async fn requests_carry_identity_headers_and_verifiable_signature() {
        let pool = setup_pool().await;
        let outbox = SqlOutboxRepository::new(pool.clone());

        outbox.enqueue(outbox_item("d-1", "evt-1")).await.expect("enqueue");

        let transport = Arc::new(ScriptedTransport::with_script(vec![Ok(WebhookResponse {
            status: 200,
        })]));
        let dispatcher = dispatcher(&pool, transport.clone(), config(Some("hook-secret"), 8));

        dispatcher.run_tick(Utc::now()).await.expect("tick");

        let requests = transport.requests().await;
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.delivery_id, "d-1");
        assert_eq!(request.event_id, "evt-1");

        let signature = request.signature.as_deref().expect("signature present");
        assert!(verify_signature(
            b"hook-secret",
            request.timestamp,
            &request.payload_json,
            signature,
        ));

        pool.close().await;
    }

    #[tokio::test]
    async fn unconfigured_endpoint_skips_the_tick_without_claiming() {
        let pool = setup_pool().await;
        let outbox = SqlOutboxRepository::new(pool.clone());

        outbox.enqueue(outbox_item("d-1", "evt-1")).await.expect("enqueue");

        let transport = Arc::new(ScriptedTransport::with_script(vec![]));
        let mut config = config(None, 8);
        config.endpoint_url = None;
        let dispatcher = dispatcher(&pool, transport.clone(), config);

        let summary = dispatcher.run_tick(Utc::now()).await.expect("tick");
        assert_eq!(summary.claimed, 0);
        assert!(transport.requests().await.is_empty());

        let item = outbox
            .find(&DeliveryId("d-1".to_string()))
            .await
            .expect("find")
            .expect("present");
        assert_eq!(item.state, OutboxState::Pending);
        assert_eq!(item.claimed_by, None);

        pool.close().await;
    }

    #[test]
    fn classification_covers_status_classes_and_transport_errors() {
        let (outcome, status, code) = classify_response(&Ok(WebhookResponse { status: 204 }));
        assert_eq!(outcome, AttemptOutcome::Delivered);
        assert_eq!(status, Some(204));
        assert_eq!(code, None);

        let (outcome, _, code) = classify_response(&Ok(WebhookResponse { status: 429 }));
        assert_eq!(outcome, AttemptOutcome::TransientFailure);
        assert_eq!(code.as_deref(), Some("http_429"));

        let (outcome, _, code) = classify_response(&Ok(WebhookResponse { status: 404 }));
        assert_eq!(outcome, AttemptOutcome::PermanentFailure);
        assert_eq!(code.as_deref(), Some("http_404"));

        let (outcome, _, _) = classify_response(&Ok(WebhookResponse { status: 500 }));
        assert_eq!(outcome, AttemptOutcome::TransientFailure);

        let (outcome, status, code) =
            classify_response(&Err(TransportError::Timeout("slow".to_string())));
        assert_eq!(outcome, AttemptOutcome::TransientFailure);
        assert_eq!(status, None);
        assert_eq!(code.as_deref(), Some("timeout"));
    }

    #[test]
    fn disposition_schedules_retry_with_backoff_until_exhaustion() {
        let retry = RetryPolicy { max_attempts: 3, base_delay_secs: 30, max_delay_secs: 900 };
        let now = Utc::now();

        match disposition_for(AttemptOutcome::TransientFailure, 1, &retry, now) {
            AttemptDisposition::Retry { next_attempt_at } => {
                let delay = (next_attempt_at - now).num_seconds();
                assert!((30..=33).contains(&delay), "unexpected delay {delay}s");
            }
            other => panic!("expected retry, got {other:?}"),
        }

        assert_eq!(
            disposition_for(AttemptOutcome::TransientFailure, 3, &retry, now),
            AttemptDisposition::Dead
        );
        assert_eq!(disposition_for(AttemptOutcome::Delivered, 1, &retry, now), AttemptDisposition::Sent);
        assert_eq!(
            disposition_for(AttemptOutcome::PermanentFailure, 1, &retry, now),
            AttemptDisposition::Dead
        );
    }
}
