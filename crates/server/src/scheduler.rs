use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vigil_core::config::SchedulerConfig;
use vigil_core::domain::lease::{DISPATCH_LEASE, EVALUATE_LEASE};
use vigil_db::repositories::LeaseRepository;
use vigil_webhook::WebhookDispatcher;

use crate::evaluator::EvaluationService;

/// Handle over the background tick tasks. Dropping it does not stop the
/// tasks; call `shutdown` during graceful shutdown.
pub struct SchedulerHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    fn noop() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn is_noop(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

/// One guarded evaluation tick: acquire (or renew) the lease, run the tick,
/// stamp the heartbeat. Returns whether this holder ran the tick.
pub async fn evaluate_tick_guarded(
    leases: &Arc<dyn LeaseRepository>,
    evaluator: &EvaluationService,
    holder: &str,
    lease_ttl_secs: u64,
) -> bool {
    let now = Utc::now();
    let ttl = chrono::Duration::seconds(lease_ttl_secs as i64);

    match leases.acquire(EVALUATE_LEASE, holder, ttl, now).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(
                event_name = "scheduler.lease_held_elsewhere",
                lease = EVALUATE_LEASE,
                holder,
                "skipping evaluate tick"
            );
            return false;
        }
        Err(error) => {
            warn!(
                event_name = "scheduler.lease_acquire_failed",
                lease = EVALUATE_LEASE,
                holder,
                error = %error,
                "skipping evaluate tick"
            );
            return false;
        }
    }

    match evaluator.run_tick(now).await {
        Ok(summary) => {
            if let Err(error) = leases.record_tick(EVALUATE_LEASE, holder, Utc::now()).await {
                warn!(
                    event_name = "scheduler.heartbeat_failed",
                    lease = EVALUATE_LEASE,
                    holder,
                    error = %error,
                    "evaluate heartbeat not recorded"
                );
            }
            if summary.transitions_applied > 0 {
                info!(
                    event_name = "scheduler.evaluate_tick",
                    holder,
                    transitions = summary.transitions_applied,
                    enqueued = summary.notifications_enqueued,
                    "evaluate tick applied transitions"
                );
            }
            true
        }
        Err(error) => {
            warn!(
                event_name = "scheduler.evaluate_tick_failed",
                holder,
                error = %error,
                "evaluate tick failed; will retry on next interval"
            );
            false
        }
    }
}

/// Dispatch twin of `evaluate_tick_guarded`.
pub async fn dispatch_tick_guarded(
    leases: &Arc<dyn LeaseRepository>,
    dispatcher: &WebhookDispatcher,
    holder: &str,
    lease_ttl_secs: u64,
) -> bool {
    let now = Utc::now();
    let ttl = chrono::Duration::seconds(lease_ttl_secs as i64);

    match leases.acquire(DISPATCH_LEASE, holder, ttl, now).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(
                event_name = "scheduler.lease_held_elsewhere",
                lease = DISPATCH_LEASE,
                holder,
                "skipping dispatch tick"
            );
            return false;
        }
        Err(error) => {
            warn!(
                event_name = "scheduler.lease_acquire_failed",
                lease = DISPATCH_LEASE,
                holder,
                error = %error,
                "skipping dispatch tick"
            );
            return false;
        }
    }

    match dispatcher.run_tick(now).await {
        Ok(_) => {
            if let Err(error) = leases.record_tick(DISPATCH_LEASE, holder, Utc::now()).await {
                warn!(
                    event_name = "scheduler.heartbeat_failed",
                    lease = DISPATCH_LEASE,
                    holder,
                    error = %error,
                    "dispatch heartbeat not recorded"
                );
            }
            true
        }
        Err(error) => {
            warn!(
                event_name = "scheduler.dispatch_tick_failed",
                holder,
                error = %error,
                "dispatch tick failed; will retry on next interval"
            );
            false
        }
    }
}

pub fn spawn(
    config: &SchedulerConfig,
    leases: Arc<dyn LeaseRepository>,
    evaluator: Arc<EvaluationService>,
    dispatcher: Arc<WebhookDispatcher>,
    holder: String,
) -> SchedulerHandle {
    if !config.enabled {
        warn!(
            event_name = "scheduler.disabled",
            "scheduler disabled by configuration; evaluate and dispatch run only via the API"
        );
        return SchedulerHandle::noop();
    }

    let lease_ttl_secs = config.lease_ttl_secs;

    let evaluate_task = {
        let leases = leases.clone();
        let holder = holder.clone();
        let interval_secs = config.evaluate_interval_secs;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                evaluate_tick_guarded(&leases, &evaluator, &holder, lease_ttl_secs).await;
            }
        })
    };

    let dispatch_task = {
        let holder = holder.clone();
        let interval_secs = config.dispatch_interval_secs;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                dispatch_tick_guarded(&leases, &dispatcher, &holder, lease_ttl_secs).await;
            }
        })
    };

    info!(
        event_name = "scheduler.started",
        holder = holder.as_str(),
        evaluate_interval_secs = config.evaluate_interval_secs,
        dispatch_interval_secs = config.dispatch_interval_secs,
        lease_ttl_secs,
        "scheduler tick tasks started"
    );

    SchedulerHandle { tasks: vec![evaluate_task, dispatch_task] }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};

    use vigil_core::config::{AppConfig, SchedulerConfig};
    use vigil_core::domain::lease::EVALUATE_LEASE;
    use vigil_db::repositories::{
        LeaseRepository, SqlAlertRepository, SqlLeaseRepository, SqlRunRegistry,
        SqlSilenceRepository,
    };
    use vigil_db::{connect_with_settings, migrations, DbPool};

    use super::{evaluate_tick_guarded, spawn, SchedulerHandle};
    use crate::evaluator::EvaluationService;

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn evaluator(pool: &DbPool) -> EvaluationService {
        EvaluationService::new(
            Arc::new(SqlRunRegistry::new(pool.clone())),
            Arc::new(SqlAlertRepository::new(pool.clone())),
            Arc::new(SqlSilenceRepository::new(pool.clone())),
            &AppConfig::default(),
        )
    }

    #[tokio::test]
    async fn guarded_tick_runs_under_lease_and_stamps_heartbeat() {
        let pool = setup_pool().await;
        let leases: Arc<dyn LeaseRepository> = Arc::new(SqlLeaseRepository::new(pool.clone()));
        let evaluator = evaluator(&pool);

        let ran = evaluate_tick_guarded(&leases, &evaluator, "instance-a", 120).await;
        assert!(ran);

        let lease = leases.find(EVALUATE_LEASE).await.expect("find").expect("present");
        assert_eq!(lease.holder, "instance-a");
        assert!(lease.last_tick_at.is_some());

        pool.close().await;
    }

    #[tokio::test]
    async fn guarded_tick_skips_while_another_holder_owns_the_lease() {
        let pool = setup_pool().await;
        let leases: Arc<dyn LeaseRepository> = Arc::new(SqlLeaseRepository::new(pool.clone()));
        let evaluator = evaluator(&pool);

        leases
            .acquire(EVALUATE_LEASE, "instance-a", Duration::seconds(120), Utc::now())
            .await
            .expect("seed lease");

        let ran = evaluate_tick_guarded(&leases, &evaluator, "instance-b", 120).await;
        assert!(!ran);

        let lease = leases.find(EVALUATE_LEASE).await.expect("find").expect("present");
        assert_eq!(lease.holder, "instance-a");

        pool.close().await;
    }

    #[tokio::test]
    async fn disabled_scheduler_spawns_a_noop_handle() {
        let pool = setup_pool().await;
        let leases: Arc<dyn LeaseRepository> = Arc::new(SqlLeaseRepository::new(pool.clone()));
        let config = SchedulerConfig {
            enabled: false,
            evaluate_interval_secs: 60,
            dispatch_interval_secs: 30,
            lease_ttl_secs: 120,
        };

        let dispatcher = Arc::new(vigil_webhook::WebhookDispatcher::new(
            Arc::new(vigil_db::repositories::SqlOutboxRepository::new(pool.clone())),
            Arc::new(vigil_webhook::HttpWebhookTransport::new(5).expect("transport")),
            vigil_webhook::DispatcherConfig {
                endpoint_url: None,
                secret: None,
                retry: vigil_core::notify::RetryPolicy::default(),
                batch_size: 10,
                claim_stale_after: Duration::seconds(120),
                worker: "test".to_string(),
            },
        ));

        let handle: SchedulerHandle =
            spawn(&config, leases, Arc::new(evaluator(&pool)), dispatcher, "test".to_string());
        assert!(handle.is_noop());
        handle.shutdown();

        pool.close().await;
    }
}
