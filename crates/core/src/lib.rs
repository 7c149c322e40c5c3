pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod evaluate;
pub mod notify;

pub use chrono;

pub use audit::{AuditCategory, AuditEvent, AuditOutcome};
pub use domain::alert::{
    AlertPhase, AlertPolicy, AlertRule, AlertState, AlertTransition, PolicyId, Severity,
    TransitionKind,
};
pub use domain::lease::{SchedulerLease, DISPATCH_LEASE, EVALUATE_LEASE};
pub use domain::notification::{
    AttemptId, AttemptOutcome, DeliveryAttempt, DeliveryId, EventId, EventType, OutboxItem,
    OutboxState,
};
pub use domain::run::{PreflightRun, RunId, RunStatus, SourceName};
pub use domain::silence::{Silence, SilenceId};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use evaluate::{advance_phase, condition_holds, PhaseDecision};
pub use notify::{derive_event_id, outbox_item_for, NotificationPayload, RetryPolicy};
