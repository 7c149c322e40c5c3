//! SQLite persistence for the alerting core: connection management,
//! migrations, and repository implementations over the run read model,
//! alert state, silences, notification outbox, delivery ledger, and
//! scheduler leases.

pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with_settings, DbPool};
