pub mod config;
pub mod dispatch;
pub mod doctor;
pub mod evaluate;
pub mod migrate;
pub mod replay_dead;

use std::future::Future;

use serde::Serialize;

use vigil_core::config::{AppConfig, LoadOptions};
use vigil_db::{connect, migrations, DbPool};

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::finish(
            CommandOutcome {
                command: command.to_string(),
                status: "ok".to_string(),
                error_class: None,
                message: message.into(),
            },
            0,
        )
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        Self::finish(
            CommandOutcome {
                command: command.to_string(),
                status: "error".to_string(),
                error_class: Some(error_class.to_string()),
                message: message.into(),
            },
            exit_code,
        )
    }

    fn finish(payload: CommandOutcome, exit_code: u8) -> Self {
        let output = serde_json::to_string(&payload).unwrap_or_else(|error| {
            format!(
                "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
                error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
            )
        });
        Self { exit_code, output }
    }
}

/// Failure from one step of a database-backed command, carrying the class
/// and exit code that `CommandResult::failure` reports.
pub(crate) struct StepFailure {
    pub error_class: &'static str,
    pub message: String,
    pub exit_code: u8,
}

impl StepFailure {
    pub(crate) fn new(
        error_class: &'static str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        Self { error_class, message: message.into(), exit_code }
    }
}

/// Shared preamble for every command that touches the database: load and
/// validate config, stand up a current-thread runtime, open the pool, apply
/// pending migrations, then hand config and pool to `work`. Exit codes are
/// graded by how far the preamble got (config 2, runtime 3, connectivity 4,
/// migration 5); `work` supplies its own class and code past that.
pub(crate) fn run_against_database<Fut>(
    command: &'static str,
    work: impl FnOnce(AppConfig, DbPool) -> Fut,
) -> CommandResult
where
    Fut: Future<Output = Result<String, StepFailure>>,
{
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                command,
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                command,
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect(&config.database)
            .await
            .map_err(|error| StepFailure::new("db_connectivity", error.to_string(), 4))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| StepFailure::new("migration", error.to_string(), 5))?;

        let outcome = work(config.clone(), pool.clone()).await;
        pool.close().await;
        outcome
    });

    match result {
        Ok(message) => CommandResult::success(command, message),
        Err(failure) => {
            CommandResult::failure(command, failure.error_class, failure.message, failure.exit_code)
        }
    }
}
