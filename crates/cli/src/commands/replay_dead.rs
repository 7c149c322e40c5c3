use chrono::Utc;

use crate::commands::{run_against_database, CommandResult, StepFailure};
use vigil_db::repositories::{OutboxRepository, SqlOutboxRepository};

pub fn run(limit: u32) -> CommandResult {
    if limit == 0 {
        return CommandResult::failure(
            "replay-dead",
            "invalid_argument",
            "limit must be at least 1",
            2,
        );
    }

    run_against_database("replay-dead", move |_config, pool| async move {
        let outbox = SqlOutboxRepository::new(pool.clone());
        let replayed = outbox
            .replay_dead(limit, Utc::now())
            .await
            .map_err(|error| StepFailure::new("replay", error.to_string(), 6))?;
        Ok(format!("replayed {} dead notifications", replayed.len()))
    })
}
