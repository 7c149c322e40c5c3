use crate::commands::{run_against_database, CommandResult};

pub fn run() -> CommandResult {
    // The shared preamble already applies pending migrations; this command
    // is that preamble plus a confirmation.
    run_against_database("migrate", |_config, _pool| async {
        Ok("applied pending migrations".to_string())
    })
}
