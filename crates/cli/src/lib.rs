pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "vigil",
    about = "Vigil operator CLI",
    long_about = "Operate Vigil migrations, readiness checks, config inspection, and on-demand evaluation and dispatch passes.",
    after_help = "Examples:\n  vigil doctor --json\n  vigil config\n  vigil evaluate\n  vigil replay-dead --limit 50"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Validate config, webhook readiness, and database connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Run one alert evaluation pass over the configured policies")]
    Evaluate,
    #[command(about = "Run one webhook dispatch pass over due outbox items")]
    Dispatch,
    #[command(about = "Re-enqueue dead notifications for a fresh delivery cycle")]
    ReplayDead {
        #[arg(long, default_value_t = 100, help = "Maximum number of dead notifications to replay")]
        limit: u32,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Evaluate => commands::evaluate::run(),
        Command::Dispatch => commands::dispatch::run(),
        Command::ReplayDead { limit } => commands::replay_dead::run(limit),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
