use clap::Parser;
use std::process;
use tracing::error;

mod app;
mod cli;

use app::RunStatus;
use cli::{Command, RootArgs};

/// Main entry point for the PayloadStash CLI.
///
/// Initializes tracing, dispatches the subcommand, and maps its result to
/// the documented exit codes: 0 when a run completed with every request at
/// HTTP 200, 1 when a run completed with failures, 9 for validation or
/// output-write errors.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = RootArgs::parse();
    let code = match args.command {
        Command::Run(run_args) => match app::run(run_args).await {
            Ok(RunStatus::Success) | Ok(RunStatus::Cancelled) => 0,
            Ok(RunStatus::HadFailures) => 1,
            Err(e) => {
                error!("Run failed: {e}");
                9
            }
        },
        Command::Validate(validate_args) => match app::validate(validate_args) {
            Ok(()) => 0,
            Err(e) => {
                error!("Validation failed: {e}");
                9
            }
        },
        Command::Resolve(resolve_args) => match app::resolve_command(resolve_args) {
            Ok(()) => 0,
            Err(e) => {
                error!("Resolve failed: {e}");
                9
            }
        },
    };
    process::exit(code);
}
