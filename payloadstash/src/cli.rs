use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CLI arguments for the PayloadStash engine.
#[derive(Parser, Debug)]
#[command(
    name = "payloadstash",
    version,
    about = "Declarative HTTP fetch-and-archive engine",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Run(RunArgs),
    Validate(ValidateArgs),
    Resolve(ResolveArgs),
}

#[derive(Parser, Debug)]
#[command(about = "Validate, resolve, and execute a config, archiving every response")]
pub struct RunArgs {
    /// YAML configuration document describing the run
    pub config: PathBuf,

    /// Output directory root for run artifacts
    #[arg(long, value_name = "DIR", default_value = "out")]
    pub out: PathBuf,

    /// Secrets file (KEY=VALUE lines) for $secrets references
    #[arg(long, value_name = "FILE")]
    pub secrets: Option<PathBuf>,

    /// Resolve and log every request without making HTTP calls
    #[arg(long)]
    pub dry_run: bool,

    /// Continue without prompting for confirmation
    #[arg(long)]
    pub yes: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Validate a config against the PayloadStash schema")]
pub struct ValidateArgs {
    /// YAML configuration document to validate
    pub config: PathBuf,

    /// Secrets file (KEY=VALUE lines); when present, referenced keys must exist
    #[arg(long, value_name = "FILE")]
    pub secrets: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[command(about = "Resolve a config and write the redacted resolved document")]
pub struct ResolveArgs {
    /// YAML configuration document to resolve
    pub config: PathBuf,

    /// Directory for the resolved document (defaults to the config's directory)
    #[arg(long, value_name = "DIR")]
    pub out: Option<PathBuf>,

    /// Secrets file (KEY=VALUE lines); when present, referenced keys must exist
    #[arg(long, value_name = "FILE")]
    pub secrets: Option<PathBuf>,
}
