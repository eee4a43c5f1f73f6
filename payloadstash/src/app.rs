//! Run orchestration for the PayloadStash CLI.
//!
//! Composes the core resolution engine, the dispatch engine, and the
//! artifact pipeline: owns the run directory, writes the resolved config,
//! results CSV, and run log, and reports the exit classification back to
//! `main`.

use crate::cli::{ResolveArgs, RunArgs, ValidateArgs};
use chrono::Utc;
use payloadstash_core::{config, resolve, secrets};
use payloadstash_http::executor::ExecutorBuilder;
use payloadstash_http::scheduler::SchedulerBuilder;
use payloadstash_stash::log::RunLogBuilder;
use payloadstash_stash::results::ResultsTable;
use payloadstash_stash::writer::ArtifactWriterBuilder;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Errors that terminate a command before or outside request dispatch.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading or validation failed.
    #[error(transparent)]
    Config(#[from] config::Error),
    /// Configuration resolution failed.
    #[error(transparent)]
    Resolve(#[from] resolve::Error),
    /// Secrets file loading failed.
    #[error(transparent)]
    Secrets(#[from] secrets::Error),
    /// Run artifact could not be created.
    #[error("IO operation failed on path {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Resolved document could not be serialized.
    #[error("Failed to serialize resolved document: {source}")]
    Yaml {
        #[source]
        source: serde_yaml::Error,
    },
    /// Run log could not be created.
    #[error(transparent)]
    Log(#[from] payloadstash_stash::log::Error),
    /// Results CSV could not be created or flushed.
    #[error(transparent)]
    Results(#[from] payloadstash_stash::results::Error),
    /// Artifact writer could not be constructed.
    #[error(transparent)]
    Artifacts(#[from] payloadstash_stash::writer::Error),
    /// Request executor could not be constructed.
    #[error(transparent)]
    Executor(#[from] payloadstash_http::executor::Error),
    /// Scheduler could not be constructed.
    #[error(transparent)]
    Scheduler(#[from] payloadstash_http::scheduler::Error),
}

/// Terminal state of a `run` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every dispatched request ended with HTTP 200 (or the run was dry).
    Success,
    /// The run completed but at least one request did not end with 200.
    HadFailures,
    /// The user declined the confirmation prompt.
    Cancelled,
}

fn load_secrets_map(path: Option<&Path>) -> Result<Option<HashMap<String, String>>, Error> {
    match path {
        Some(path) => Ok(Some(secrets::load_file(path)?)),
        None => Ok(None),
    }
}

fn config_basename(path: &Path) -> &str {
    path.file_stem().and_then(|s| s.to_str()).unwrap_or("config")
}

fn write_yaml(path: &Path, value: &serde_yaml::Value) -> Result<(), Error> {
    let text = serde_yaml::to_string(value).map_err(|source| Error::Yaml { source })?;
    std::fs::write(path, text).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Executes a configuration document end to end.
pub async fn run(args: RunArgs) -> Result<RunStatus, Error> {
    let document = config::load_path(&args.config)?;
    let secrets_map = load_secrets_map(args.secrets.as_deref())?;
    let secrets = secrets::Secrets::new(secrets_map, false);
    let resolved = resolve::resolve(&document, &secrets)?;

    let stash_name = document.stash.name.clone();
    let run_timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%SZ").to_string();
    let run_root = args.out.join(&stash_name).join(&run_timestamp);
    std::fs::create_dir_all(&run_root).map_err(|source| Error::Io {
        path: run_root.clone(),
        source,
    })?;

    let basename = config_basename(&args.config);
    let resolved_path = run_root.join(format!("{basename}-resolved.yml"));
    let results_path = run_root.join(format!("{basename}-results.csv"));
    let log_path = run_root.join(format!("{basename}-log.txt"));

    // The on-disk copy never carries raw secret values.
    let secret_values = secrets.values_longest_first();
    let mut disk_document = resolved.document.clone();
    secrets::redact_value(&mut disk_document, &secret_values);
    write_yaml(&resolved_path, &disk_document)?;

    let total_requests = resolved.total_requests();
    println!("PayloadStash run summary:");
    println!("  Name:            {stash_name}");
    println!("  Sequences:       {}", resolved.plan.len());
    println!("  Total Requests:  {total_requests}");
    println!("  Output folder:   {}", run_root.display());
    println!("  Resolved config: {}", resolved_path.display());
    println!("  Log file:        {}", log_path.display());
    if args.dry_run {
        println!("  Mode:            DRY-RUN (no HTTP calls)");
    }

    if args.yes {
        println!("Auto-continue (--yes supplied).");
    } else {
        print!(" Continue? [y/N]: ");
        std::io::stdout().flush().ok();
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer).ok();
        if !matches!(answer.trim().to_lowercase().as_str(), "y" | "yes") {
            println!("\nOperation Cancelled");
            return Ok(RunStatus::Cancelled);
        }
    }
    println!("\nProcessing {stash_name}");

    let results = Arc::new(ResultsTable::create(&results_path)?);
    let log = Arc::new(
        RunLogBuilder::new()
            .path(&log_path)
            .run_timestamp(run_timestamp)
            .stash_name(stash_name.clone())
            .resolved_config(&resolved_path)
            .secret_values(secret_values)
            .build()?,
    );
    let artifacts = Arc::new(ArtifactWriterBuilder::new().run_root(&run_root).build()?);
    let executor = Arc::new(
        ExecutorBuilder::new()
            .dynamics(document.dynamics.clone().map(Arc::new))
            .secrets(Arc::new(secrets))
            .build()?,
    );

    let scheduler = SchedulerBuilder::new()
        .plan(resolved.plan)
        .executor(executor)
        .artifacts(artifacts)
        .results(Arc::clone(&results))
        .log(Arc::clone(&log))
        .inter_sequence_delay(document.stash.defaults.flow_control.delay_seconds)
        .dry_run(args.dry_run)
        .build()?;
    scheduler.run().await;

    results.flush()?;
    log.finish();

    let ok = results.ok_count();
    let total = results.len();
    info!(ok, total, "run finished");
    if args.dry_run || ok == total {
        Ok(RunStatus::Success)
    } else {
        Ok(RunStatus::HadFailures)
    }
}

/// Validates a document, resolving it with redacted secrets to surface
/// resolution errors without leaking values.
pub fn validate(args: ValidateArgs) -> Result<(), Error> {
    let document = config::load_path(&args.config)?;
    let secrets_map = load_secrets_map(args.secrets.as_deref())?;
    let secrets = secrets::Secrets::new(secrets_map, true);
    let _ = resolve::resolve(&document, &secrets)?;
    println!(
        "OK: {} is a valid PayloadStash config. Name='{}', Sequences={}",
        args.config.display(),
        document.stash.name,
        document.stash.sequences.len()
    );
    Ok(())
}

/// Resolves a document and writes the redacted resolved copy.
pub fn resolve_command(args: ResolveArgs) -> Result<(), Error> {
    let document = config::load_path(&args.config)?;
    let secrets_map = load_secrets_map(args.secrets.as_deref())?;
    let secrets = secrets::Secrets::new(secrets_map, true);
    let resolved = resolve::resolve(&document, &secrets)?;

    let out_dir = match &args.out {
        Some(dir) => dir.clone(),
        None => args
            .config
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    std::fs::create_dir_all(&out_dir).map_err(|source| Error::Io {
        path: out_dir.clone(),
        source,
    })?;
    let out_path = out_dir.join(format!("{}-resolved.yml", config_basename(&args.config)));
    write_yaml(&out_path, &resolved.document)?;
    println!("Wrote resolved config: {}", out_path.display());
    Ok(())
}
