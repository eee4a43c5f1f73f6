//! Append-only run log with secret redaction.
//!
//! The run log is an output artifact, distinct from process diagnostics:
//! it records run start/end, per-request blocks (URL, start time, resolved
//! request and retry, response status, attempts), retry waits, and non-fatal
//! errors. Every line passes through secret redaction before it reaches
//! disk. Writes are serialized behind a mutex so concurrent workers cannot
//! interleave within a block.

use payloadstash_core::secrets::redact_text;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Errors that can occur while creating the run log.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Log file could not be created.
    #[error("IO operation failed on path {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Required builder attribute was not provided.
    #[error("Missing required builder attribute: {0}")]
    MissingBuilderAttribute(String),
}

/// Serialized writer for the run log artifact.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    file: Mutex<File>,
    /// Secret values to scrub from every line, longest first.
    secret_values: Vec<String>,
}

impl RunLog {
    /// Appends one line, redacting secret values. Log-write failures after
    /// creation are non-fatal; they surface as process diagnostics only.
    pub fn append(&self, message: &str) {
        let text = redact_text(message, &self.secret_values);
        if let Ok(mut file) = self.file.lock() {
            if let Err(e) = writeln!(file, "{text}") {
                warn!(path = %self.path.display(), error = %e, "failed to append to run log");
            }
        }
    }

    /// Appends a group of lines as one uninterrupted block.
    pub fn append_block(&self, lines: &[String]) {
        let block: String = lines
            .iter()
            .map(|line| redact_text(line, &self.secret_values))
            .collect::<Vec<_>>()
            .join("\n");
        if let Ok(mut file) = self.file.lock() {
            if let Err(e) = writeln!(file, "{block}") {
                warn!(path = %self.path.display(), error = %e, "failed to append to run log");
            }
        }
    }

    /// Writes the closing line of a run.
    pub fn finish(&self) {
        self.append("=== PayloadStash run finished ===");
    }
}

/// Builder for [`RunLog`]. Creating the log writes the standardized run
/// header; failure here is fatal for the run.
#[derive(Debug, Default)]
pub struct RunLogBuilder {
    path: Option<PathBuf>,
    run_timestamp: Option<String>,
    stash_name: Option<String>,
    resolved_config: Option<PathBuf>,
    secret_values: Vec<String>,
}

impl RunLogBuilder {
    pub fn new() -> RunLogBuilder {
        RunLogBuilder {
            ..Default::default()
        }
    }

    pub fn path(mut self, path: &Path) -> Self {
        self.path = Some(path.to_path_buf());
        self
    }

    pub fn run_timestamp(mut self, timestamp: String) -> Self {
        self.run_timestamp = Some(timestamp);
        self
    }

    pub fn stash_name(mut self, name: String) -> Self {
        self.stash_name = Some(name);
        self
    }

    pub fn resolved_config(mut self, path: &Path) -> Self {
        self.resolved_config = Some(path.to_path_buf());
        self
    }

    /// Secret values to scrub from every line. Sorted longest-first so an
    /// overlapping shorter value cannot expose the tail of a longer one.
    pub fn secret_values(mut self, mut values: Vec<String>) -> Self {
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));
        self.secret_values = values;
        self
    }

    pub fn build(self) -> Result<RunLog, Error> {
        let path = self
            .path
            .ok_or_else(|| Error::MissingBuilderAttribute("path".to_string()))?;
        let run_timestamp = self
            .run_timestamp
            .ok_or_else(|| Error::MissingBuilderAttribute("run_timestamp".to_string()))?;
        let stash_name = self
            .stash_name
            .ok_or_else(|| Error::MissingBuilderAttribute("stash_name".to_string()))?;
        let resolved_config = self
            .resolved_config
            .ok_or_else(|| Error::MissingBuilderAttribute("resolved_config".to_string()))?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| Error::Io {
                path: path.clone(),
                source,
            })?;

        let log = RunLog {
            path,
            file: Mutex::new(file),
            secret_values: self.secret_values,
        };
        log.append(&format!(
            "=== PayloadStash run started at {run_timestamp} UTC ==="
        ));
        log.append(&format!("Name: {stash_name}"));
        log.append(&format!("Resolved config: {}", resolved_config.display()));
        log.append("--- Sequences ---");
        Ok(log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_log(dir: &Path, secrets: Vec<String>) -> (RunLog, PathBuf) {
        let path = dir.join("run-log.txt");
        let log = RunLogBuilder::new()
            .path(&path)
            .run_timestamp("2025-09-17T19-35-00Z".to_string())
            .stash_name("Demo".to_string())
            .resolved_config(&dir.join("demo-resolved.yml"))
            .secret_values(secrets)
            .build()
            .unwrap();
        (log, path)
    }

    #[test]
    fn test_header_lines() {
        let dir = tempfile::tempdir().unwrap();
        let (_log, path) = build_log(dir.path(), Vec::new());
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("=== PayloadStash run started at 2025-09-17T19-35-00Z UTC ==="));
        assert!(contents.contains("Name: Demo"));
        assert!(contents.contains("--- Sequences ---"));
    }

    #[test]
    fn test_append_redacts_secret_values() {
        let dir = tempfile::tempdir().unwrap();
        let (log, path) = build_log(dir.path(), vec!["hunter2".to_string()]);
        log.append("URL: https://example.com/?token=hunter2");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("hunter2"));
        assert!(contents.contains("***REDACTED***"));
    }

    #[test]
    fn test_append_block_keeps_lines_together() {
        let dir = tempfile::tempdir().unwrap();
        let (log, path) = build_log(dir.path(), Vec::new());
        log.append_block(&["  Request 1/1: Ping".to_string(), "    Response: HTTP 200".to_string()]);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("  Request 1/1: Ping\n    Response: HTTP 200\n"));
    }

    #[test]
    fn test_builder_requires_all_attributes() {
        let result = RunLogBuilder::new().build();
        assert!(matches!(result, Err(Error::MissingBuilderAttribute(_))));
    }

    #[test]
    fn test_finish_line() {
        let dir = tempfile::tempdir().unwrap();
        let (log, path) = build_log(dir.path(), Vec::new());
        log.finish();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.trim_end().ends_with("=== PayloadStash run finished ==="));
    }
}
