//! Sequence iteration, bounded worker groups, and pacing.
//!
//! Sequences run strictly in authored order; sequence k+1 starts only after
//! every request of sequence k reached a terminal outcome. Sequential
//! sequences pace requests with the effective per-request delay; concurrent
//! sequences dispatch into a semaphore-bounded worker group with no
//! intra-sequence delay. Reporting (log blocks and result rows) always
//! follows authored order regardless of completion order.

use crate::executor::{join_url, Executor};
use futures_util::future::join_all;
use payloadstash_core::resolve::{EffectiveRequest, ExecutionMode, SequencePlan};
use payloadstash_core::retry::RetryPolicy;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn, Instrument};

use payloadstash_stash::log::RunLog;
use payloadstash_stash::results::{ResultRow, ResultsTable};
use payloadstash_stash::writer::ArtifactWriter;

/// Errors that can occur while constructing the scheduler.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Required builder attribute was not provided.
    #[error("Missing required builder attribute: {0}")]
    MissingBuilderAttribute(String),
}

/// Drives a resolved request plan to completion.
pub struct Scheduler {
    plan: Vec<SequencePlan>,
    executor: Arc<Executor>,
    artifacts: Arc<ArtifactWriter>,
    results: Arc<ResultsTable>,
    log: Arc<RunLog>,
    /// Defaults delay applied between sequences.
    inter_sequence_delay: u64,
    dry_run: bool,
}

impl Scheduler {
    /// Runs every sequence in authored order and returns once all requests
    /// have a terminal outcome. Per-request failures never stop the run.
    #[tracing::instrument(skip(self), name = "scheduler")]
    pub async fn run(self) {
        let total_sequences = self.plan.len();
        for (position, sequence) in self.plan.iter().enumerate() {
            if position > 0 && self.inter_sequence_delay > 0 {
                self.log
                    .append(&format!("  Delay {}s before next sequence", self.inter_sequence_delay));
                tokio::time::sleep(Duration::from_secs(self.inter_sequence_delay)).await;
            }

            let mut heading = format!(
                "Processing sequence {}/{}: {} (Type={}",
                sequence.index,
                total_sequences,
                sequence.name,
                match sequence.mode {
                    ExecutionMode::Sequential => "Sequential".to_string(),
                    ExecutionMode::Concurrent { limit } =>
                        format!("Concurrent, ConcurrencyLimit={limit}"),
                }
            );
            heading.push(')');
            info!("{heading}");
            self.log.append(&heading);

            match sequence.mode {
                ExecutionMode::Sequential => self.run_sequential(sequence).await,
                ExecutionMode::Concurrent { limit } => self.run_concurrent(sequence, limit).await,
            }
        }
    }

    async fn run_sequential(&self, sequence: &SequencePlan) {
        let total = sequence.requests.len();
        for (position, request) in sequence.requests.iter().enumerate() {
            if position > 0 {
                // The gap before this request is paced by the request that
                // just completed, not the one about to fire.
                let delay = sequence.requests[position - 1].flow_control.delay_seconds;
                self.log.append(&format!("    Delay {delay}s"));
                if delay > 0 {
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
            }
            let lines = process_request(
                Arc::clone(&self.executor),
                Arc::clone(&self.artifacts),
                Arc::clone(&self.results),
                self.dry_run,
                total,
                request.clone(),
            )
            .await;
            self.log.append_block(&lines);
        }
    }

    async fn run_concurrent(&self, sequence: &SequencePlan, limit: usize) {
        let total = sequence.requests.len();
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut handles = Vec::with_capacity(total);

        for request in sequence.requests.iter().cloned() {
            let semaphore = Arc::clone(&semaphore);
            let executor = Arc::clone(&self.executor);
            let artifacts = Arc::clone(&self.artifacts);
            let results = Arc::clone(&self.results);
            let dry_run = self.dry_run;
            let span = tracing::Span::current();
            handles.push(tokio::spawn(
                async move {
                    // The semaphore is never closed; acquisition cannot fail.
                    let _permit = semaphore.acquire().await.ok();
                    let index = request.request_index;
                    let lines =
                        process_request(executor, artifacts, results, dry_run, total, request)
                            .await;
                    (index, lines)
                }
                .instrument(span),
            ));
        }

        // Await the whole worker group, then flush log blocks in authored
        // order regardless of completion order.
        let mut blocks = BTreeMap::new();
        for result in join_all(handles).await {
            match result {
                Ok((index, lines)) => {
                    blocks.insert(index, lines);
                }
                Err(e) => error!("request worker panicked: {e}"),
            }
        }
        for lines in blocks.values() {
            self.log.append_block(lines);
        }
    }
}

/// Executes one request (or records the dry-run placeholder), writes its
/// artifacts, and returns the request's log block.
async fn process_request(
    executor: Arc<Executor>,
    artifacts: Arc<ArtifactWriter>,
    results: Arc<ResultsTable>,
    dry_run: bool,
    total_in_sequence: usize,
    request: EffectiveRequest,
) -> Vec<String> {
    let mut lines = Vec::new();
    let url = join_url(&request.url_root, &request.url_path);
    lines.push(format!(
        "  Request {}/{}: {}",
        request.request_index, total_in_sequence, request.request_key
    ));
    lines.push(format!("    URL: {url}"));
    let start_iso = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    lines.push(format!("    Start: {start_iso}"));
    push_yaml_block(&mut lines, "    Resolved Request:", &request_yaml(&request));
    match &request.retry {
        None => lines.push("    Resolved Retry: Null".to_string()),
        Some(policy) => push_yaml_block(&mut lines, "    Resolved Retry:", &retry_yaml(policy)),
    }

    if dry_run {
        lines.push(format!(
            "    DRY-RUN: would send {} {url} (skipped)",
            request.method
        ));
        push_row(&results, &request, start_iso, 0, 0, 0);
        return lines;
    }

    let report = executor.execute(&request).await;
    lines.extend(report.lines.iter().map(|line| format!("    {line}")));
    let outcome = &report.outcome;
    if let Some(error) = &outcome.error {
        lines.push(format!(
            "    ERROR: request failed ({}): {}",
            error.kind.as_str(),
            error.detail
        ));
    } else {
        lines.push(format!(
            "    Response: HTTP {} in {}ms",
            outcome.status, outcome.elapsed_ms
        ));
    }
    lines.push(format!("    Attempts: {}", outcome.attempts));

    let diagnostic;
    let body: &[u8] = if outcome.body.is_empty() {
        diagnostic = match &outcome.error {
            Some(error) => format!(
                "request failed without a response ({}): {}\n",
                error.kind.as_str(),
                error.detail
            ),
            None => String::new(),
        };
        diagnostic.as_bytes()
    } else {
        &outcome.body
    };
    match artifacts.write_response(
        request.sequence_index,
        &request.sequence_name,
        request.request_index,
        &request.request_key,
        outcome.content_type.as_deref(),
        body,
    ) {
        Ok(path) => lines.push(format!("    Response Body: written to {}", path.display())),
        Err(e) => {
            warn!("failed to write response body: {e}");
            lines.push(format!("    Warning: failed to write response body: {e}"));
        }
    }

    push_row(
        &results,
        &request,
        outcome.started_at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        outcome.status,
        outcome.elapsed_ms,
        outcome.attempts,
    );
    lines
}

fn push_row(
    results: &ResultsTable,
    request: &EffectiveRequest,
    timestamp: String,
    status: i32,
    duration_ms: u64,
    attempts: u32,
) {
    let row = ResultRow {
        sequence_index: request.sequence_index,
        request_index: request.request_index,
        sequence: request.sequence_name.clone(),
        request: request.request_key.clone(),
        timestamp,
        status,
        duration_ms,
        attempts,
    };
    if let Err(e) = results.push(row) {
        warn!("failed to record result row: {e}");
    }
}

fn push_yaml_block(lines: &mut Vec<String>, title: &str, yaml: &str) {
    lines.push(title.to_string());
    for line in yaml.lines() {
        lines.push(format!("      {line}"));
    }
}

fn request_yaml(request: &EffectiveRequest) -> String {
    let mut out = Mapping::new();
    out.insert("Method".into(), request.method.as_str().into());
    out.insert("URLRoot".into(), request.url_root.as_str().into());
    out.insert("URLPath".into(), request.url_path.as_str().into());
    if let Some(headers) = &request.headers {
        out.insert("Headers".into(), Value::Mapping(headers.clone()));
    }
    if let Some(body) = &request.body {
        out.insert("Body".into(), Value::Mapping(body.clone()));
    }
    if let Some(query) = &request.query {
        out.insert("Query".into(), Value::Mapping(query.clone()));
    }
    out.insert(
        "TimeoutSeconds".into(),
        Value::from(request.flow_control.timeout_seconds),
    );
    serde_yaml::to_string(&Value::Mapping(out)).unwrap_or_default()
}

fn retry_yaml(policy: &RetryPolicy) -> String {
    serde_yaml::to_string(policy).unwrap_or_default()
}

/// Builder for [`Scheduler`].
#[derive(Default)]
pub struct SchedulerBuilder {
    plan: Option<Vec<SequencePlan>>,
    executor: Option<Arc<Executor>>,
    artifacts: Option<Arc<ArtifactWriter>>,
    results: Option<Arc<ResultsTable>>,
    log: Option<Arc<RunLog>>,
    inter_sequence_delay: u64,
    dry_run: bool,
}

impl SchedulerBuilder {
    pub fn new() -> SchedulerBuilder {
        SchedulerBuilder {
            ..Default::default()
        }
    }

    pub fn plan(mut self, plan: Vec<SequencePlan>) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn executor(mut self, executor: Arc<Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn artifacts(mut self, artifacts: Arc<ArtifactWriter>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn results(mut self, results: Arc<ResultsTable>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn log(mut self, log: Arc<RunLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn inter_sequence_delay(mut self, seconds: u64) -> Self {
        self.inter_sequence_delay = seconds;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn build(self) -> Result<Scheduler, Error> {
        Ok(Scheduler {
            plan: self
                .plan
                .ok_or_else(|| Error::MissingBuilderAttribute("plan".to_string()))?,
            executor: self
                .executor
                .ok_or_else(|| Error::MissingBuilderAttribute("executor".to_string()))?,
            artifacts: self
                .artifacts
                .ok_or_else(|| Error::MissingBuilderAttribute("artifacts".to_string()))?,
            results: self
                .results
                .ok_or_else(|| Error::MissingBuilderAttribute("results".to_string()))?,
            log: self
                .log
                .ok_or_else(|| Error::MissingBuilderAttribute("log".to_string()))?,
            inter_sequence_delay: self.inter_sequence_delay,
            dry_run: self.dry_run,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_requires_plan() {
        let result = SchedulerBuilder::new().build();
        assert!(matches!(
            result,
            Err(Error::MissingBuilderAttribute(attr)) if attr == "plan"
        ));
    }

    #[test]
    fn test_request_yaml_shape() {
        let request = EffectiveRequest {
            sequence_name: "Solo".to_string(),
            sequence_index: 1,
            request_key: "Ping".to_string(),
            request_index: 1,
            method: payloadstash_core::config::Method::GET,
            url_root: "https://example.com".to_string(),
            url_path: "/health".to_string(),
            headers: None,
            body: None,
            query: None,
            flow_control: payloadstash_core::config::FlowControl {
                delay_seconds: 0,
                timeout_seconds: 5,
            },
            retry: None,
        };
        let yaml = request_yaml(&request);
        assert!(yaml.contains("Method: GET"));
        assert!(yaml.contains("URLPath: /health"));
        assert!(yaml.contains("TimeoutSeconds: 5"));
    }
}
