//! Request execution with late deferred resolution and the retry loop.
//!
//! One [`Executor`] serves a whole run. For every attempt it deep-copies the
//! effective request's sections, materializes any `$deferred` markers with
//! fresh values, assembles the HTTP call, and applies the client timeout.
//! The retry controller around the send classifies each attempt outcome and
//! decides whether and when to try again. Per-request failures never
//! propagate; they are folded into the returned [`Outcome`].

use chrono::{DateTime, Utc};
use payloadstash_core::config::{Dynamics, Method};
use payloadstash_core::operator::Resolver;
use payloadstash_core::resolve::EffectiveRequest;
use payloadstash_core::secrets::Secrets;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde_yaml::{Mapping, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Content type assumed for bodies when none is authored.
const DEFAULT_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Errors that can occur while constructing the executor.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// HTTP client construction failed.
    #[error("Failed to build HTTP client: {source}")]
    Client {
        #[source]
        source: reqwest::Error,
    },
    /// Required builder attribute was not provided.
    #[error("Missing required builder attribute: {0}")]
    MissingBuilderAttribute(String),
}

/// Classification of a request that produced no usable response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The client-side timeout fired.
    Timeout,
    /// The send failed before a response (DNS, connection, reset).
    Network,
    /// The request could not be assembled (bad header, body, or operator).
    InvalidRequest,
}

impl ErrorKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::InvalidRequest => "invalid-request",
        }
    }
}

/// Terminal failure detail attached to an [`Outcome`].
#[derive(Debug, Clone)]
pub struct RequestError {
    pub kind: ErrorKind,
    pub detail: String,
}

/// Final result of executing one effective request.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// Final HTTP status, or -1 when no response was received.
    pub status: i32,
    /// Response body bytes; empty when no response was received.
    pub body: Vec<u8>,
    /// Response Content-Type header, when present.
    pub content_type: Option<String>,
    /// UTC start of the first attempt.
    pub started_at: DateTime<Utc>,
    /// Total elapsed time across all attempts.
    pub elapsed_ms: u64,
    /// Number of sends made.
    pub attempts: u32,
    /// Terminal failure, when the request never produced a response.
    pub error: Option<RequestError>,
}

/// Execution result plus the log lines describing it.
#[derive(Debug, Clone)]
pub struct RequestReport {
    pub outcome: Outcome,
    pub lines: Vec<String>,
}

/// Concatenates the URL root and path with exactly one separating slash.
/// An empty path yields the bare root.
pub fn join_url(url_root: &str, url_path: &str) -> String {
    let base = url_root.trim_end_matches('/');
    let path = url_path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{path}")
    }
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn query_pairs(mapping: &Mapping) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (key, value) in mapping {
        let key = scalar_string(key);
        match value {
            Value::Sequence(items) => {
                for item in items {
                    pairs.push((key.clone(), scalar_string(item)));
                }
            }
            other => pairs.push((key, scalar_string(other))),
        }
    }
    pairs
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::GET => reqwest::Method::GET,
        Method::POST => reqwest::Method::POST,
        Method::PUT => reqwest::Method::PUT,
        Method::PATCH => reqwest::Method::PATCH,
        Method::DELETE => reqwest::Method::DELETE,
        Method::HEAD => reqwest::Method::HEAD,
        Method::OPTIONS => reqwest::Method::OPTIONS,
    }
}

struct AttemptResponse {
    status: u16,
    content_type: Option<String>,
    body: Vec<u8>,
}

enum AttemptFailure {
    Timeout(String),
    Network(String),
    Invalid(String),
}

impl AttemptFailure {
    fn into_request_error(self) -> RequestError {
        match self {
            AttemptFailure::Timeout(detail) => RequestError {
                kind: ErrorKind::Timeout,
                detail,
            },
            AttemptFailure::Network(detail) => RequestError {
                kind: ErrorKind::Network,
                detail,
            },
            AttemptFailure::Invalid(detail) => RequestError {
                kind: ErrorKind::InvalidRequest,
                detail,
            },
        }
    }

    fn describe(&self) -> String {
        match self {
            AttemptFailure::Timeout(detail) => format!("timeout: {detail}"),
            AttemptFailure::Network(detail) => format!("network error: {detail}"),
            AttemptFailure::Invalid(detail) => format!("invalid request: {detail}"),
        }
    }
}

enum AttemptResult {
    Response(AttemptResponse),
    Failure(AttemptFailure),
}

/// Executes effective requests against a shared HTTP client.
#[derive(Debug)]
pub struct Executor {
    /// Shared connection pool for the whole run.
    client: Arc<reqwest::Client>,
    /// Dynamics section for send-time pattern expansion.
    dynamics: Option<Arc<Dynamics>>,
    /// Secrets for send-time lookups inside deferred templates.
    secrets: Arc<Secrets>,
}

impl Executor {
    /// Runs one effective request to a terminal outcome, retrying per its
    /// effective policy. Never fails: assembly and transport problems are
    /// folded into the outcome.
    pub async fn execute(&self, request: &EffectiveRequest) -> RequestReport {
        let mut lines = Vec::new();
        let policy = request.retry.as_ref();
        let max_attempts = policy.map(|p| p.attempts.max(1)).unwrap_or(1);

        let started_at = Utc::now();
        let start = Instant::now();
        let mut attempts = 0u32;

        let last = loop {
            attempts += 1;
            let result = self.attempt(request).await;

            let (retryable, reason) = match &result {
                AttemptResult::Response(response) => {
                    let retry = policy
                        .map(|p| p.retries_status(response.status))
                        .unwrap_or(false);
                    (retry, format!("status {}", response.status))
                }
                AttemptResult::Failure(failure) => {
                    let retry = match failure {
                        AttemptFailure::Timeout(_) => {
                            policy.map(|p| p.retry_on_timeouts()).unwrap_or(false)
                        }
                        AttemptFailure::Network(_) => {
                            policy.map(|p| p.retry_on_network_errors()).unwrap_or(false)
                        }
                        AttemptFailure::Invalid(_) => false,
                    };
                    lines.push(format!(
                        "Attempt {attempts}/{max_attempts} failed: {}",
                        failure.describe()
                    ));
                    (retry, failure.describe())
                }
            };

            if !retryable || attempts >= max_attempts {
                break result;
            }
            // Retryable and attempts remain; policy is necessarily present.
            let Some(policy) = policy else {
                break result;
            };

            let wait = policy.jittered_delay(attempts);
            if let Some(budget) = policy.max_elapsed_seconds {
                if start.elapsed().as_secs_f64() + wait > budget {
                    lines.push(format!(
                        "Retry abandoned: waiting {wait:.3}s would exceed MaxElapsedSeconds {budget}"
                    ));
                    break result;
                }
            }
            lines.push(format!(
                "Retry {attempts}/{} in {wait:.3}s ({reason})",
                max_attempts - 1
            ));
            if wait > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let outcome = match last {
            AttemptResult::Response(response) => Outcome {
                status: i32::from(response.status),
                body: response.body,
                content_type: response.content_type,
                started_at,
                elapsed_ms,
                attempts,
                error: None,
            },
            AttemptResult::Failure(failure) => Outcome {
                status: -1,
                body: Vec::new(),
                content_type: None,
                started_at,
                elapsed_ms,
                attempts,
                error: Some(failure.into_request_error()),
            },
        };

        debug!(
            request = %request.request_key,
            status = outcome.status,
            attempts = outcome.attempts,
            elapsed_ms = outcome.elapsed_ms,
            "request completed"
        );
        RequestReport { outcome, lines }
    }

    /// One send. Deep-copies the declarative sections and materializes any
    /// deferred markers so a retry re-expands fresh values.
    async fn attempt(&self, request: &EffectiveRequest) -> AttemptResult {
        let resolver = Resolver::new(self.dynamics.as_deref(), &self.secrets);
        let materialize = |section: &Option<Mapping>| -> Result<Option<Mapping>, String> {
            match section {
                None => Ok(None),
                Some(mapping) => match resolver.materialize(Value::Mapping(mapping.clone())) {
                    Ok(Value::Mapping(out)) => Ok(Some(out)),
                    Ok(_) => Err("section materialized into a non-mapping".to_string()),
                    Err(e) => Err(e.to_string()),
                },
            }
        };

        let headers = match materialize(&request.headers) {
            Ok(headers) => headers,
            Err(detail) => return AttemptResult::Failure(AttemptFailure::Invalid(detail)),
        };
        let body = match materialize(&request.body) {
            Ok(body) => body,
            Err(detail) => return AttemptResult::Failure(AttemptFailure::Invalid(detail)),
        };
        let query = match materialize(&request.query) {
            Ok(query) => query,
            Err(detail) => return AttemptResult::Failure(AttemptFailure::Invalid(detail)),
        };

        let url = join_url(&request.url_root, &request.url_path);
        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), url.as_str());

        if let Some(query) = &query {
            builder = builder.query(&query_pairs(query));
        }

        let mut header_map = HeaderMap::new();
        if let Some(headers) = &headers {
            for (key, value) in headers {
                let name = match HeaderName::try_from(scalar_string(key)) {
                    Ok(name) => name,
                    Err(e) => {
                        return AttemptResult::Failure(AttemptFailure::Invalid(format!(
                            "invalid header name: {e}"
                        )))
                    }
                };
                let value = match HeaderValue::try_from(scalar_string(value)) {
                    Ok(value) => value,
                    Err(e) => {
                        return AttemptResult::Failure(AttemptFailure::Invalid(format!(
                            "invalid header value: {e}"
                        )))
                    }
                };
                // HeaderMap folds names case-insensitively; last write wins.
                header_map.insert(name, value);
            }
        }

        if let Some(body) = &body {
            let bytes = match serde_json::to_vec(body) {
                Ok(bytes) => bytes,
                Err(e) => {
                    return AttemptResult::Failure(AttemptFailure::Invalid(format!(
                        "failed to serialize body as JSON: {e}"
                    )))
                }
            };
            if !header_map.contains_key(CONTENT_TYPE) {
                // Bodies are JSON unless the caller says otherwise.
                if let Ok(value) = HeaderValue::try_from(DEFAULT_CONTENT_TYPE) {
                    header_map.insert(CONTENT_TYPE, value);
                }
            }
            builder = builder.body(bytes);
        }
        builder = builder.headers(header_map);

        if request.flow_control.timeout_seconds > 0 {
            builder = builder.timeout(Duration::from_secs(request.flow_control.timeout_seconds));
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                return AttemptResult::Failure(if e.is_timeout() {
                    AttemptFailure::Timeout(e.to_string())
                } else {
                    AttemptFailure::Network(e.to_string())
                })
            }
        };

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        match response.bytes().await {
            Ok(bytes) => AttemptResult::Response(AttemptResponse {
                status,
                content_type,
                body: bytes.to_vec(),
            }),
            Err(e) => AttemptResult::Failure(if e.is_timeout() {
                AttemptFailure::Timeout(e.to_string())
            } else {
                AttemptFailure::Network(e.to_string())
            }),
        }
    }
}

/// Builder for [`Executor`].
#[derive(Debug, Default)]
pub struct ExecutorBuilder {
    client: Option<Arc<reqwest::Client>>,
    dynamics: Option<Arc<Dynamics>>,
    secrets: Option<Arc<Secrets>>,
}

impl ExecutorBuilder {
    pub fn new() -> ExecutorBuilder {
        ExecutorBuilder {
            ..Default::default()
        }
    }

    pub fn client(mut self, client: Arc<reqwest::Client>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn dynamics(mut self, dynamics: Option<Arc<Dynamics>>) -> Self {
        self.dynamics = dynamics;
        self
    }

    pub fn secrets(mut self, secrets: Arc<Secrets>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn build(self) -> Result<Executor, Error> {
        let client = match self.client {
            Some(client) => client,
            None => Arc::new(
                reqwest::ClientBuilder::new()
                    .build()
                    .map_err(|source| Error::Client { source })?,
            ),
        };
        Ok(Executor {
            client,
            dynamics: self.dynamics,
            secrets: self
                .secrets
                .ok_or_else(|| Error::MissingBuilderAttribute("secrets".to_string()))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url_normalizes_slashes() {
        assert_eq!(join_url("https://x/y/", "/health"), "https://x/y/health");
        assert_eq!(join_url("https://x/y", "health"), "https://x/y/health");
        assert_eq!(join_url("https://x/y/", ""), "https://x/y");
    }

    #[test]
    fn test_query_pairs_expands_sequences() {
        let mapping: Mapping = serde_yaml::from_str("tag:\n  - a\n  - b\nlimit: 5\n").unwrap();
        let pairs = query_pairs(&mapping);
        assert_eq!(
            pairs,
            vec![
                ("tag".to_string(), "a".to_string()),
                ("tag".to_string(), "b".to_string()),
                ("limit".to_string(), "5".to_string()),
            ]
        );
    }

    #[test]
    fn test_scalar_string_shapes() {
        assert_eq!(scalar_string(&Value::from("s")), "s");
        assert_eq!(scalar_string(&Value::from(true)), "true");
        assert_eq!(scalar_string(&Value::from(7)), "7");
        assert_eq!(scalar_string(&Value::Null), "");
    }

    #[test]
    fn test_builder_requires_secrets() {
        let result = ExecutorBuilder::new().build();
        assert!(matches!(result, Err(Error::MissingBuilderAttribute(_))));
    }

    #[tokio::test]
    async fn test_network_error_without_policy_is_single_attempt() {
        let executor = ExecutorBuilder::new()
            .secrets(Arc::new(Secrets::default()))
            .build()
            .unwrap();
        let request = EffectiveRequest {
            sequence_name: "Solo".to_string(),
            sequence_index: 1,
            request_key: "Ping".to_string(),
            request_index: 1,
            method: Method::GET,
            // Port 9 (discard) is almost never bound; connections fail fast.
            url_root: "http://127.0.0.1:9".to_string(),
            url_path: "/x".to_string(),
            headers: None,
            body: None,
            query: None,
            flow_control: payloadstash_core::config::FlowControl {
                delay_seconds: 0,
                timeout_seconds: 2,
            },
            retry: None,
        };
        let report = executor.execute(&request).await;
        assert_eq!(report.outcome.status, -1);
        assert_eq!(report.outcome.attempts, 1);
        let error = report.outcome.error.unwrap();
        assert!(matches!(
            error.kind,
            ErrorKind::Network | ErrorKind::Timeout
        ));
    }
}
