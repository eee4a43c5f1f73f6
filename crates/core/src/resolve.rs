//! Config resolution: section merging, retry precedence, request plan.
//!
//! Turns a validated [`Document`](crate::config::Document) into two outputs:
//! the fully-resolved document that is persisted with the run artifacts, and
//! the in-memory plan of effective requests consumed by the scheduler. Both
//! are produced in one pass so resolve-time dynamic values are identical in
//! the document and the plan.

use crate::config::{Document, FlowControl, Method, SequenceType};
use crate::operator::{self, Resolver};
use crate::retry::{RetryPolicy, RetrySetting};
use crate::secrets::Secrets;
use serde_yaml::{Mapping, Value};
use tracing::debug;

/// Errors that can occur during configuration resolution.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Operator resolution failed inside a merged section.
    #[error("{location}: {source}")]
    Operator {
        location: String,
        #[source]
        source: operator::Error,
    },
    /// A merged section resolved to something other than a mapping.
    #[error("{location}: section must resolve to a mapping")]
    NotAMapping { location: String },
    /// Typed configuration could not be rendered into the resolved document.
    #[error("Failed to serialize resolved document: {source}")]
    Serialize {
        #[source]
        source: serde_yaml::Error,
    },
}

/// Execution mode of a planned sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Sequential,
    Concurrent { limit: usize },
}

/// The fully-merged, resolved description of a single HTTP call.
///
/// Headers, body, and query may still contain `$deferred` marker nodes; the
/// executor materializes them immediately before each send.
#[derive(Debug, Clone)]
pub struct EffectiveRequest {
    pub sequence_name: String,
    /// 1-based index of the owning sequence.
    pub sequence_index: usize,
    pub request_key: String,
    /// 1-based index within the owning sequence.
    pub request_index: usize,
    pub method: Method,
    pub url_root: String,
    pub url_path: String,
    pub headers: Option<Mapping>,
    pub body: Option<Mapping>,
    pub query: Option<Mapping>,
    pub flow_control: FlowControl,
    /// Effective policy after precedence; `None` means a single attempt.
    pub retry: Option<RetryPolicy>,
}

/// One sequence of the request plan.
#[derive(Debug, Clone)]
pub struct SequencePlan {
    pub name: String,
    /// 1-based position in the authored document.
    pub index: usize,
    pub mode: ExecutionMode,
    pub requests: Vec<EffectiveRequest>,
}

/// Output of configuration resolution.
#[derive(Debug, Clone)]
pub struct Resolved {
    /// The resolved document, mirroring the authored structure with merged
    /// per-request sections inlined and deferred markers preserved.
    pub document: Value,
    /// The in-memory request plan, in authored order.
    pub plan: Vec<SequencePlan>,
}

impl Resolved {
    /// Total number of planned requests across all sequences.
    pub fn total_requests(&self) -> usize {
        self.plan.iter().map(|s| s.requests.len()).sum()
    }
}

/// Shallow per-key merge of one section.
///
/// The base is the request section when present, else the Defaults section;
/// Forced keys overlay the base, replacing nested mappings wholesale. When
/// neither base nor overlay exists the effective section is absent.
pub fn merge_section(
    request: Option<&Mapping>,
    defaults: Option<&Mapping>,
    forced: Option<&Mapping>,
) -> Option<Mapping> {
    let base = request.or(defaults);
    match (base, forced) {
        (None, None) => None,
        (base, forced) => {
            let mut merged = base.cloned().unwrap_or_default();
            if let Some(overlay) = forced {
                for (key, value) in overlay {
                    merged.insert(key.clone(), value.clone());
                }
            }
            Some(merged)
        }
    }
}

fn insert(mapping: &mut Mapping, key: &str, value: Value) {
    mapping.insert(Value::from(key), value);
}

fn retry_setting_value(setting: &RetrySetting) -> Result<Value, Error> {
    match setting {
        RetrySetting::Set(policy) => {
            serde_yaml::to_value(policy).map_err(|source| Error::Serialize { source })
        }
        _ => Ok(Value::Null),
    }
}

fn resolve_section(
    resolver: &mut Resolver<'_>,
    section: Option<Mapping>,
    location: &str,
) -> Result<Option<Mapping>, Error> {
    let Some(mapping) = section else {
        return Ok(None);
    };
    let resolved = resolver
        .resolve(Value::Mapping(mapping))
        .map_err(|source| Error::Operator {
            location: location.to_string(),
            source,
        })?;
    match resolved {
        Value::Mapping(mapping) => Ok(Some(mapping)),
        _ => Err(Error::NotAMapping {
            location: location.to_string(),
        }),
    }
}

/// Reference copy of an ambient section (Defaults or Forced) for the
/// resolved document, kept as authored.
fn ambient_section(
    headers: &Option<Mapping>,
    body: &Option<Mapping>,
    query: &Option<Mapping>,
    retry: &RetrySetting,
) -> Result<Mapping, Error> {
    let mut out = Mapping::new();
    if let Some(headers) = headers {
        insert(&mut out, "Headers", Value::Mapping(headers.clone()));
    }
    if let Some(body) = body {
        insert(&mut out, "Body", Value::Mapping(body.clone()));
    }
    if let Some(query) = query {
        insert(&mut out, "Query", Value::Mapping(query.clone()));
    }
    if retry.is_authored() {
        insert(&mut out, "Retry", retry_setting_value(retry)?);
    }
    Ok(out)
}

/// Resolves a validated document into the persisted document and the
/// request plan.
pub fn resolve(document: &Document, secrets: &Secrets) -> Result<Resolved, Error> {
    let sc = &document.stash;
    let mut resolver = Resolver::new(document.dynamics.as_ref(), secrets);

    let mut sc_out = Mapping::new();
    insert(&mut sc_out, "Name", Value::from(sc.name.as_str()));
    if sc.retry.is_authored() {
        insert(&mut sc_out, "Retry", retry_setting_value(&sc.retry)?);
    }

    let mut defaults_out = Mapping::new();
    insert(
        &mut defaults_out,
        "URLRoot",
        Value::from(sc.defaults.url_root.as_str()),
    );
    insert(
        &mut defaults_out,
        "FlowControl",
        serde_yaml::to_value(sc.defaults.flow_control)
            .map_err(|source| Error::Serialize { source })?,
    );
    let defaults_sections = ambient_section(
        &sc.defaults.headers,
        &sc.defaults.body,
        &sc.defaults.query,
        &sc.defaults.retry,
    )?;
    for (key, value) in defaults_sections {
        defaults_out.insert(key, value);
    }
    insert(&mut sc_out, "Defaults", Value::Mapping(defaults_out));

    if let Some(forced) = &sc.forced {
        let forced_out = ambient_section(&forced.headers, &forced.body, &forced.query, &forced.retry)?;
        if !forced_out.is_empty() {
            insert(&mut sc_out, "Forced", Value::Mapping(forced_out));
        }
    }

    let forced = sc.forced.as_ref();
    let mut sequences_out = Vec::with_capacity(sc.sequences.len());
    let mut plan = Vec::with_capacity(sc.sequences.len());

    for (seq_idx0, sequence) in sc.sequences.iter().enumerate() {
        let sequence_index = seq_idx0 + 1;
        let mut seq_out = Mapping::new();
        insert(&mut seq_out, "Name", Value::from(sequence.name.as_str()));
        insert(
            &mut seq_out,
            "Type",
            Value::from(sequence.sequence_type.as_str()),
        );
        if let Some(limit) = sequence.concurrency_limit {
            insert(&mut seq_out, "ConcurrencyLimit", Value::from(limit as u64));
        }

        let mode = match sequence.sequence_type {
            SequenceType::Sequential => ExecutionMode::Sequential,
            SequenceType::Concurrent => ExecutionMode::Concurrent {
                // Validation guarantees the limit is present and >= 1.
                limit: sequence.concurrency_limit.unwrap_or(1) as usize,
            },
        };

        let mut requests_out = Vec::with_capacity(sequence.requests.len());
        let mut planned = Vec::with_capacity(sequence.requests.len());

        for (req_idx0, item) in sequence.requests.iter().enumerate() {
            let request_index = req_idx0 + 1;
            let request = &item.request;
            let location = format!("{}.{}", sequence.name, item.key);

            let headers = resolve_section(
                &mut resolver,
                merge_section(
                    request.headers.as_ref(),
                    sc.defaults.headers.as_ref(),
                    forced.and_then(|f| f.headers.as_ref()),
                ),
                &format!("{location}.Headers"),
            )?;
            let body = resolve_section(
                &mut resolver,
                merge_section(
                    request.body.as_ref(),
                    sc.defaults.body.as_ref(),
                    forced.and_then(|f| f.body.as_ref()),
                ),
                &format!("{location}.Body"),
            )?;
            let query = resolve_section(
                &mut resolver,
                merge_section(
                    request.query.as_ref(),
                    sc.defaults.query.as_ref(),
                    forced.and_then(|f| f.query.as_ref()),
                ),
                &format!("{location}.Query"),
            )?;

            let flow_control = sc
                .defaults
                .flow_control
                .overlay(request.flow_control.as_ref());

            let effective_retry =
                RetrySetting::resolve(&request.retry, &sc.defaults.retry, &sc.retry);

            let mut inner = Mapping::new();
            insert(&mut inner, "Method", Value::from(request.method.as_str()));
            insert(
                &mut inner,
                "URLRoot",
                Value::from(sc.defaults.url_root.as_str()),
            );
            insert(&mut inner, "URLPath", Value::from(request.url_path.as_str()));
            if let Some(headers) = &headers {
                insert(&mut inner, "Headers", Value::Mapping(headers.clone()));
            }
            if let Some(body) = &body {
                insert(&mut inner, "Body", Value::Mapping(body.clone()));
            }
            if let Some(query) = &query {
                insert(&mut inner, "Query", Value::Mapping(query.clone()));
            }
            insert(
                &mut inner,
                "FlowControl",
                serde_yaml::to_value(flow_control).map_err(|source| Error::Serialize { source })?,
            );
            if effective_retry.is_authored() {
                insert(&mut inner, "Retry", retry_setting_value(effective_retry)?);
            }

            let mut item_out = Mapping::new();
            insert(&mut item_out, &item.key, Value::Mapping(inner));
            requests_out.push(Value::Mapping(item_out));

            planned.push(EffectiveRequest {
                sequence_name: sequence.name.clone(),
                sequence_index,
                request_key: item.key.clone(),
                request_index,
                method: request.method,
                url_root: sc.defaults.url_root.clone(),
                url_path: request.url_path.clone(),
                headers,
                body,
                query,
                flow_control,
                retry: effective_retry.policy().cloned(),
            });
        }

        insert(&mut seq_out, "Requests", Value::Sequence(requests_out));
        sequences_out.push(Value::Mapping(seq_out));
        plan.push(SequencePlan {
            name: sequence.name.clone(),
            index: sequence_index,
            mode,
            requests: planned,
        });
    }

    insert(&mut sc_out, "Sequences", Value::Sequence(sequences_out));

    let mut root = Mapping::new();
    insert(&mut root, "StashConfig", Value::Mapping(sc_out));

    let resolved = Resolved {
        document: Value::Mapping(root),
        plan,
    };
    debug!(
        sequences = resolved.plan.len(),
        requests = resolved.total_requests(),
        "configuration resolved"
    );
    Ok(resolved)
}
