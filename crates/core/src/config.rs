//! Schema types, document loading, and validation.
//!
//! The authored document is UTF-8 YAML with a required `StashConfig` mapping
//! and an optional `dynamics` mapping. Anchors and aliases are expanded by
//! the YAML parser; merge keys are applied before the typed deserialization.
//! Typed sections reject unknown keys while extra top-level keys (anchor
//! scaffolding) are ignored.

use crate::retry::{retry_setting, RetrySetting};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Errors that can occur while loading or validating a configuration document.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Configuration file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// YAML parsing or schema deserialization failed.
    #[error("Failed to parse configuration: {source}")]
    Yaml {
        #[source]
        source: serde_yaml::Error,
    },
    /// The document violates a structural rule the schema cannot express.
    #[error("{location}: {reason}")]
    Invalid { location: String, reason: String },
}

impl Error {
    fn invalid(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Invalid {
            location: location.into(),
            reason: reason.into(),
        }
    }
}

/// HTTP methods accepted by the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum Method {
    GET,
    POST,
    PUT,
    PATCH,
    DELETE,
    HEAD,
    OPTIONS,
}

impl Method {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::PATCH => "PATCH",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Execution mode of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum SequenceType {
    Sequential,
    Concurrent,
}

impl SequenceType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SequenceType::Sequential => "Sequential",
            SequenceType::Concurrent => "Concurrent",
        }
    }
}

/// Pacing and timeout settings. Both fields are required in Defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FlowControl {
    /// Seconds to wait between requests and between sequences.
    #[serde(rename = "DelaySeconds")]
    pub delay_seconds: u64,
    /// Client-side timeout applied to each attempt.
    #[serde(rename = "TimeoutSeconds")]
    pub timeout_seconds: u64,
}

/// Per-request flow-control overlay; each field overrides Defaults independently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowControlOverride {
    #[serde(rename = "DelaySeconds", default)]
    pub delay_seconds: Option<u64>,
    #[serde(rename = "TimeoutSeconds", default)]
    pub timeout_seconds: Option<u64>,
}

impl FlowControl {
    /// Field-wise overlay of these defaults by a per-request override.
    pub fn overlay(&self, overrides: Option<&FlowControlOverride>) -> FlowControl {
        match overrides {
            Some(o) => FlowControl {
                delay_seconds: o.delay_seconds.unwrap_or(self.delay_seconds),
                timeout_seconds: o.timeout_seconds.unwrap_or(self.timeout_seconds),
            },
            None => *self,
        }
    }
}

/// One named request inside a sequence.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    #[serde(rename = "Method")]
    pub method: Method,
    #[serde(rename = "URLPath")]
    pub url_path: String,
    /// Requests never author their own URL root; this field only exists so
    /// a resolved document, which restates Defaults.URLRoot per request,
    /// passes re-validation. Any other value is rejected.
    #[serde(rename = "URLRoot", default)]
    pub url_root: Option<String>,
    #[serde(rename = "Headers", default)]
    pub headers: Option<Mapping>,
    #[serde(rename = "Body", default)]
    pub body: Option<Mapping>,
    #[serde(rename = "Query", default)]
    pub query: Option<Mapping>,
    #[serde(rename = "FlowControl", default)]
    pub flow_control: Option<FlowControlOverride>,
    #[serde(rename = "Retry", default, deserialize_with = "retry_setting")]
    pub retry: RetrySetting,
}

/// A `{ <Key>: <Request> }` entry in a sequence's Requests list.
#[derive(Debug, Clone)]
pub struct RequestItem {
    pub key: String,
    pub request: Request,
}

impl<'de> Deserialize<'de> for RequestItem {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mapping = Mapping::deserialize(deserializer)?;
        if mapping.len() != 1 {
            return Err(D::Error::custom(
                "each Requests entry must be a single-key mapping: { <Key>: { Request... } }",
            ));
        }
        let Some((key, value)) = mapping.into_iter().next() else {
            return Err(D::Error::custom("empty Requests entry"));
        };
        let key = key
            .as_str()
            .ok_or_else(|| D::Error::custom("request key must be a string"))?
            .to_string();
        let request: Request = serde_yaml::from_value(value)
            .map_err(|e| D::Error::custom(format!("request '{key}': {e}")))?;
        Ok(RequestItem { key, request })
    }
}

/// A named, ordered group of requests sharing an execution mode.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Sequence {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Type")]
    pub sequence_type: SequenceType,
    /// Bounded worker-group size; required iff the sequence is Concurrent.
    #[serde(rename = "ConcurrencyLimit", default)]
    pub concurrency_limit: Option<u32>,
    #[serde(rename = "Requests")]
    pub requests: Vec<RequestItem>,
}

/// Ambient section whose Headers/Body/Query fill gaps in each request.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    #[serde(rename = "URLRoot")]
    pub url_root: String,
    #[serde(rename = "FlowControl")]
    pub flow_control: FlowControl,
    #[serde(rename = "Headers", default)]
    pub headers: Option<Mapping>,
    #[serde(rename = "Body", default)]
    pub body: Option<Mapping>,
    #[serde(rename = "Query", default)]
    pub query: Option<Mapping>,
    #[serde(rename = "Retry", default, deserialize_with = "retry_setting")]
    pub retry: RetrySetting,
}

/// Ambient section whose Headers/Body/Query override each request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Forced {
    #[serde(rename = "Headers", default)]
    pub headers: Option<Mapping>,
    #[serde(rename = "Body", default)]
    pub body: Option<Mapping>,
    #[serde(rename = "Query", default)]
    pub query: Option<Mapping>,
    #[serde(rename = "Retry", default, deserialize_with = "retry_setting")]
    pub retry: RetrySetting,
}

/// The `StashConfig` document section: one complete run description.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StashConfig {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Defaults")]
    pub defaults: Defaults,
    #[serde(rename = "Forced", default)]
    pub forced: Option<Forced>,
    #[serde(rename = "Retry", default, deserialize_with = "retry_setting")]
    pub retry: RetrySetting,
    #[serde(rename = "Sequences")]
    pub sequences: Vec<Sequence>,
}

/// A named template used by `$dynamic` operators.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pattern {
    pub template: String,
}

/// The optional `dynamics` document section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dynamics {
    #[serde(default)]
    pub patterns: HashMap<String, Pattern>,
    #[serde(default)]
    pub sets: HashMap<String, Vec<String>>,
}

/// A parsed configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Document {
    #[serde(rename = "StashConfig")]
    pub stash: StashConfig,
    #[serde(default)]
    pub dynamics: Option<Dynamics>,
}

impl Document {
    /// Structural checks the schema types cannot express.
    pub fn validate(&self) -> Result<(), Error> {
        let sc = &self.stash;
        if sc.name.trim().is_empty() {
            return Err(Error::invalid("StashConfig.Name", "must not be empty"));
        }
        if sc.defaults.url_root.trim().is_empty() {
            return Err(Error::invalid(
                "StashConfig.Defaults.URLRoot",
                "must not be empty",
            ));
        }
        if sc.sequences.is_empty() {
            return Err(Error::invalid(
                "StashConfig.Sequences",
                "must be a non-empty list",
            ));
        }

        validate_retry_setting(&sc.retry, "StashConfig.Retry")?;
        validate_retry_setting(&sc.defaults.retry, "StashConfig.Defaults.Retry")?;
        if let Some(forced) = &sc.forced {
            validate_retry_setting(&forced.retry, "StashConfig.Forced.Retry")?;
        }

        let mut sequence_names = std::collections::HashSet::new();
        for (seq_idx, sequence) in sc.sequences.iter().enumerate() {
            let location = format!("StashConfig.Sequences[{seq_idx}]");
            if sequence.name.trim().is_empty() {
                return Err(Error::invalid(format!("{location}.Name"), "must not be empty"));
            }
            if !sequence_names.insert(sequence.name.clone()) {
                return Err(Error::invalid(
                    format!("{location}.Name"),
                    format!("duplicate sequence name '{}'", sequence.name),
                ));
            }
            match sequence.sequence_type {
                SequenceType::Concurrent => match sequence.concurrency_limit {
                    None => {
                        return Err(Error::invalid(
                            format!("{location}.ConcurrencyLimit"),
                            "required when Type is 'Concurrent'",
                        ))
                    }
                    Some(limit) if limit < 1 => {
                        return Err(Error::invalid(
                            format!("{location}.ConcurrencyLimit"),
                            "must be at least 1",
                        ))
                    }
                    Some(_) => {}
                },
                SequenceType::Sequential => {
                    if sequence.concurrency_limit.is_some() {
                        return Err(Error::invalid(
                            format!("{location}.ConcurrencyLimit"),
                            "should not be set when Type is 'Sequential'",
                        ));
                    }
                }
            }
            if sequence.requests.is_empty() {
                return Err(Error::invalid(
                    format!("{location}.Requests"),
                    "must be a non-empty list",
                ));
            }
            let mut request_keys = std::collections::HashSet::new();
            for item in &sequence.requests {
                if !request_keys.insert(item.key.clone()) {
                    return Err(Error::invalid(
                        format!("{location}.Requests"),
                        format!("duplicate request key '{}'", item.key),
                    ));
                }
                if let Some(url_root) = &item.request.url_root {
                    if url_root != &sc.defaults.url_root {
                        return Err(Error::invalid(
                            format!("{location}.Requests.{}.URLRoot", item.key),
                            "URLRoot is not allowed inside a request; it originates from Defaults",
                        ));
                    }
                }
                validate_retry_setting(
                    &item.request.retry,
                    format!("{location}.Requests.{}.Retry", item.key),
                )?;
            }
        }

        if let Some(dynamics) = &self.dynamics {
            for (name, pattern) in &dynamics.patterns {
                if pattern.template.is_empty() {
                    return Err(Error::invalid(
                        format!("dynamics.patterns.{name}.template"),
                        "must not be empty",
                    ));
                }
            }
            for (name, set) in &dynamics.sets {
                if set.is_empty() {
                    return Err(Error::invalid(
                        format!("dynamics.sets.{name}"),
                        "must be a non-empty list",
                    ));
                }
            }
        }

        Ok(())
    }
}

fn validate_retry_setting(setting: &RetrySetting, location: impl Into<String>) -> Result<(), Error> {
    if let Some(policy) = setting.policy() {
        policy
            .validate()
            .map_err(|reason| Error::invalid(location, reason))?;
    }
    Ok(())
}

/// Parses and validates a document from YAML text. Anchors and aliases are
/// expanded during parsing; merge keys are applied before deserialization.
pub fn load_str(contents: &str) -> Result<Document, Error> {
    let mut value: Value =
        serde_yaml::from_str(contents).map_err(|source| Error::Yaml { source })?;
    value
        .apply_merge()
        .map_err(|source| Error::Yaml { source })?;
    if value.get("StashConfig").is_none() {
        return Err(Error::invalid(
            "document",
            "top-level 'StashConfig' section is missing",
        ));
    }
    let document: Document =
        serde_yaml::from_value(value).map_err(|source| Error::Yaml { source })?;
    document.validate()?;
    Ok(document)
}

/// Reads, parses, and validates a document from a file.
pub fn load_path(path: &Path) -> Result<Document, Error> {
    let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_str(&contents)
}
