//! Operator detection, resolve-time rewriting, and send-time materialization.
//!
//! A mapping carrying exactly one reserved key (`$dynamic`, `$secrets`,
//! `$func`, `$timestamp`, `$deferred`) is an operator node rather than data;
//! sibling `when` and `format` keys are operator parameters. Operators are
//! normalized into the [`Operator`] enum in a single pass so the rest of the
//! engine never re-detects the mapping syntax.
//!
//! At resolve time, operators marked `when: request` are rewritten into inert
//! `{$deferred: {...}}` markers; everything else becomes a literal value. At
//! send time a second walk materializes the markers with fresh values.

use crate::config::Dynamics;
use crate::dynamic::{self, TimestampFormat};
use crate::secrets::Secrets;
use regex::{Captures, Regex};
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::sync::LazyLock;

static INLINE_SECRET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\s*\$secrets\s*:\s*([A-Za-z0-9_\-\.]+)\s*\}").expect("inline secret regex")
});

static EMPTY_SETS: LazyLock<HashMap<String, Vec<String>>> = LazyLock::new(HashMap::new);

/// Errors that can occur during operator resolution.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// `$dynamic` referenced a pattern name that is not defined.
    #[error("Unknown $dynamic pattern: '{0}'")]
    UnknownPattern(String),
    /// `$dynamic` was used but the document carries no `dynamics` section.
    #[error("$dynamic pattern '{0}' referenced but the document has no dynamics section")]
    MissingDynamics(String),
    /// The operator mapping is malformed.
    #[error("Invalid operator node: {0}")]
    InvalidOperator(String),
    /// Template expansion failed.
    #[error(transparent)]
    Dynamic(#[from] dynamic::Error),
    /// Secret lookup failed.
    #[error(transparent)]
    Secret(#[from] crate::secrets::Error),
}

/// Evaluation moment requested by an operator's `when` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum When {
    /// Evaluate while resolving the document (the default).
    #[default]
    Resolve,
    /// Defer evaluation until immediately before each send.
    Request,
}

/// A deferred-evaluation marker embedded in the resolved tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deferred {
    Dynamic { pattern: String },
    Timestamp { format: TimestampFormat },
}

/// A normalized operator node.
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Dynamic { pattern: String, when: When },
    Timestamp { format: TimestampFormat, when: When },
    Secret { key: String },
    Deferred(Deferred),
}

const RESERVED_KEYS: &[&str] = &["$dynamic", "$secrets", "$func", "$timestamp", "$deferred"];

fn parse_when(value: &Value) -> Result<When, Error> {
    match value.as_str() {
        Some("request") => Ok(When::Request),
        Some("resolve") => Ok(When::Resolve),
        other => Err(Error::InvalidOperator(format!(
            "'when' must be 'resolve' or 'request', got {other:?}"
        ))),
    }
}

fn parse_format(value: &Value) -> Result<TimestampFormat, Error> {
    match value.as_str() {
        Some(name) => Ok(TimestampFormat::parse(name)?),
        None => Err(Error::InvalidOperator(
            "'format' must be a string".to_string(),
        )),
    }
}

/// Inspects a mapping and returns the operator it encodes, if any.
///
/// A mapping with no reserved key is plain data. A mapping with more than
/// one reserved key, or with non-parameter keys alongside a reserved key,
/// is malformed.
pub fn detect(mapping: &Mapping) -> Result<Option<Operator>, Error> {
    let mut reserved: Option<(&str, &Value)> = None;
    let mut when: Option<&Value> = None;
    let mut format: Option<&Value> = None;
    let mut extra: Option<String> = None;

    for (key, value) in mapping {
        let Some(key) = key.as_str() else {
            return Ok(None);
        };
        if RESERVED_KEYS.contains(&key) {
            if let Some((existing, _)) = reserved {
                return Err(Error::InvalidOperator(format!(
                    "mapping carries both '{existing}' and '{key}'"
                )));
            }
            reserved = Some((key, value));
        } else {
            match key {
                "when" => when = Some(value),
                "format" => format = Some(value),
                other => extra = Some(other.to_string()),
            }
        }
    }

    let Some((key, value)) = reserved else {
        return Ok(None);
    };
    if let Some(extra) = extra {
        return Err(Error::InvalidOperator(format!(
            "unexpected key '{extra}' alongside '{key}'"
        )));
    }

    let operator = match key {
        "$dynamic" => {
            if format.is_some() {
                return Err(Error::InvalidOperator(
                    "'format' is not a $dynamic parameter".to_string(),
                ));
            }
            let pattern = value
                .as_str()
                .ok_or_else(|| {
                    Error::InvalidOperator("$dynamic pattern name must be a string".to_string())
                })?
                .to_string();
            let when = when.map(parse_when).transpose()?.unwrap_or_default();
            Operator::Dynamic { pattern, when }
        }
        "$secrets" => {
            if when.is_some() || format.is_some() {
                return Err(Error::InvalidOperator(
                    "$secrets takes no parameters".to_string(),
                ));
            }
            let key = value
                .as_str()
                .ok_or_else(|| {
                    Error::InvalidOperator("$secrets key must be a string".to_string())
                })?
                .to_string();
            Operator::Secret { key }
        }
        "$timestamp" => {
            // Shorthand scalar format, bare null, or a nested mapping
            // carrying `format` and `when`.
            let (inner_format, inner_when) = match value {
                Value::Null => (None, None),
                Value::String(_) => (Some(parse_format(value)?), None),
                Value::Mapping(inner) => {
                    let mut f = None;
                    let mut w = None;
                    for (k, v) in inner {
                        match k.as_str() {
                            Some("format") => f = Some(parse_format(v)?),
                            Some("when") => w = Some(parse_when(v)?),
                            other => {
                                return Err(Error::InvalidOperator(format!(
                                    "unexpected $timestamp parameter {other:?}"
                                )))
                            }
                        }
                    }
                    (f, w)
                }
                _ => {
                    return Err(Error::InvalidOperator(
                        "$timestamp takes a format string or a parameter mapping".to_string(),
                    ))
                }
            };
            let format = match format {
                Some(outer) => parse_format(outer)?,
                None => inner_format.unwrap_or_default(),
            };
            let when = match when {
                Some(outer) => parse_when(outer)?,
                None => inner_when.unwrap_or_default(),
            };
            Operator::Timestamp { format, when }
        }
        "$func" => {
            match value.as_str() {
                Some("timestamp") => {}
                other => {
                    return Err(Error::InvalidOperator(format!(
                        "unknown $func {other:?}, only 'timestamp' is supported"
                    )))
                }
            }
            let format = format.map(parse_format).transpose()?.unwrap_or_default();
            let when = when.map(parse_when).transpose()?.unwrap_or_default();
            Operator::Timestamp { format, when }
        }
        "$deferred" => {
            if when.is_some() || format.is_some() {
                return Err(Error::InvalidOperator(
                    "$deferred takes no parameters".to_string(),
                ));
            }
            Operator::Deferred(parse_deferred(value)?)
        }
        _ => unreachable!("reserved key list is exhaustive"),
    };
    Ok(Some(operator))
}

fn parse_deferred(value: &Value) -> Result<Deferred, Error> {
    let Some(payload) = value.as_mapping() else {
        return Err(Error::InvalidOperator(
            "$deferred payload must be a mapping".to_string(),
        ));
    };
    match payload.get("kind").and_then(Value::as_str) {
        Some("dynamic") => {
            let pattern = payload
                .get("pattern")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    Error::InvalidOperator("deferred dynamic is missing 'pattern'".to_string())
                })?;
            Ok(Deferred::Dynamic {
                pattern: pattern.to_string(),
            })
        }
        Some("timestamp") => {
            let format = match payload.get("format") {
                Some(v) => parse_format(v)?,
                None => TimestampFormat::default(),
            };
            Ok(Deferred::Timestamp { format })
        }
        other => Err(Error::InvalidOperator(format!(
            "unknown deferred kind {other:?}"
        ))),
    }
}

/// Builds the marker node for a deferred operator.
pub fn deferred_marker(deferred: &Deferred) -> Value {
    let mut payload = Mapping::new();
    match deferred {
        Deferred::Dynamic { pattern } => {
            payload.insert("kind".into(), "dynamic".into());
            payload.insert("pattern".into(), pattern.as_str().into());
        }
        Deferred::Timestamp { format } => {
            payload.insert("kind".into(), "timestamp".into());
            payload.insert("format".into(), format.as_str().into());
        }
    }
    let mut marker = Mapping::new();
    marker.insert("$deferred".into(), Value::Mapping(payload));
    Value::Mapping(marker)
}

/// Walks value trees, rewriting operator nodes.
///
/// One resolver covers a whole document so that repeated non-deferred
/// `$dynamic` references to the same pattern name resolve to one stable
/// value (the per-name cache). Send-time materialization bypasses the cache
/// so every send re-expands fresh values.
pub struct Resolver<'a> {
    dynamics: Option<&'a Dynamics>,
    secrets: &'a Secrets,
    cache: HashMap<String, String>,
}

impl<'a> Resolver<'a> {
    pub fn new(dynamics: Option<&'a Dynamics>, secrets: &'a Secrets) -> Self {
        Self {
            dynamics,
            secrets,
            cache: HashMap::new(),
        }
    }

    fn pattern_template(&self, name: &str) -> Result<&'a str, Error> {
        let Some(dynamics) = self.dynamics else {
            return Err(Error::MissingDynamics(name.to_string()));
        };
        dynamics
            .patterns
            .get(name)
            .map(|p| p.template.as_str())
            .ok_or_else(|| Error::UnknownPattern(name.to_string()))
    }

    fn sets(&self) -> &'a HashMap<String, Vec<String>> {
        match self.dynamics {
            Some(dynamics) => &dynamics.sets,
            None => &EMPTY_SETS,
        }
    }

    /// Resolve-time walk: rewrites operators into literals or deferred
    /// markers and interpolates inline `{ $secrets: KEY }` spans in strings.
    pub fn resolve(&mut self, value: Value) -> Result<Value, Error> {
        match value {
            Value::Mapping(mapping) => match detect(&mapping)? {
                Some(operator) => self.apply(operator),
                None => {
                    let mut out = Mapping::new();
                    for (key, value) in mapping {
                        out.insert(key, self.resolve(value)?);
                    }
                    Ok(Value::Mapping(out))
                }
            },
            Value::Sequence(items) => Ok(Value::Sequence(
                items
                    .into_iter()
                    .map(|v| self.resolve(v))
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            Value::String(s) => Ok(Value::String(self.interpolate_inline(&s)?)),
            other => Ok(other),
        }
    }

    fn apply(&mut self, operator: Operator) -> Result<Value, Error> {
        match operator {
            Operator::Dynamic {
                pattern,
                when: When::Request,
            } => Ok(deferred_marker(&Deferred::Dynamic { pattern })),
            Operator::Dynamic {
                pattern,
                when: When::Resolve,
            } => {
                if let Some(cached) = self.cache.get(&pattern) {
                    return Ok(Value::from(cached.clone()));
                }
                let template = self.pattern_template(&pattern)?;
                let expanded = dynamic::expand(template, self.sets(), self.secrets)?;
                self.cache.insert(pattern, expanded.clone());
                Ok(Value::from(expanded))
            }
            Operator::Timestamp {
                format,
                when: When::Request,
            } => Ok(deferred_marker(&Deferred::Timestamp { format })),
            Operator::Timestamp {
                format,
                when: When::Resolve,
            } => Ok(format.render_value()),
            Operator::Secret { key } => Ok(Value::from(self.secrets.resolve(&key)?)),
            // An already-deferred node stays deferred; this keeps resolution
            // of a previously-resolved document well-defined.
            Operator::Deferred(deferred) => Ok(deferred_marker(&deferred)),
        }
    }

    /// Send-time walk: materializes `$deferred` markers with fresh values.
    /// Dynamic patterns re-expand on every call; timestamps use the current
    /// wall clock.
    pub fn materialize(&self, value: Value) -> Result<Value, Error> {
        match value {
            Value::Mapping(mapping) => {
                if let Some(Operator::Deferred(deferred)) = detect(&mapping)? {
                    return match deferred {
                        Deferred::Dynamic { pattern } => {
                            let template = self.pattern_template(&pattern)?;
                            let expanded = dynamic::expand(template, self.sets(), self.secrets)?;
                            Ok(Value::from(expanded))
                        }
                        Deferred::Timestamp { format } => Ok(format.render_value()),
                    };
                }
                let mut out = Mapping::new();
                for (key, value) in mapping {
                    out.insert(key, self.materialize(value)?);
                }
                Ok(Value::Mapping(out))
            }
            Value::Sequence(items) => Ok(Value::Sequence(
                items
                    .into_iter()
                    .map(|v| self.materialize(v))
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            other => Ok(other),
        }
    }

    fn interpolate_inline(&self, text: &str) -> Result<String, Error> {
        if !text.contains("$secrets") {
            return Ok(text.to_string());
        }
        let mut failure: Option<Error> = None;
        let out = INLINE_SECRET.replace_all(text, |caps: &Captures| {
            if failure.is_some() {
                return caps[0].to_string();
            }
            match self.secrets.resolve(&caps[1]) {
                Ok(value) => value,
                Err(e) => {
                    failure = Some(Error::Secret(e));
                    caps[0].to_string()
                }
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(out.into_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Pattern;

    fn dynamics_with(name: &str, template: &str) -> Dynamics {
        Dynamics {
            patterns: HashMap::from([(
                name.to_string(),
                Pattern {
                    template: template.to_string(),
                },
            )]),
            sets: HashMap::new(),
        }
    }

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn test_plain_data_is_not_an_operator() {
        let mapping = yaml("a: 1\nb: 2\n");
        assert_eq!(detect(mapping.as_mapping().unwrap()).unwrap(), None);
    }

    #[test]
    fn test_dynamic_resolves_immediately_by_default() {
        let dynamics = dynamics_with("uid", "u-${hex:4}");
        let secrets = Secrets::default();
        let mut resolver = Resolver::new(Some(&dynamics), &secrets);
        let out = resolver.resolve(yaml("id:\n  $dynamic: uid\n")).unwrap();
        let id = out.get("id").and_then(Value::as_str).unwrap();
        assert!(id.starts_with("u-"));
        assert_eq!(id.len(), 6);
    }

    #[test]
    fn test_dynamic_cache_is_stable_per_name() {
        let dynamics = dynamics_with("uid", "u-${hex:8}");
        let secrets = Secrets::default();
        let mut resolver = Resolver::new(Some(&dynamics), &secrets);
        let out = resolver
            .resolve(yaml("a:\n  $dynamic: uid\nb:\n  $dynamic: uid\n"))
            .unwrap();
        assert_eq!(out.get("a"), out.get("b"));
    }

    #[test]
    fn test_dynamic_defers_when_requested() {
        let dynamics = dynamics_with("uid", "u-${hex:4}");
        let secrets = Secrets::default();
        let mut resolver = Resolver::new(Some(&dynamics), &secrets);
        let out = resolver
            .resolve(yaml("id:\n  $dynamic: uid\n  when: request\n"))
            .unwrap();
        assert_eq!(
            out.get("id"),
            Some(&deferred_marker(&Deferred::Dynamic {
                pattern: "uid".to_string()
            }))
        );
    }

    #[test]
    fn test_unknown_pattern_fails() {
        let dynamics = dynamics_with("uid", "u-${hex:4}");
        let secrets = Secrets::default();
        let mut resolver = Resolver::new(Some(&dynamics), &secrets);
        let err = resolver.resolve(yaml("id:\n  $dynamic: nope\n"));
        assert!(matches!(err, Err(Error::UnknownPattern(_))));
    }

    #[test]
    fn test_dynamic_without_dynamics_section_fails() {
        let secrets = Secrets::default();
        let mut resolver = Resolver::new(None, &secrets);
        let err = resolver.resolve(yaml("id:\n  $dynamic: uid\n"));
        assert!(matches!(err, Err(Error::MissingDynamics(_))));
    }

    #[test]
    fn test_non_string_pattern_name_fails() {
        let secrets = Secrets::default();
        let mut resolver = Resolver::new(None, &secrets);
        let err = resolver.resolve(yaml("id:\n  $dynamic: 7\n"));
        assert!(matches!(err, Err(Error::InvalidOperator(_))));
    }

    #[test]
    fn test_timestamp_shorthand_and_nested_forms() {
        let secrets = Secrets::default();
        let mut resolver = Resolver::new(None, &secrets);

        let out = resolver.resolve(yaml("ts:\n  $timestamp: epoch_ms\n")).unwrap();
        assert!(out.get("ts").unwrap().is_number());

        let out = resolver
            .resolve(yaml("ts:\n  $timestamp:\n    format: iso_8601\n"))
            .unwrap();
        assert!(out.get("ts").unwrap().is_string());

        let out = resolver
            .resolve(yaml(
                "ts:\n  $timestamp:\n    format: epoch_s\n    when: request\n",
            ))
            .unwrap();
        assert_eq!(
            out.get("ts"),
            Some(&deferred_marker(&Deferred::Timestamp {
                format: TimestampFormat::EpochS
            }))
        );
    }

    #[test]
    fn test_timestamp_sibling_when_defers() {
        let secrets = Secrets::default();
        let mut resolver = Resolver::new(None, &secrets);
        let out = resolver
            .resolve(yaml("ts:\n  $timestamp: epoch_ms\n  when: request\n"))
            .unwrap();
        assert_eq!(
            out.get("ts"),
            Some(&deferred_marker(&Deferred::Timestamp {
                format: TimestampFormat::EpochMs
            }))
        );
    }

    #[test]
    fn test_func_timestamp_equivalence() {
        let secrets = Secrets::default();
        let mut resolver = Resolver::new(None, &secrets);
        let out = resolver
            .resolve(yaml("ts:\n  $func: timestamp\n  format: epoch_s\n"))
            .unwrap();
        assert!(out.get("ts").unwrap().is_number());

        let err = resolver.resolve(yaml("x:\n  $func: checksum\n"));
        assert!(matches!(err, Err(Error::InvalidOperator(_))));
    }

    #[test]
    fn test_secret_operator_and_inline_interpolation() {
        let map = HashMap::from([("TOKEN".to_string(), "tok-1".to_string())]);
        let secrets = Secrets::new(Some(map), false);
        let mut resolver = Resolver::new(None, &secrets);
        let out = resolver
            .resolve(yaml(
                "auth:\n  $secrets: TOKEN\ninline: \"Bearer { $secrets: TOKEN }\"\n",
            ))
            .unwrap();
        assert_eq!(out.get("auth").and_then(Value::as_str), Some("tok-1"));
        assert_eq!(
            out.get("inline").and_then(Value::as_str),
            Some("Bearer tok-1")
        );
    }

    #[test]
    fn test_multiple_reserved_keys_fail() {
        let secrets = Secrets::default();
        let mut resolver = Resolver::new(None, &secrets);
        let err = resolver.resolve(yaml("x:\n  $secrets: A\n  $timestamp: epoch_s\n"));
        assert!(matches!(err, Err(Error::InvalidOperator(_))));
    }

    #[test]
    fn test_data_key_alongside_operator_fails() {
        let secrets = Secrets::default();
        let mut resolver = Resolver::new(None, &secrets);
        let err = resolver.resolve(yaml("x:\n  $secrets: A\n  note: hi\n"));
        assert!(matches!(err, Err(Error::InvalidOperator(_))));
    }

    #[test]
    fn test_materialize_expands_fresh_values() {
        let dynamics = dynamics_with("uid", "u-${hex:16}");
        let secrets = Secrets::default();
        let resolver = Resolver::new(Some(&dynamics), &secrets);
        let marker = deferred_marker(&Deferred::Dynamic {
            pattern: "uid".to_string(),
        });
        let first = resolver.materialize(marker.clone()).unwrap();
        let second = resolver.materialize(marker).unwrap();
        assert!(first.as_str().unwrap().starts_with("u-"));
        // 16 random hex chars: a collision would be vanishingly unlikely.
        assert_ne!(first, second);
    }

    #[test]
    fn test_materialize_recurses_into_plain_data() {
        let secrets = Secrets::default();
        let resolver = Resolver::new(None, &secrets);
        let tree = yaml("outer:\n  ts:\n    $deferred:\n      kind: timestamp\n      format: epoch_ms\n  keep: 1\n");
        let out = resolver.materialize(tree).unwrap();
        assert!(out.get("outer").unwrap().get("ts").unwrap().is_number());
        assert_eq!(
            out.get("outer").unwrap().get("keep").and_then(Value::as_u64),
            Some(1)
        );
    }

    #[test]
    fn test_resolving_a_resolved_document_keeps_markers() {
        let secrets = Secrets::default();
        let mut resolver = Resolver::new(None, &secrets);
        let marker = deferred_marker(&Deferred::Timestamp {
            format: TimestampFormat::Iso8601,
        });
        let out = resolver.resolve(marker.clone()).unwrap();
        assert_eq!(out, marker);
    }
}
