//! Secrets file loading, lookup, and redaction.
//!
//! Secrets are supplied as a `KEY=VALUE` file and injected into the
//! configuration through `$secrets` operators or `${secrets:KEY}` template
//! placeholders. Artifacts written to disk never carry raw secret values;
//! they are replaced with a redaction sentinel.

use serde_yaml::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Sentinel written in place of a secret value in redacted output.
pub const REDACTED: &str = "***REDACTED***";

/// Errors that can occur while loading or resolving secrets.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Secrets file could not be read.
    #[error("Failed to read secrets file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// A line in the secrets file is not a KEY=VALUE pair.
    #[error("Invalid secrets line {line}: expected KEY=VALUE")]
    InvalidLine { line: usize },
    /// A line in the secrets file has an empty key.
    #[error("Invalid secrets line {line}: empty key")]
    EmptyKey { line: usize },
    /// The requested key is not present in the supplied secrets map.
    #[error("Unknown secret requested: '{0}'")]
    UnknownKey(String),
    /// A secret was referenced but no secrets map was supplied.
    #[error("Secret '{0}' requested but no secrets file was provided")]
    NotProvided(String),
}

/// Parses a `KEY=VALUE` secrets file.
///
/// Blank lines and lines starting with `#` are ignored. Whitespace around the
/// key and the separator is trimmed, surrounding single or double quotes on
/// the value are stripped, and duplicate keys are last-wins.
pub fn load_file(path: &Path) -> Result<HashMap<String, String>, Error> {
    let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&contents)
}

/// Parses secrets file contents. See [`load_file`].
pub fn parse(contents: &str) -> Result<HashMap<String, String>, Error> {
    let mut secrets = HashMap::new();
    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(Error::InvalidLine { line: idx + 1 });
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::EmptyKey { line: idx + 1 });
        }
        let mut value = value.trim();
        if value.len() >= 2 {
            let bytes = value.as_bytes();
            if (bytes[0] == b'"' || bytes[0] == b'\'') && bytes[0] == bytes[value.len() - 1] {
                value = &value[1..value.len() - 1];
            }
        }
        secrets.insert(key.to_string(), value.to_string());
    }
    Ok(secrets)
}

/// Keyed secret lookup with optional redaction.
///
/// When `redact` is set, lookups return the [`REDACTED`] sentinel instead of
/// the value, and an entirely absent map is tolerated (the `validate` and
/// `resolve` commands work without a secrets file). A supplied map missing a
/// requested key always fails, redacted or not.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    map: Option<HashMap<String, String>>,
    redact: bool,
}

impl Secrets {
    pub fn new(map: Option<HashMap<String, String>>, redact: bool) -> Self {
        Self { map, redact }
    }

    /// Resolves a secret key to its value or the redaction sentinel.
    pub fn resolve(&self, key: &str) -> Result<String, Error> {
        match &self.map {
            Some(map) => match map.get(key) {
                Some(value) => {
                    if self.redact {
                        Ok(REDACTED.to_string())
                    } else {
                        Ok(value.clone())
                    }
                }
                None => Err(Error::UnknownKey(key.to_string())),
            },
            None => {
                if self.redact {
                    Ok(REDACTED.to_string())
                } else {
                    Err(Error::NotProvided(key.to_string()))
                }
            }
        }
    }

    /// The raw secret values, longest first, for artifact redaction.
    pub fn values_longest_first(&self) -> Vec<String> {
        let mut values: Vec<String> = self
            .map
            .iter()
            .flat_map(|m| m.values())
            .filter(|v| !v.is_empty())
            .cloned()
            .collect();
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));
        values
    }
}

/// Replaces every occurrence of each secret value in a string with the
/// sentinel. Values must be ordered longest-first so an overlapping shorter
/// value cannot expose the tail of a longer one.
pub fn redact_text(text: &str, values: &[String]) -> String {
    let mut out = text.to_string();
    for value in values {
        if !value.is_empty() && out.contains(value.as_str()) {
            out = out.replace(value.as_str(), REDACTED);
        }
    }
    out
}

/// Walks a value tree and redacts secret values inside every string scalar.
pub fn redact_value(value: &mut Value, values: &[String]) {
    match value {
        Value::String(s) => {
            let redacted = redact_text(s, values);
            if redacted != *s {
                *s = redacted;
            }
        }
        Value::Mapping(mapping) => {
            for (_, v) in mapping.iter_mut() {
                redact_value(v, values);
            }
        }
        Value::Sequence(items) => {
            for v in items {
                redact_value(v, values);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_lines() {
        let secrets = parse("API_KEY=abc123\nTOKEN=xyz\n").unwrap();
        assert_eq!(secrets.get("API_KEY").map(String::as_str), Some("abc123"));
        assert_eq!(secrets.get("TOKEN").map(String::as_str), Some("xyz"));
    }

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        let secrets = parse("# comment\n\nKEY=value\n").unwrap();
        assert_eq!(secrets.len(), 1);
    }

    #[test]
    fn test_parse_strips_quotes() {
        let secrets = parse("A=\"quoted value\"\nB='single'\n").unwrap();
        assert_eq!(secrets.get("A").map(String::as_str), Some("quoted value"));
        assert_eq!(secrets.get("B").map(String::as_str), Some("single"));
    }

    #[test]
    fn test_parse_duplicate_keys_last_wins() {
        let secrets = parse("K=first\nK=second\n").unwrap();
        assert_eq!(secrets.get("K").map(String::as_str), Some("second"));
    }

    #[test]
    fn test_parse_rejects_missing_separator() {
        assert!(matches!(
            parse("NOVALUE\n"),
            Err(Error::InvalidLine { line: 1 })
        ));
    }

    #[test]
    fn test_parse_rejects_empty_key() {
        assert!(matches!(parse("=value\n"), Err(Error::EmptyKey { line: 1 })));
    }

    #[test]
    fn test_resolve_returns_value() {
        let map = HashMap::from([("K".to_string(), "v".to_string())]);
        let secrets = Secrets::new(Some(map), false);
        assert_eq!(secrets.resolve("K").unwrap(), "v");
    }

    #[test]
    fn test_resolve_redacts_when_requested() {
        let map = HashMap::from([("K".to_string(), "v".to_string())]);
        let secrets = Secrets::new(Some(map), true);
        assert_eq!(secrets.resolve("K").unwrap(), REDACTED);
    }

    #[test]
    fn test_resolve_missing_key_fails_even_redacted() {
        let secrets = Secrets::new(Some(HashMap::new()), true);
        assert!(matches!(secrets.resolve("K"), Err(Error::UnknownKey(_))));
    }

    #[test]
    fn test_resolve_absent_map_redacts_or_fails() {
        let redacting = Secrets::new(None, true);
        assert_eq!(redacting.resolve("K").unwrap(), REDACTED);

        let strict = Secrets::new(None, false);
        assert!(matches!(strict.resolve("K"), Err(Error::NotProvided(_))));
    }

    #[test]
    fn test_redact_text_longest_first() {
        let values = vec!["secret-long".to_string(), "secret".to_string()];
        let out = redact_text("token=secret-long rest=secret", &values);
        assert_eq!(out, format!("token={REDACTED} rest={REDACTED}"));
    }

    #[test]
    fn test_redact_value_walks_tree() {
        let mut value: Value =
            serde_yaml::from_str("a: keep\nb:\n  c: hide-me\nd:\n  - hide-me\n").unwrap();
        redact_value(&mut value, &["hide-me".to_string()]);
        let text = serde_yaml::to_string(&value).unwrap();
        assert!(!text.contains("hide-me"));
        assert!(text.contains("keep"));
    }
}
