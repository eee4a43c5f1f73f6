//! Template placeholder expansion for `$dynamic` patterns.
//!
//! Scans a template left-to-right for `${...}` placeholders and replaces each
//! supported form with generated content. Unknown placeholders are emitted
//! verbatim so template text is never silently lost.

use crate::secrets::Secrets;
use chrono::{DateTime, Utc};
use rand::Rng;
use regex::{Captures, Regex};
use serde_yaml::Value;
use std::collections::HashMap;
use std::sync::LazyLock;

const HEX_CHARS: &[u8] = b"0123456789ABCDEF";
const ALPHANUMERIC_CHARS: &[u8] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const NUMERIC_CHARS: &[u8] = b"0123456789";
const ALPHA_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([^}:]+)(?::([^}:]+))?(?::([^}]+))?\}").expect("placeholder regex")
});

/// Errors that can occur during template expansion.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A counted placeholder was given a non-integer count.
    #[error("${{{name}:N}} requires integer N; got: {value:?}")]
    InvalidCount { name: String, value: String },
    /// `${choice:setName}` referenced a set that does not exist.
    #[error("Unknown choice set: {0}")]
    UnknownChoiceSet(String),
    /// `${choice:setName}` referenced a set with no elements.
    #[error("Choice set '{0}' is empty")]
    EmptyChoiceSet(String),
    /// `${choice:...}` was given a second argument.
    #[error("${{choice:setName}} does not support multiple selections")]
    ChoiceExtraArgument,
    /// `${timestamp:fmt}` was given an unsupported format.
    #[error("Unsupported timestamp format: {0}")]
    UnsupportedTimestampFormat(String),
    /// Secret lookup failed.
    #[error(transparent)]
    Secret(#[from] crate::secrets::Error),
}

/// Supported timestamp output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampFormat {
    /// ISO 8601 in UTC with a `Z` suffix, e.g. `2025-09-17T19:35:00Z`.
    #[default]
    Iso8601,
    /// Milliseconds since the Unix epoch.
    EpochMs,
    /// Seconds since the Unix epoch.
    EpochS,
}

impl TimestampFormat {
    /// Parses the format name used in placeholders and operator nodes.
    pub fn parse(name: &str) -> Result<Self, Error> {
        match name {
            "iso_8601" => Ok(TimestampFormat::Iso8601),
            "epoch_ms" => Ok(TimestampFormat::EpochMs),
            "epoch_s" => Ok(TimestampFormat::EpochS),
            other => Err(Error::UnsupportedTimestampFormat(other.to_string())),
        }
    }

    /// Canonical name, as written in configuration documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            TimestampFormat::Iso8601 => "iso_8601",
            TimestampFormat::EpochMs => "epoch_ms",
            TimestampFormat::EpochS => "epoch_s",
        }
    }

    /// Renders an instant in this format as template text.
    pub fn render(&self, now: DateTime<Utc>) -> String {
        match self {
            TimestampFormat::Iso8601 => now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            TimestampFormat::EpochMs => now.timestamp_millis().to_string(),
            TimestampFormat::EpochS => now.timestamp().to_string(),
        }
    }

    /// Renders the current instant as a YAML value: epoch formats produce
    /// integers, ISO 8601 produces a string.
    pub fn render_value(&self) -> Value {
        let now = Utc::now();
        match self {
            TimestampFormat::Iso8601 => Value::from(self.render(now)),
            TimestampFormat::EpochMs => Value::from(now.timestamp_millis()),
            TimestampFormat::EpochS => Value::from(now.timestamp()),
        }
    }
}

fn random_chars(chars: &[u8], count: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| chars[rng.gen_range(0..chars.len())] as char)
        .collect()
}

fn parse_count(name: &str, arg: Option<&str>) -> Result<usize, Error> {
    let raw = arg.unwrap_or("");
    raw.parse::<usize>().map_err(|_| Error::InvalidCount {
        name: name.to_string(),
        value: raw.to_string(),
    })
}

/// Expands every supported `${...}` placeholder in `template`.
///
/// Supported forms: `hex:N`, `alphanumeric:N`, `numeric:N`, `alpha:N`,
/// `uuidv4`, `choice:setName`, `timestamp[:fmt]` (and the `@timestamp`
/// alias), and `secrets:KEY` (with `secret:KEY` accepted as an alias).
/// `N` may be zero, which yields an empty segment. Unknown placeholders are
/// left untouched.
pub fn expand(
    template: &str,
    sets: &HashMap<String, Vec<String>>,
    secrets: &Secrets,
) -> Result<String, Error> {
    let mut failure: Option<Error> = None;
    let out = PLACEHOLDER.replace_all(template, |caps: &Captures| {
        if failure.is_some() {
            return caps[0].to_string();
        }
        match expand_one(caps, sets, secrets) {
            Ok(replacement) => replacement,
            Err(e) => {
                failure = Some(e);
                caps[0].to_string()
            }
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(out.into_owned()),
    }
}

fn expand_one(
    caps: &Captures,
    sets: &HashMap<String, Vec<String>>,
    secrets: &Secrets,
) -> Result<String, Error> {
    let name = &caps[1];
    let arg1 = caps.get(2).map(|m| m.as_str());
    let arg2 = caps.get(3).map(|m| m.as_str());
    match name {
        "hex" => Ok(random_chars(HEX_CHARS, parse_count(name, arg1)?)),
        "alphanumeric" => Ok(random_chars(ALPHANUMERIC_CHARS, parse_count(name, arg1)?)),
        "numeric" => Ok(random_chars(NUMERIC_CHARS, parse_count(name, arg1)?)),
        "alpha" => Ok(random_chars(ALPHA_CHARS, parse_count(name, arg1)?)),
        "uuidv4" => Ok(uuid::Uuid::new_v4().to_string()),
        "timestamp" | "@timestamp" => {
            let format = match arg1 {
                Some(fmt) => TimestampFormat::parse(fmt)?,
                None => TimestampFormat::default(),
            };
            Ok(format.render(Utc::now()))
        }
        "secrets" | "secret" => {
            let key = arg1.unwrap_or("");
            Ok(secrets.resolve(key)?)
        }
        "choice" => {
            let set_name = arg1.unwrap_or("");
            if arg2.is_some() {
                return Err(Error::ChoiceExtraArgument);
            }
            let pool = sets
                .get(set_name)
                .ok_or_else(|| Error::UnknownChoiceSet(set_name.to_string()))?;
            if pool.is_empty() {
                return Err(Error::EmptyChoiceSet(set_name.to_string()));
            }
            let idx = rand::thread_rng().gen_range(0..pool.len());
            Ok(pool[idx].clone())
        }
        // Unknown placeholder: emit verbatim to avoid data loss.
        _ => Ok(caps[0].to_string()),
    }
}
