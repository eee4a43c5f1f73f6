//! PayloadStash core library: configuration model and resolution engine.
//!
//! This crate turns an authored YAML document into a concrete request plan.
//! It owns the schema types and validation, the Defaults/Forced merge
//! algebra, the operator language (`$dynamic`, `$secrets`, `$timestamp`)
//! with its deferral rules, and the retry policy model consumed by the
//! dispatch engine.

/// Schema types, document loading, and validation.
pub mod config;
/// Template placeholder expansion for `$dynamic` patterns.
pub mod dynamic;
/// Operator detection, resolve-time rewriting, and send-time materialization.
pub mod operator;
/// Config resolution: section merging, retry precedence, request plan.
pub mod resolve;
/// Retry policy model and backoff computation.
pub mod retry;
/// Secrets file loading, lookup, and redaction.
pub mod secrets;
