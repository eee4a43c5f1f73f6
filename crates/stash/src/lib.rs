//! PayloadStash artifact pipeline.
//!
//! Owns everything a run writes to disk besides the resolved configuration:
//! per-request response files, the results CSV, and the human-readable run
//! log. Writers are safe to share across the concurrent worker group.

/// Append-only run log with secret redaction.
pub mod log;
/// Results table and CSV flush in authored order.
pub mod results;
/// Response-body files and Content-Type extension mapping.
pub mod writer;
