//! PayloadStash dispatch engine.
//!
//! Executes a resolved request plan: the scheduler walks sequences in
//! authored order with bounded concurrency and pacing, and the executor
//! turns each effective request into HTTP attempts with retry, backoff,
//! and per-attempt timeouts.

/// Request execution with late deferred resolution and the retry loop.
pub mod executor;
/// Sequence iteration, bounded worker groups, and pacing.
pub mod scheduler;
