//! Mender: a self-healing monitoring daemon.
//!
//! Periodically probes a service's health, scans its logs for known error
//! signatures, and runs bounded, cooldown-gated remediation actions without
//! human intervention. One linear detection cycle at a time, on one host.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Append-only JSONL alert sink.
pub mod alerts;
/// Daemon settings loading and validation.
pub mod config;
/// Per-pattern remediation cooldowns.
pub mod cooldown;
/// Detection cycle orchestration and the continuous run loop.
pub mod daemon;
/// SQLite state database for cooldowns and remediation history.
pub mod db;
/// Health probes and rollup.
pub mod health;
/// Host side effects behind capability traits.
pub mod host;
/// Tracing subscriber setup.
pub mod logging;
/// Remediation action execution.
pub mod remediation;
/// Error pattern rule set.
pub mod rules;
/// Log tail scanning.
pub mod scanner;
/// Run statistics.
pub mod stats;
