//! poolwatch: access-log watcher for blue/green deployments.
//!
//! Tails a reverse proxy's access log, detects traffic moving between
//! service pools, keeps a rolling 5xx rate over the most recent requests,
//! and sends cooldown-limited alerts to a webhook.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Configuration loading and validation.
pub mod config;
/// Maintenance-mode and cooldown gating in front of the notifier.
pub mod dispatcher;
/// Sliding-window error-rate tracking.
pub mod error_rate;
/// Alert event types.
pub mod event;
/// Active-pool tracking and failover detection.
pub mod failover;
/// Structured logging setup.
pub mod logging;
/// The tail → detect → dispatch loop.
pub mod monitor;
/// Webhook notification.
pub mod notifier;
/// Access-log line parsing.
pub mod parser;
/// Synchronous per-line detection.
pub mod pipeline;
/// Access-log tailing.
pub mod reader;
