//! Synchronous detection: parse a line, update both trackers, collect events.

use std::io::{BufRead, Write};

use anyhow::Context;
use serde::Serialize;
use tracing::debug;

use crate::config::WatcherConfig;
use crate::error_rate::ErrorRateTracker;
use crate::event::AlertEvent;
use crate::failover::FailoverDetector;
use crate::parser::{parse_line, LogEntry, ParseOutcome};

/// Running totals kept by the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineCounters {
    /// Raw lines fed in.
    pub lines: u64,
    /// Lines that produced an entry.
    pub parsed: u64,
    /// Lines skipped by the parser.
    pub skipped: u64,
    /// Entries without a pool.
    pub without_pool: u64,
    /// Entries without a client status, not counted in the error window.
    pub without_status: u64,
    /// Entries where the proxy tried more than one upstream.
    pub retried: u64,
    /// Failover events detected.
    pub failovers: u64,
    /// Recovery events detected.
    pub recoveries: u64,
    /// Error-rate events detected.
    pub error_rate_breaches: u64,
}

fn incr(counter: &mut u64) {
    *counter = counter.saturating_add(1);
}

/// Parser plus both detectors, fed one line at a time in log order.
#[derive(Debug, Clone)]
pub struct Pipeline {
    failover: FailoverDetector,
    error_rate: ErrorRateTracker,
    counters: PipelineCounters,
}

impl Pipeline {
    /// Assemble a pipeline from its detectors.
    pub fn new(failover: FailoverDetector, error_rate: ErrorRateTracker) -> Self {
        Self {
            failover,
            error_rate,
            counters: PipelineCounters::default(),
        }
    }

    /// Build the detectors from configuration.
    pub fn from_config(config: &WatcherConfig) -> Self {
        Self::new(
            FailoverDetector::new(config.recovery_policy()),
            ErrorRateTracker::with_min_requests(
                config.thresholds.window_size,
                config.thresholds.error_rate_pct,
                config.thresholds.min_requests,
            ),
        )
    }

    /// Process one raw line and return the events it triggered.
    pub fn process_line(&mut self, line: &str) -> Vec<AlertEvent> {
        incr(&mut self.counters.lines);
        match parse_line(line) {
            ParseOutcome::Parsed(entry) => self.process_entry(&entry),
            ParseOutcome::Skipped(reason) => {
                incr(&mut self.counters.skipped);
                debug!(?reason, line, "skipping log line");
                Vec::new()
            }
        }
    }

    /// Process one parsed entry.
    ///
    /// Pool events come first (failover, then recovery); an error-rate event,
    /// if any, comes last and carries the pool current after this entry.
    pub fn process_entry(&mut self, entry: &LogEntry) -> Vec<AlertEvent> {
        incr(&mut self.counters.parsed);
        let mut events = Vec::new();

        if entry.was_retried() {
            incr(&mut self.counters.retried);
            debug!(
                upstream_status = entry.upstream_status.as_deref().unwrap_or("-"),
                upstream = entry.upstream.as_deref().unwrap_or("-"),
                "proxy retried upstream"
            );
        }

        match entry.pool.as_deref() {
            Some(pool) => {
                if let Some(transition) = self.failover.observe(Some(pool)) {
                    incr(&mut self.counters.failovers);
                    if transition.recovery.is_some() {
                        incr(&mut self.counters.recoveries);
                    }
                    events.extend(transition.into_events());
                }
            }
            None => incr(&mut self.counters.without_pool),
        }

        match entry.outcome() {
            Some(is_error) => {
                if let Some(mut breach) = self.error_rate.record(is_error) {
                    incr(&mut self.counters.error_rate_breaches);
                    breach.current_pool = self.failover.current_pool().map(str::to_owned);
                    events.push(breach.into());
                }
            }
            None => incr(&mut self.counters.without_status),
        }

        events
    }

    /// Replay `input` from the start, writing each detected event to `out` as
    /// one JSON line. Returns the totals once input is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if reading `input` or writing `out` fails.
    pub fn scan<R, W>(&mut self, input: R, out: &mut W) -> anyhow::Result<PipelineCounters>
    where
        R: BufRead,
        W: Write,
    {
        for line in input.lines() {
            let line = line.context("failed to read input")?;
            for event in self.process_line(&line) {
                serde_json::to_writer(&mut *out, &event).context("failed to encode event")?;
                writeln!(out).context("failed to write event")?;
            }
        }
        Ok(self.counters)
    }

    /// Totals so far.
    pub fn counters(&self) -> PipelineCounters {
        self.counters
    }

    /// Pool currently serving traffic.
    pub fn current_pool(&self) -> Option<&str> {
        self.failover.current_pool()
    }

    /// The error-rate window.
    pub fn error_rate(&self) -> &ErrorRateTracker {
        &self.error_rate
    }
}
