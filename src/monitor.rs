//! The watcher loop: tail, detect, dispatch.
//!
//! One `Monitor` owns every piece of state. Lines are consumed strictly in
//! log order on a single task; only notifier calls run detached, tracked in a
//! `JoinSet` so shutdown can wait for them.

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::WatcherConfig;
use crate::dispatcher::{Admission, AlertDispatcher, DispatchSnapshot};
use crate::event::AlertEvent;
use crate::notifier::Notifier;
use crate::pipeline::{Pipeline, PipelineCounters};
use crate::reader::{LineSource, LogReader};

/// Totals reported when the monitor stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorSummary {
    /// Parsing and detection totals.
    pub pipeline: PipelineCounters,
    /// Dispatch totals per alert kind.
    pub dispatch: DispatchSnapshot,
}

/// Drives a [`LineSource`] (normally a [`LogReader`]) → [`Pipeline`] →
/// [`AlertDispatcher`].
pub struct Monitor {
    reader: Box<dyn LineSource>,
    pipeline: Pipeline,
    dispatcher: AlertDispatcher,
    inflight: JoinSet<()>,
}

impl Monitor {
    /// Assemble a monitor from its parts.
    pub fn new(
        reader: impl LineSource + 'static,
        pipeline: Pipeline,
        dispatcher: AlertDispatcher,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            pipeline,
            dispatcher,
            inflight: JoinSet::new(),
        }
    }

    /// Build every component from a validated configuration.
    pub fn from_config(config: &WatcherConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self::new(
            LogReader::new(config.log.path.clone(), config.reader_options()),
            Pipeline::from_config(config),
            AlertDispatcher::new(notifier, config.dispatch_policy()),
        )
    }

    /// Run detection on one line and hand each resulting event to the
    /// dispatcher. Admitted events are delivered on a detached task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn handle_line(&mut self, line: &str) -> Vec<(AlertEvent, Admission)> {
        let events = self.pipeline.process_line(line);
        let mut decisions = Vec::with_capacity(events.len());

        for event in events {
            info!(
                kind = %event.kind(),
                detail = %event.message(),
                "alert condition detected"
            );
            let admission = self.dispatcher.admit(&event);
            if admission == Admission::Forward {
                let dispatcher = self.dispatcher.clone();
                let delivered = event.clone();
                self.inflight.spawn(async move {
                    dispatcher.deliver(delivered).await;
                });
            }
            decisions.push((event, admission));
        }

        decisions
    }

    /// Wait for every in-flight delivery. Each is bounded by the notifier
    /// timeout.
    pub async fn drain(&mut self) {
        while let Some(result) = self.inflight.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "alert delivery task failed");
            }
        }
    }

    /// Run until `shutdown` is set.
    ///
    /// # Errors
    ///
    /// Returns an error only when the log file becomes permanently unreadable.
    /// In-flight deliveries are awaited in either case.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<MonitorSummary> {
        info!(
            source = %self.reader.describe(),
            maintenance_mode = self.dispatcher.maintenance_mode(),
            "monitoring started"
        );

        let result = loop {
            match self.reader.next_line(&mut shutdown).await {
                Ok(Some(line)) => {
                    self.handle_line(&line);
                    self.reap();
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        if !self.inflight.is_empty() {
            info!(pending = self.inflight.len(), "waiting for in-flight alerts");
        }
        self.drain().await;

        let summary = self.summary();
        info!(
            lines = summary.pipeline.lines,
            parsed = summary.pipeline.parsed,
            skipped = summary.pipeline.skipped,
            failovers = summary.pipeline.failovers,
            recoveries = summary.pipeline.recoveries,
            error_rate_breaches = summary.pipeline.error_rate_breaches,
            "monitoring stopped"
        );

        result.context("log reader failed")?;
        Ok(summary)
    }

    /// Current totals.
    pub fn summary(&self) -> MonitorSummary {
        MonitorSummary {
            pipeline: self.pipeline.counters(),
            dispatch: self.dispatcher.snapshot(),
        }
    }

    /// The detection pipeline.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Collect deliveries that already finished.
    fn reap(&mut self) {
        while let Some(result) = self.inflight.try_join_next() {
            if let Err(e) = result {
                warn!(error = %e, "alert delivery task failed");
            }
        }
    }
}
