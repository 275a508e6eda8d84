//! Maintenance-mode suppression and per-kind cooldown in front of the notifier.
//!
//! Admission and delivery are separate steps. [`AlertDispatcher::admit`]
//! runs on the consumer and updates the cooldown map at attempt time;
//! [`AlertDispatcher::deliver`] performs the bounded notifier call and may run
//! on a detached task. A failed delivery does not reset the cooldown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::event::{AlertEvent, AlertKind};
use crate::notifier::{Notifier, NotifyError};

/// Decision taken for one event before any notifier call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Send it; the cooldown for this kind has been restarted.
    Forward,
    /// Maintenance mode is on.
    Maintenance,
    /// An alert of the same kind was attempted too recently.
    Cooldown {
        /// Time left until the next alert of this kind may go out.
        remaining: Duration,
    },
}

/// Final result of [`AlertDispatcher::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The notifier accepted the alert.
    Delivered,
    /// The notifier call failed or timed out.
    Failed,
    /// The alert never reached the notifier.
    Suppressed(Admission),
}

#[derive(Debug, Default)]
struct KindCounters {
    forwarded: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    cooldown: AtomicU64,
    maintenance: AtomicU64,
}

impl KindCounters {
    fn snapshot(&self) -> KindSnapshot {
        KindSnapshot {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            suppressed_cooldown: self.cooldown.load(Ordering::Relaxed),
            suppressed_maintenance: self.maintenance.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time dispatch counters for one alert kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindSnapshot {
    /// Events admitted and handed to the notifier.
    pub forwarded: u64,
    /// Notifier calls that succeeded.
    pub delivered: u64,
    /// Notifier calls that failed or timed out.
    pub failed: u64,
    /// Events dropped by the cooldown.
    pub suppressed_cooldown: u64,
    /// Events dropped because of maintenance mode.
    pub suppressed_maintenance: u64,
}

/// Point-in-time dispatch counters for all kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSnapshot {
    /// Failover alerts.
    pub failover: KindSnapshot,
    /// Error-rate alerts.
    pub error_rate: KindSnapshot,
    /// Recovery alerts.
    pub recovery: KindSnapshot,
}

impl DispatchSnapshot {
    /// Counters for `kind`.
    pub fn for_kind(&self, kind: AlertKind) -> KindSnapshot {
        match kind {
            AlertKind::Failover => self.failover,
            AlertKind::ErrorRate => self.error_rate,
            AlertKind::Recovery => self.recovery,
        }
    }
}

#[derive(Debug, Default)]
struct DispatchStats {
    failover: KindCounters,
    error_rate: KindCounters,
    recovery: KindCounters,
}

impl DispatchStats {
    fn for_kind(&self, kind: AlertKind) -> &KindCounters {
        match kind {
            AlertKind::Failover => &self.failover,
            AlertKind::ErrorRate => &self.error_rate,
            AlertKind::Recovery => &self.recovery,
        }
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    /// Minimum time between two attempts of the same kind.
    pub cooldown: Duration,
    /// Suppress every alert while still counting it.
    pub maintenance_mode: bool,
    /// Upper bound on one notifier call.
    pub timeout: Duration,
}

struct Inner {
    notifier: Arc<dyn Notifier>,
    policy: DispatchPolicy,
    last_attempt: Mutex<HashMap<AlertKind, Instant>>,
    stats: DispatchStats,
}

/// Rate-limited gateway to a [`Notifier`].
///
/// Cheap to clone; clones share the cooldown map and counters.
#[derive(Clone)]
pub struct AlertDispatcher {
    inner: Arc<Inner>,
}

impl AlertDispatcher {
    /// Create a dispatcher in front of `notifier`.
    pub fn new(notifier: Arc<dyn Notifier>, policy: DispatchPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                notifier,
                policy,
                last_attempt: Mutex::new(HashMap::new()),
                stats: DispatchStats::default(),
            }),
        }
    }

    /// Decide whether `event` may be sent now.
    ///
    /// On [`Admission::Forward`] the cooldown for the event's kind restarts
    /// immediately, whether or not the later delivery succeeds.
    pub fn admit(&self, event: &AlertEvent) -> Admission {
        let kind = event.kind();
        let counters = self.inner.stats.for_kind(kind);

        if self.inner.policy.maintenance_mode {
            bump(&counters.maintenance);
            info!(
                kind = %kind,
                detail = %event.message(),
                "alert suppressed (maintenance mode)"
            );
            return Admission::Maintenance;
        }

        let now = Instant::now();
        let cooldown = self.inner.policy.cooldown;
        let mut last_attempt = match self.inner.last_attempt.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(previous) = last_attempt.get(&kind) {
            let elapsed = now.saturating_duration_since(*previous);
            if elapsed < cooldown {
                drop(last_attempt);
                let remaining = cooldown.saturating_sub(elapsed);
                bump(&counters.cooldown);
                info!(
                    kind = %kind,
                    remaining_secs = remaining.as_secs(),
                    "alert suppressed (cooldown)"
                );
                return Admission::Cooldown { remaining };
            }
        }

        last_attempt.insert(kind, now);
        drop(last_attempt);
        bump(&counters.forwarded);
        Admission::Forward
    }

    /// Call the notifier for an admitted event, bounded by the timeout.
    ///
    /// Failures are logged and counted; returns whether delivery succeeded.
    pub async fn deliver(&self, event: AlertEvent) -> bool {
        let kind = event.kind();
        let counters = self.inner.stats.for_kind(kind);
        let timeout = self.inner.policy.timeout;

        let result =
            match tokio::time::timeout(timeout, self.inner.notifier.notify(&event)).await {
                Ok(result) => result,
                Err(_) => Err(NotifyError::Timeout {
                    secs: timeout.as_secs(),
                }),
            };

        match result {
            Ok(()) => {
                bump(&counters.delivered);
                info!(kind = %kind, detail = %event.message(), "alert delivered");
                true
            }
            Err(e) => {
                bump(&counters.failed);
                warn!(kind = %kind, error = %e, "alert delivery failed");
                false
            }
        }
    }

    /// Admit and, if allowed, deliver inline.
    pub async fn dispatch(&self, event: AlertEvent) -> DispatchOutcome {
        match self.admit(&event) {
            Admission::Forward => {
                if self.deliver(event).await {
                    DispatchOutcome::Delivered
                } else {
                    DispatchOutcome::Failed
                }
            }
            suppressed => DispatchOutcome::Suppressed(suppressed),
        }
    }

    /// Current counters.
    pub fn snapshot(&self) -> DispatchSnapshot {
        let stats = &self.inner.stats;
        DispatchSnapshot {
            failover: stats.failover.snapshot(),
            error_rate: stats.error_rate.snapshot(),
            recovery: stats.recovery.snapshot(),
        }
    }

    /// Whether maintenance mode is on.
    pub fn maintenance_mode(&self) -> bool {
        self.inner.policy.maintenance_mode
    }
}
