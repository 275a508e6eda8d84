//! Alert events produced by the detectors and consumed by the dispatcher.

use std::fmt;

use serde::Serialize;

/// Kind of alert. Cooldowns are tracked independently per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Traffic moved from one pool to another.
    Failover,
    /// Rolling 5xx rate exceeded the threshold.
    ErrorRate,
    /// Traffic returned to a pool it had previously left.
    Recovery,
}

impl AlertKind {
    /// Stable lowercase identifier used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Failover => "failover",
            Self::ErrorRate => "error_rate",
            Self::Recovery => "recovery",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity attached to an outbound alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Something changed that an operator should look at.
    Warning,
    /// Requests are failing.
    Critical,
    /// A previous problem cleared.
    Resolved,
}

impl Severity {
    /// Attachment colour understood by Slack-compatible webhooks.
    pub fn color(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "danger",
            Self::Resolved => "good",
        }
    }
}

/// The active pool changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailoverEvent {
    /// Pool that was serving traffic before the change.
    pub from: String,
    /// Pool now serving traffic.
    pub to: String,
}

/// The rolling error rate is above the configured threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRateEvent {
    /// Error percentage over the current window (0-100).
    pub rate: f64,
    /// Configured threshold percentage.
    pub threshold: f64,
    /// Number of 5xx outcomes in the window.
    pub error_count: usize,
    /// Number of outcomes in the window.
    pub window_len: usize,
    /// Pool observed on the request that triggered the event, if known.
    pub current_pool: Option<String>,
}

/// Traffic came back to a pool it had failed away from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryEvent {
    /// Pool serving traffic again.
    pub pool: String,
}

/// Any event the dispatcher knows how to forward.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertEvent {
    /// Pool transition.
    Failover(FailoverEvent),
    /// Error-rate threshold breach.
    ErrorRate(ErrorRateEvent),
    /// Return to a previously departed pool.
    Recovery(RecoveryEvent),
}

impl AlertEvent {
    /// Cooldown key for this event.
    pub fn kind(&self) -> AlertKind {
        match self {
            Self::Failover(_) => AlertKind::Failover,
            Self::ErrorRate(_) => AlertKind::ErrorRate,
            Self::Recovery(_) => AlertKind::Recovery,
        }
    }

    /// Severity used for colouring the outbound alert.
    pub fn severity(&self) -> Severity {
        match self {
            Self::Failover(_) => Severity::Warning,
            Self::ErrorRate(_) => Severity::Critical,
            Self::Recovery(_) => Severity::Resolved,
        }
    }

    /// Short human-readable title.
    pub fn title(&self) -> &'static str {
        match self {
            Self::Failover(_) => "Failover Detected",
            Self::ErrorRate(_) => "High Error Rate Detected",
            Self::Recovery(_) => "Recovery Detected",
        }
    }

    /// One-line description of what happened.
    pub fn message(&self) -> String {
        match self {
            Self::Failover(e) => format!(
                "Traffic switched from `{from}` to `{to}`",
                from = e.from,
                to = e.to
            ),
            Self::ErrorRate(e) => format!(
                "{rate:.2}% of the last {len} requests returned 5xx (threshold {threshold}%)",
                rate = e.rate,
                len = e.window_len,
                threshold = e.threshold
            ),
            Self::Recovery(e) => format!("Pool `{}` is serving traffic again", e.pool),
        }
    }
}

impl From<FailoverEvent> for AlertEvent {
    fn from(event: FailoverEvent) -> Self {
        Self::Failover(event)
    }
}

impl From<ErrorRateEvent> for AlertEvent {
    fn from(event: ErrorRateEvent) -> Self {
        Self::ErrorRate(event)
    }
}

impl From<RecoveryEvent> for AlertEvent {
    fn from(event: RecoveryEvent) -> Self {
        Self::Recovery(event)
    }
}
