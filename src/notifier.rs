//! Outbound alert delivery.
//!
//! [`Notifier`] is the seam between detection and the outside world. The
//! shipped implementation POSTs a Slack-compatible attachment payload to an
//! incoming-webhook URL.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use url::Url;

use crate::event::AlertEvent;

/// Response bodies are truncated to this many characters in errors.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Delivery failure. Always recoverable from the monitor's point of view.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Transport-level failure (DNS, connect, TLS, client timeout).
    #[error("notifier request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The endpoint answered with a non-success status.
    #[error("notifier returned non-success status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The call did not finish within the dispatch timeout.
    #[error("notifier call timed out after {secs}s")]
    Timeout {
        /// Timeout that elapsed.
        secs: u64,
    },
}

/// Sends one alert somewhere.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `event`.
    async fn notify(&self, event: &AlertEvent) -> Result<(), NotifyError>;
}

/// Top-level webhook body.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    /// Always exactly one attachment.
    pub attachments: Vec<Attachment>,
}

/// A single formatted alert.
#[derive(Debug, Clone, Serialize)]
pub struct Attachment {
    /// Severity colour (`warning`, `danger`, `good`).
    pub color: String,
    /// Alert title.
    pub title: String,
    /// One-line description.
    pub text: String,
    /// Event-specific key/value fields.
    pub fields: Vec<AttachmentField>,
    /// Footer identifying the sender.
    pub footer: String,
    /// Unix timestamp of the alert.
    pub ts: i64,
}

/// One key/value row in an attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentField {
    /// Field label.
    pub title: String,
    /// Field value.
    pub value: String,
    /// Whether the field may be rendered side by side with another.
    pub short: bool,
}

impl AttachmentField {
    fn short(title: &str, value: String) -> Self {
        Self {
            title: title.to_owned(),
            value,
            short: true,
        }
    }

    fn long(title: &str, value: String) -> Self {
        Self {
            title: title.to_owned(),
            value,
            short: false,
        }
    }
}

/// Build the webhook body for `event`.
pub fn build_payload(event: &AlertEvent, footer: &str, ts: i64) -> WebhookPayload {
    let fields = match event {
        AlertEvent::Failover(e) => vec![
            AttachmentField::short("Previous Pool", e.from.to_uppercase()),
            AttachmentField::short("Current Pool", e.to.to_uppercase()),
            AttachmentField::long(
                "Action Required",
                format!(
                    "Check health of `{}` and investigate root cause",
                    e.from
                ),
            ),
        ],
        AlertEvent::ErrorRate(e) => vec![
            AttachmentField::short("Error Rate", format!("{:.2}%", e.rate)),
            AttachmentField::short("Threshold", format!("{}%", e.threshold)),
            AttachmentField::long(
                "Window",
                format!("{} errors in {} requests", e.error_count, e.window_len),
            ),
            AttachmentField::short(
                "Current Pool",
                e.current_pool
                    .as_deref()
                    .map_or_else(|| "UNKNOWN".to_owned(), str::to_uppercase),
            ),
            AttachmentField::long(
                "Action Required",
                "Inspect upstream logs and consider toggling pools".to_owned(),
            ),
        ],
        AlertEvent::Recovery(e) => vec![
            AttachmentField::short("Current Pool", e.pool.to_uppercase()),
            AttachmentField::short("Status", "Normal operations resumed".to_owned()),
        ],
    };

    WebhookPayload {
        attachments: vec![Attachment {
            color: event.severity().color().to_owned(),
            title: event.title().to_owned(),
            text: event.message(),
            fields,
            footer: footer.to_owned(),
            ts,
        }],
    }
}

/// Posts alerts to an incoming-webhook endpoint.
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: Url,
    footer: String,
}

impl WebhookNotifier {
    /// Create a notifier whose HTTP client gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(endpoint: Url, footer: String, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, endpoint, footer))
    }

    /// Create a notifier around an existing HTTP client.
    pub fn with_client(client: reqwest::Client, endpoint: Url, footer: String) -> Self {
        Self {
            client,
            endpoint,
            footer,
        }
    }

    /// Endpoint alerts are posted to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &AlertEvent) -> Result<(), NotifyError> {
        let payload = build_payload(event, &self.footer, chrono::Utc::now().timestamp());

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(NotifyError::Status {
            status: status.as_u16(),
            body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
        })
    }
}
