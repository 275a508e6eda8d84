//! Configuration loading for the watcher.
//!
//! Built once at startup from three layers: defaults, an optional TOML file,
//! then environment variables. All sections use `#[serde(default)]` so a
//! minimal or empty file is valid; validation runs after the env overlay.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use url::Url;

use crate::dispatcher::DispatchPolicy;
use crate::failover::RecoveryPolicy;
use crate::reader::ReaderOptions;

/// Placeholder shipped in sample env files; never a real endpoint.
pub const PLACEHOLDER_WEBHOOK_URL: &str = "https://hooks.slack.com/services/YOUR/WEBHOOK/URL";

/// Env var overriding `log.path`.
pub const ENV_LOG_PATH: &str = "NGINX_LOG_PATH";
/// Env var overriding `log.poll_interval_ms`.
pub const ENV_POLL_INTERVAL_MS: &str = "LOG_POLL_INTERVAL_MS";
/// Env var overriding `thresholds.error_rate_pct`.
pub const ENV_ERROR_RATE_THRESHOLD: &str = "ERROR_RATE_THRESHOLD";
/// Env var overriding `thresholds.window_size`.
pub const ENV_WINDOW_SIZE: &str = "WINDOW_SIZE";
/// Env var overriding `alerts.cooldown_secs`.
pub const ENV_ALERT_COOLDOWN_SEC: &str = "ALERT_COOLDOWN_SEC";
/// Env var overriding `alerts.maintenance_mode`.
pub const ENV_MAINTENANCE_MODE: &str = "MAINTENANCE_MODE";
/// Env var overriding `alerts.primary_pool`.
pub const ENV_PRIMARY_POOL: &str = "POOLWATCH_PRIMARY_POOL";
/// Env var overriding `notifier.webhook_url`.
pub const ENV_WEBHOOK_URL: &str = "SLACK_WEBHOOK_URL";
/// Env var overriding `logging.dir`.
pub const ENV_LOG_DIR: &str = "POOLWATCH_LOG_DIR";

/// Top-level watcher configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatcherConfig {
    /// Access-log location and polling.
    #[serde(default)]
    pub log: LogConfig,

    /// Error-rate window and threshold.
    #[serde(default)]
    pub thresholds: ThresholdsConfig,

    /// Cooldown, maintenance mode and recovery semantics.
    #[serde(default)]
    pub alerts: AlertsConfig,

    /// Webhook endpoint.
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Where the watcher's own logs go.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Access-log tailing settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Access log to tail.
    #[serde(default = "default_log_path")]
    pub path: PathBuf,

    /// Milliseconds to wait when no new lines are available.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Milliseconds between checks while the log file does not exist.
    #[serde(default = "default_missing_retry_ms")]
    pub missing_retry_ms: u64,

    /// Ignore lines already in the file at startup.
    #[serde(default = "default_true")]
    pub start_at_end: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: default_log_path(),
            poll_interval_ms: default_poll_interval_ms(),
            missing_retry_ms: default_missing_retry_ms(),
            start_at_end: true,
        }
    }
}

/// Error-rate evaluation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdsConfig {
    /// Percentage of 5xx responses above which an alert fires (0-100].
    #[serde(default = "default_error_rate_pct")]
    pub error_rate_pct: f64,

    /// Number of most recent requests in the sliding window.
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Requests needed before the rate is evaluated; unset means a full window.
    #[serde(default)]
    pub min_requests: Option<usize>,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            error_rate_pct: default_error_rate_pct(),
            window_size: default_window_size(),
            min_requests: None,
        }
    }
}

/// Alert gating settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    /// Seconds to wait before sending another alert of the same kind.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Detect and log, but never notify.
    #[serde(default)]
    pub maintenance_mode: bool,

    /// Designated primary pool. When set, recovery means "traffic is back on
    /// this pool" instead of "traffic is back on the pool it last left".
    #[serde(default)]
    pub primary_pool: Option<String>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            maintenance_mode: false,
            primary_pool: None,
        }
    }
}

/// Webhook notifier settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    /// Incoming-webhook URL. Required.
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Upper bound in seconds on one webhook call.
    #[serde(default = "default_notifier_timeout_secs")]
    pub timeout_secs: u64,

    /// Footer attached to every alert.
    #[serde(default = "default_footer")]
    pub footer: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_notifier_timeout_secs(),
            footer: default_footer(),
        }
    }
}

/// Logging destination.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Directory for daily-rotated JSON logs. Console only when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl WatcherConfig {
    /// Overlay environment variables read through `lookup`.
    ///
    /// Empty values are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error naming the variable when a value cannot be parsed.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(path) = get(ENV_LOG_PATH) {
            self.log.path = PathBuf::from(path);
        }
        if let Some(ms) = parse_env(&get, ENV_POLL_INTERVAL_MS)? {
            self.log.poll_interval_ms = ms;
        }
        if let Some(pct) = parse_env(&get, ENV_ERROR_RATE_THRESHOLD)? {
            self.thresholds.error_rate_pct = pct;
        }
        if let Some(size) = parse_env(&get, ENV_WINDOW_SIZE)? {
            self.thresholds.window_size = size;
        }
        if let Some(secs) = parse_env(&get, ENV_ALERT_COOLDOWN_SEC)? {
            self.alerts.cooldown_secs = secs;
        }
        if let Some(raw) = get(ENV_MAINTENANCE_MODE) {
            self.alerts.maintenance_mode = parse_bool(&raw)
                .with_context(|| format!("invalid {ENV_MAINTENANCE_MODE}: {raw:?}"))?;
        }
        if let Some(pool) = get(ENV_PRIMARY_POOL) {
            self.alerts.primary_pool = Some(pool.trim().to_owned());
        }
        if let Some(url) = get(ENV_WEBHOOK_URL) {
            self.notifier.webhook_url = Some(url.trim().to_owned());
        }
        if let Some(dir) = get(ENV_LOG_DIR) {
            self.logging.dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    /// Validate the settings the detection pipeline depends on.
    pub fn validate_detection(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.thresholds.error_rate_pct > 0.0 && self.thresholds.error_rate_pct <= 100.0,
            "thresholds.error_rate_pct must be in (0, 100]"
        );
        anyhow::ensure!(
            self.thresholds.window_size >= 1,
            "thresholds.window_size must be >= 1"
        );
        if let Some(min) = self.thresholds.min_requests {
            anyhow::ensure!(
                (1..=self.thresholds.window_size).contains(&min),
                "thresholds.min_requests must be in 1..=window_size"
            );
        }
        if let Some(primary) = &self.alerts.primary_pool {
            anyhow::ensure!(
                !primary.is_empty() && !primary.chars().any(char::is_whitespace),
                "alerts.primary_pool must be a single non-empty token"
            );
        }
        Ok(())
    }

    /// Validate everything needed to run the daemon.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_detection()?;
        anyhow::ensure!(
            self.log.poll_interval_ms >= 1,
            "log.poll_interval_ms must be >= 1"
        );
        anyhow::ensure!(
            self.log.missing_retry_ms >= 1,
            "log.missing_retry_ms must be >= 1"
        );
        anyhow::ensure!(
            self.notifier.timeout_secs >= 1,
            "notifier.timeout_secs must be >= 1"
        );
        self.webhook_url()?;
        Ok(())
    }

    /// Parsed webhook endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is unset, still the sample placeholder,
    /// unparsable, or not http(s).
    pub fn webhook_url(&self) -> anyhow::Result<Url> {
        let raw = self.notifier.webhook_url.as_deref().with_context(|| {
            format!("notifier.webhook_url is not set (or set {ENV_WEBHOOK_URL})")
        })?;
        anyhow::ensure!(
            raw != PLACEHOLDER_WEBHOOK_URL,
            "notifier.webhook_url is still the placeholder value"
        );
        let url = Url::parse(raw).context("notifier.webhook_url is not a valid URL")?;
        anyhow::ensure!(
            matches!(url.scheme(), "http" | "https"),
            "notifier.webhook_url must use http or https"
        );
        anyhow::ensure!(url.host_str().is_some(), "notifier.webhook_url has no host");
        Ok(url)
    }

    /// Endpoint reduced to scheme and host, safe to log.
    pub fn redacted_webhook_url(&self) -> String {
        match self.webhook_url() {
            Ok(url) => format!("{}://{}/…", url.scheme(), url.host_str().unwrap_or("")),
            Err(_) => "(unset)".to_owned(),
        }
    }

    /// Recovery semantics selected by `alerts.primary_pool`.
    pub fn recovery_policy(&self) -> RecoveryPolicy {
        match &self.alerts.primary_pool {
            Some(primary) => RecoveryPolicy::Primary(primary.clone()),
            None => RecoveryPolicy::ReturnToPrevious,
        }
    }

    /// Reader timing derived from `[log]`.
    pub fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            poll_interval: Duration::from_millis(self.log.poll_interval_ms),
            missing_retry: Duration::from_millis(self.log.missing_retry_ms),
            start_at_end: self.log.start_at_end,
        }
    }

    /// Dispatcher settings derived from `[alerts]` and `[notifier]`.
    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            cooldown: Duration::from_secs(self.alerts.cooldown_secs),
            maintenance_mode: self.alerts.maintenance_mode,
            timeout: self.notifier_timeout(),
        }
    }

    /// Upper bound on one webhook call.
    pub fn notifier_timeout(&self) -> Duration {
        Duration::from_secs(self.notifier.timeout_secs)
    }
}

/// Load configuration for the daemon: file (if any), process env, full
/// validation.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, an env var is
/// malformed, or validation fails.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<WatcherConfig> {
    let config = load_config_with(path, |name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

/// Load configuration for offline scanning. Only the detection settings are
/// validated, so no webhook endpoint is needed.
///
/// # Errors
///
/// Same as [`load_config`], minus the daemon-only checks.
pub fn load_detection_config(path: Option<&Path>) -> anyhow::Result<WatcherConfig> {
    let config = load_config_with(path, |name| std::env::var(name).ok())?;
    config.validate_detection()?;
    Ok(config)
}

/// Load configuration from an optional file and an explicit env lookup,
/// without validating.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or an env var is
/// malformed.
pub fn load_config_with<F>(path: Option<&Path>, lookup: F) -> anyhow::Result<WatcherConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config at {}", path.display()))?;
            toml::from_str::<WatcherConfig>(&contents)
                .with_context(|| format!("failed to parse config at {}", path.display()))?
        }
        None => WatcherConfig::default(),
    };
    config.apply_env(lookup)?;
    Ok(config)
}

fn parse_env<T, G>(get: &G, name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {name}: {raw:?}: {e}")),
        None => Ok(None),
    }
}

fn parse_bool(raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected a boolean, got {other:?}"),
    }
}

// Default value functions for serde.

fn default_log_path() -> PathBuf {
    PathBuf::from("/var/log/nginx/access.log")
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_missing_retry_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

fn default_error_rate_pct() -> f64 {
    2.0
}

fn default_window_size() -> usize {
    200
}

fn default_cooldown_secs() -> u64 {
    300
}

fn default_notifier_timeout_secs() -> u64 {
    5
}

fn default_footer() -> String {
    "poolwatch".to_owned()
}
