//! Access-log line parsing.
//!
//! Lines follow the proxy's extended combined format: the usual
//! `... [time_local] "request" status ...` prefix followed by `key=value`
//! tokens. `-` is the absent sentinel for every field. Parsing never fails;
//! a line that yields nothing recognisable is reported as skipped.

use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset};
use regex::Regex;

/// `%time_local` as written by nginx.
const TIME_LOCAL_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

/// Value that may be a retry list, e.g. `502, 200` or `502,200`. Elements
/// never contain `=`, so a dangling comma cannot absorb the next key.
const LIST_VALUE: &str = r"[^\s,=]+(?:,\s*[^\s,=]+)*";

// Patterns are fixed at compile time. One that fails to build leaves its
// field unrecognised.
static STATUS_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#""[^"]*" (\d{3})\b"#).ok());

static TIMESTAMP_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]").ok());

static POOL_RE: LazyLock<Option<Regex>> = LazyLock::new(|| key_regex("pool", r"\S+"));
static RELEASE_RE: LazyLock<Option<Regex>> = LazyLock::new(|| key_regex("release", r"\S+"));
static UPSTREAM_STATUS_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| key_regex("upstream_status", LIST_VALUE));
static UPSTREAM_RE: LazyLock<Option<Regex>> = LazyLock::new(|| key_regex("upstream", LIST_VALUE));
static REQUEST_TIME_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| key_regex("request_time", r"\S+"));
static UPSTREAM_RESPONSE_TIME_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| key_regex("upstream_response_time", LIST_VALUE));

/// `key=value` token. The value must be followed by whitespace, a comma or
/// the end of the line.
fn key_regex(key: &str, value: &str) -> Option<Regex> {
    Regex::new(&format!(r"(?:^|\s){key}=({value})(?:[\s,]|$)")).ok()
}

/// One structured access-log record.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Request time from the bracketed `time_local` field.
    pub timestamp: Option<DateTime<FixedOffset>>,
    /// Pool that served the request (`pool=`).
    pub pool: Option<String>,
    /// Release identifier of the serving pool (`release=`).
    pub release: Option<String>,
    /// Status code returned to the client.
    pub status: Option<u16>,
    /// Raw `upstream_status=` value; comma-separated when the proxy retried.
    pub upstream_status: Option<String>,
    /// Raw `upstream=` address (or list of addresses).
    pub upstream: Option<String>,
    /// Total request duration in seconds (`request_time=`).
    pub request_time: Option<f64>,
    /// Raw `upstream_response_time=` value.
    pub upstream_response_time: Option<String>,
}

impl LogEntry {
    /// Whether the client-facing status is a 5xx.
    ///
    /// Returns `None` when the line carried no status, so the entry cannot be
    /// classified.
    pub fn outcome(&self) -> Option<bool> {
        self.status.map(|status| (500..=599).contains(&status))
    }

    /// Individual upstream status codes, one per upstream attempt.
    ///
    /// Unparsable parts (including `-`) are dropped.
    pub fn upstream_statuses(&self) -> Vec<u16> {
        self.upstream_status
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .filter_map(|part| part.trim().parse::<u16>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether the proxy tried more than one upstream for this request.
    pub fn was_retried(&self) -> bool {
        self.upstream_status.as_deref().is_some_and(|raw| {
            raw.split(',')
                .filter(|part| !part.trim().is_empty())
                .count()
                > 1
        })
    }

    fn has_any_field(&self) -> bool {
        self.status.is_some()
            || self.pool.is_some()
            || self.release.is_some()
            || self.upstream_status.is_some()
            || self.upstream.is_some()
            || self.request_time.is_some()
            || self.upstream_response_time.is_some()
    }
}

/// Why a line was not turned into a [`LogEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Empty or whitespace-only line.
    Blank,
    /// Neither a status code nor any known `key=value` token was found.
    NoRecognisedFields,
}

/// Result of parsing one raw line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// The line produced a record.
    Parsed(LogEntry),
    /// The line was ignored.
    Skipped(SkipReason),
}

/// Parse one raw access-log line.
pub fn parse_line(line: &str) -> ParseOutcome {
    let line = line.trim();
    if line.is_empty() {
        return ParseOutcome::Skipped(SkipReason::Blank);
    }

    let entry = LogEntry {
        timestamp: capture(&TIMESTAMP_RE, line).and_then(parse_timestamp),
        pool: capture(&POOL_RE, line).map(str::to_owned),
        release: capture(&RELEASE_RE, line).map(str::to_owned),
        status: capture(&STATUS_RE, line).and_then(|s| s.parse().ok()),
        upstream_status: capture(&UPSTREAM_STATUS_RE, line).map(str::to_owned),
        upstream: capture(&UPSTREAM_RE, line).map(str::to_owned),
        request_time: capture(&REQUEST_TIME_RE, line).and_then(|s| s.parse().ok()),
        upstream_response_time: capture(&UPSTREAM_RESPONSE_TIME_RE, line).map(str::to_owned),
    };

    if entry.has_any_field() {
        ParseOutcome::Parsed(entry)
    } else {
        ParseOutcome::Skipped(SkipReason::NoRecognisedFields)
    }
}

/// First capture group of `re`, with the `-` sentinel mapped to `None`.
fn capture<'a>(re: &Option<Regex>, line: &'a str) -> Option<&'a str> {
    let value = re.as_ref()?.captures(line)?.get(1)?.as_str();
    if value == "-" {
        None
    } else {
        Some(value)
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(raw, TIME_LOCAL_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
}
