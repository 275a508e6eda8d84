//! Tests for the line-to-events pipeline.

use poolwatch::error_rate::ErrorRateTracker;
use poolwatch::event::{AlertEvent, AlertKind};
use poolwatch::failover::FailoverDetector;
use poolwatch::pipeline::Pipeline;

fn line(pool: &str, status: u16) -> String {
    format!(
        r#"10.0.0.7 - - [14/Oct/2026:10:00:00 +0000] "GET /api HTTP/1.1" {status} 612 "-" "curl/8.0" pool={pool} release={pool}-v1 upstream_status={status} upstream=10.0.0.2:3000 request_time=0.004 upstream_response_time=0.004"#
    )
}

fn kinds(events: &[AlertEvent]) -> Vec<AlertKind> {
    events.iter().map(AlertEvent::kind).collect()
}

fn pipeline(window: usize, threshold: f64) -> Pipeline {
    Pipeline::new(
        FailoverDetector::default(),
        ErrorRateTracker::new(window, threshold),
    )
}

#[test]
fn five_entry_window_breaches_on_fifth_line() {
    let mut p = pipeline(5, 50.0);
    let statuses = [200, 500, 502, 200, 503];

    let mut all = Vec::new();
    for (i, status) in statuses.iter().enumerate() {
        let events = p.process_line(&line("blue", *status));
        if i < 4 {
            assert!(events.is_empty(), "line {i} should not alert");
        }
        all.extend(events);
    }

    assert_eq!(all.len(), 1);
    match &all[0] {
        AlertEvent::ErrorRate(e) => {
            assert!((e.rate - 60.0).abs() < 1e-9);
            assert_eq!(e.error_count, 3);
            assert_eq!(e.window_len, 5);
            assert_eq!(e.current_pool.as_deref(), Some("blue"));
        }
        other => panic!("expected error-rate event, got {other:?}"),
    }
}

#[test]
fn pool_events_precede_error_rate_event() {
    let mut p = pipeline(2, 40.0);
    assert!(p.process_line(&line("blue", 500)).is_empty());

    // Switch pools on the line that also fills the failing window.
    let events = p.process_line(&line("green", 502));
    assert_eq!(kinds(&events), vec![AlertKind::Failover, AlertKind::ErrorRate]);
    match &events[1] {
        AlertEvent::ErrorRate(e) => assert_eq!(e.current_pool.as_deref(), Some("green")),
        other => panic!("expected error-rate event, got {other:?}"),
    }
}

#[test]
fn failover_then_recovery_on_return() {
    let mut p = pipeline(200, 2.0);
    assert!(p.process_line(&line("blue", 200)).is_empty());
    assert_eq!(
        kinds(&p.process_line(&line("green", 200))),
        vec![AlertKind::Failover]
    );
    assert_eq!(
        kinds(&p.process_line(&line("blue", 200))),
        vec![AlertKind::Failover, AlertKind::Recovery]
    );

    let counters = p.counters();
    assert_eq!(counters.failovers, 2);
    assert_eq!(counters.recoveries, 1);
    assert_eq!(p.current_pool(), Some("blue"));
}

#[test]
fn unparsable_lines_are_counted_and_ignored() {
    let mut p = pipeline(5, 50.0);
    assert!(p.process_line("").is_empty());
    assert!(p.process_line("complete garbage without fields").is_empty());

    let counters = p.counters();
    assert_eq!(counters.lines, 2);
    assert_eq!(counters.skipped, 2);
    assert_eq!(counters.parsed, 0);
    assert!(p.error_rate().is_empty());
}

#[test]
fn line_without_pool_still_feeds_error_window() {
    let mut p = pipeline(5, 50.0);
    let no_pool = r#"10.0.0.7 - - [14/Oct/2026:10:00:00 +0000] "GET / HTTP/1.1" 502 0 "-" "curl/8.0" pool=- release=-"#;
    assert!(p.process_line(no_pool).is_empty());

    let counters = p.counters();
    assert_eq!(counters.parsed, 1);
    assert_eq!(counters.without_pool, 1);
    assert_eq!(p.error_rate().len(), 1);
    assert_eq!(p.error_rate().error_count(), 1);
    assert!(p.current_pool().is_none());
}

#[test]
fn line_without_status_is_not_counted_in_window() {
    let mut p = pipeline(5, 50.0);
    assert!(p.process_line("pool=blue release=v1 upstream_status=-").is_empty());

    let counters = p.counters();
    assert_eq!(counters.parsed, 1);
    assert_eq!(counters.without_status, 1);
    assert!(p.error_rate().is_empty());
    assert_eq!(p.current_pool(), Some("blue"));
}

#[test]
fn retried_upstreams_are_counted() {
    let mut p = pipeline(5, 50.0);
    let retried = r#"10.0.0.7 - - [14/Oct/2026:10:00:00 +0000] "GET / HTTP/1.1" 200 5 "-" "curl/8.0" pool=green release=v2 upstream_status=502, 200 upstream=10.0.0.2:3000, 10.0.0.3:3000 request_time=0.120"#;
    p.process_line(retried);
    assert_eq!(p.counters().retried, 1);
    assert_eq!(p.error_rate().error_count(), 0);
}

#[test]
fn scan_writes_one_json_line_per_event() {
    let mut p = pipeline(200, 2.0);
    let input = format!(
        "{}\n{}\n{}\n",
        line("blue", 200),
        line("green", 200),
        line("blue", 200)
    );
    let mut out = Vec::new();

    let counters = p.scan(input.as_bytes(), &mut out).expect("scan");

    let text = String::from_utf8(out).expect("utf8");
    let kinds: Vec<String> = text
        .lines()
        .map(|l| {
            let event: serde_json::Value = serde_json::from_str(l).expect("json line");
            event["kind"].as_str().expect("kind").to_owned()
        })
        .collect();
    assert_eq!(kinds, vec!["failover", "failover", "recovery"]);
    assert_eq!(counters.lines, 3);
    assert_eq!(counters.recoveries, 1);
}

#[test]
fn scan_of_quiet_log_writes_nothing() {
    let mut p = pipeline(200, 2.0);
    let input = format!("{}\n{}\n", line("blue", 200), line("blue", 200));
    let mut out = Vec::new();

    let counters = p.scan(input.as_bytes(), &mut out).expect("scan");
    assert!(out.is_empty());
    assert_eq!(counters.parsed, 2);
}
