//! Tests for access-log tailing.

use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use poolwatch::reader::{LogReader, ReaderError, ReaderOptions};
use tokio::sync::watch;

fn from_start() -> ReaderOptions {
    ReaderOptions {
        poll_interval: Duration::from_millis(10),
        missing_retry: Duration::from_millis(10),
        start_at_end: false,
    }
}

fn append(path: &Path, text: &str) {
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .expect("open for append");
    f.write_all(text.as_bytes()).expect("append");
}

#[test]
fn reads_existing_lines_from_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("access.log");
    append(&path, "first\nsecond\n");

    let mut reader = LogReader::new(path, from_start());
    assert_eq!(reader.poll_lines().expect("poll"), vec!["first", "second"]);
    assert!(reader.poll_lines().expect("poll again").is_empty());
}

#[test]
fn incremental_reads_do_not_repeat_lines() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("access.log");
    append(&path, "one\n");

    let mut reader = LogReader::new(path.clone(), from_start());
    assert_eq!(reader.poll_lines().expect("poll 1"), vec!["one"]);

    append(&path, "two\nthree\n");
    assert_eq!(reader.poll_lines().expect("poll 2"), vec!["two", "three"]);

    append(&path, "four\n");
    assert_eq!(reader.poll_lines().expect("poll 3"), vec!["four"]);
}

#[test]
fn start_at_end_skips_existing_content() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("access.log");
    append(&path, "old 1\nold 2\n");

    let options = ReaderOptions {
        start_at_end: true,
        ..from_start()
    };
    let mut reader = LogReader::new(path.clone(), options);
    assert!(reader.poll_lines().expect("first poll").is_empty());

    append(&path, "new\n");
    assert_eq!(reader.poll_lines().expect("second poll"), vec!["new"]);
}

#[test]
fn missing_file_waits_then_reads_from_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("access.log");

    // start_at_end only applies to a file that exists at startup.
    let options = ReaderOptions {
        start_at_end: true,
        ..from_start()
    };
    let mut reader = LogReader::new(path.clone(), options);
    assert!(reader.poll_lines().expect("poll missing").is_empty());
    assert!(reader.poll_lines().expect("poll missing again").is_empty());

    append(&path, "created\n");
    assert_eq!(reader.poll_lines().expect("poll created"), vec!["created"]);
}

#[test]
fn truncation_resets_offset() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("access.log");
    append(&path, "a fairly long first line\nanother long line here\n");

    let mut reader = LogReader::new(path.clone(), from_start());
    assert_eq!(reader.poll_lines().expect("poll").len(), 2);
    let before = reader.offset();

    // Truncate in place and write something shorter.
    std::fs::write(&path, "fresh\n").expect("truncate");
    let lines = reader.poll_lines().expect("poll after truncate");
    assert_eq!(lines, vec!["fresh"]);
    assert!(reader.offset() < before);

    append(&path, "next\n");
    assert_eq!(reader.poll_lines().expect("poll after append"), vec!["next"]);
}

#[cfg(unix)]
#[test]
fn rename_rotation_reads_new_file_from_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("access.log");
    append(&path, "old\n");

    let mut reader = LogReader::new(path.clone(), from_start());
    assert_eq!(reader.poll_lines().expect("poll"), vec!["old"]);

    std::fs::rename(&path, dir.path().join("access.log.1")).expect("rotate");
    // The new file is immediately longer than the old offset.
    append(&path, "rotated line one\nrotated line two\n");

    assert_eq!(
        reader.poll_lines().expect("poll rotated"),
        vec!["rotated line one", "rotated line two"]
    );
}

#[test]
fn partial_line_is_held_until_complete() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("access.log");
    append(&path, "complete\npart");

    let mut reader = LogReader::new(path.clone(), from_start());
    assert_eq!(reader.poll_lines().expect("poll"), vec!["complete"]);

    append(&path, "ial\n");
    assert_eq!(reader.poll_lines().expect("poll"), vec!["partial"]);
}

#[test]
fn crlf_and_blank_lines_are_normalised() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("access.log");
    append(&path, "one\r\n\n\r\ntwo\n");

    let mut reader = LogReader::new(path, from_start());
    assert_eq!(reader.poll_lines().expect("poll"), vec!["one", "two"]);
}

#[test]
fn invalid_utf8_is_replaced_not_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("access.log");
    std::fs::write(&path, b"ok \xff\xfe bytes\n").expect("write");

    let mut reader = LogReader::new(path, from_start());
    let lines = reader.poll_lines().expect("poll");
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("ok "));
}

#[tokio::test]
async fn next_line_yields_appended_lines_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("access.log");
    let (_tx, mut rx) = watch::channel(false);

    let mut reader = LogReader::new(path.clone(), from_start());

    let writer_path = path.clone();
    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        append(&writer_path, "l1\nl2\n");
        tokio::time::sleep(Duration::from_millis(30)).await;
        append(&writer_path, "l3\n");
    });

    let mut got = Vec::new();
    for _ in 0..3 {
        let line = tokio::time::timeout(Duration::from_secs(5), reader.next_line(&mut rx))
            .await
            .expect("line within timeout")
            .expect("no reader error")
            .expect("not shut down");
        got.push(line);
    }
    writer.await.expect("writer task");
    assert_eq!(got, vec!["l1", "l2", "l3"]);
}

#[tokio::test]
async fn next_line_returns_none_on_shutdown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("never-created.log");
    let (tx, mut rx) = watch::channel(false);

    let mut reader = LogReader::new(path, from_start());
    let handle = tokio::spawn(async move { reader.next_line(&mut rx).await });

    tokio::time::sleep(Duration::from_millis(30)).await;
    tx.send(true).expect("send shutdown");

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("reader stops promptly")
        .expect("task joins");
    assert!(matches!(result, Ok(None)));
}

#[tokio::test]
async fn pending_lines_drain_before_shutdown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("access.log");
    append(&path, "a\nb\n");
    let (tx, mut rx) = watch::channel(false);

    let mut reader = LogReader::new(path, from_start());
    let first = reader.next_line(&mut rx).await.expect("read");
    assert_eq!(first.as_deref(), Some("a"));

    tx.send(true).expect("send shutdown");
    let second = reader.next_line(&mut rx).await.expect("read");
    assert_eq!(second.as_deref(), Some("b"));
    let third = reader.next_line(&mut rx).await.expect("read");
    assert!(third.is_none());
}

#[test]
fn start_at_end_skips_line_in_progress() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("access.log");
    append(&path, "old complete\n\"GET / HTTP/1.1\" 200 pool=bl");

    let options = ReaderOptions {
        start_at_end: true,
        ..from_start()
    };
    let mut reader = LogReader::new(path.clone(), options);
    assert!(reader.poll_lines().expect("first poll").is_empty());

    append(&path, "ue release=x\nfresh\n");
    assert_eq!(reader.poll_lines().expect("second poll"), vec!["fresh"]);

    append(&path, "later\n");
    assert_eq!(reader.poll_lines().expect("third poll"), vec!["later"]);
}

#[test]
fn oversized_line_is_dropped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("access.log");
    let huge = "x".repeat(1_100_000);
    append(&path, &format!("{huge}\nok\n"));

    let mut reader = LogReader::new(path.clone(), from_start());
    assert_eq!(reader.poll_lines().expect("poll"), vec!["ok"]);

    let expected_offset = u64::try_from(huge.len() + 4).expect("fits");
    assert_eq!(reader.offset(), expected_offset);
}

#[test]
fn unterminated_oversized_line_waits_for_newline() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("access.log");
    append(&path, &"y".repeat(1_100_000));

    let mut reader = LogReader::new(path.clone(), from_start());
    assert!(reader.poll_lines().expect("poll").is_empty());
    assert_eq!(reader.offset(), 0);

    append(&path, "tail\nnext\n");
    assert_eq!(reader.poll_lines().expect("poll"), vec!["next"]);
}

#[test]
fn permission_denied_is_fatal() {
    let path = Path::new("/var/log/nginx/access.log");
    let denied = ReaderError::from_io(path, io::Error::from(io::ErrorKind::PermissionDenied));
    assert!(denied.is_fatal());
    assert!(matches!(denied, ReaderError::PermissionDenied { .. }));

    let transient = ReaderError::from_io(path, io::Error::from(io::ErrorKind::Interrupted));
    assert!(!transient.is_fatal());
    assert!(matches!(transient, ReaderError::Io { .. }));
}

#[cfg(unix)]
#[tokio::test]
async fn unreadable_file_stops_next_line() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("access.log");
    append(&path, "secret\n");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o000)).expect("chmod");

    // Root ignores file modes; nothing to check then.
    if std::fs::File::open(&path).is_ok() {
        return;
    }

    let (_tx, mut rx) = watch::channel(false);
    let mut reader = LogReader::new(path.clone(), from_start());
    let err = tokio::time::timeout(Duration::from_secs(5), reader.next_line(&mut rx))
        .await
        .expect("fails promptly")
        .expect_err("permission denied");
    assert!(err.is_fatal());

    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).expect("restore");
}
