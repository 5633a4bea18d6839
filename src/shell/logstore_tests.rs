use chrono::{Duration as ChronoDuration, Utc};
use tempfile::TempDir;

use crate::shell::error::ShellError;
use crate::shell::logstore::{LogFilter, LogStore};

fn record_line(ts: &str, line: &str) -> String {
    format!("{{\"timestamp\":\"{ts}\",\"line\":\"{line}\"}}")
}

#[test]
fn create_makes_an_empty_file() {
    let tmp = TempDir::new().unwrap();
    let store = LogStore::new(tmp.path());
    let path = store.create(Utc::now()).unwrap();
    assert!(path.is_absolute());
    assert!(path.exists());
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("log"));
}

#[test]
fn create_resolves_same_second_collisions() {
    let tmp = TempDir::new().unwrap();
    let store = LogStore::new(tmp.path());
    let at = Utc::now();
    let first = store.create(at).unwrap();
    let second = store.create(at).unwrap();
    let third = store.create(at).unwrap();
    assert_ne!(first, second);
    assert_ne!(second, third);
    assert!(second.exists() && third.exists());
}

#[tokio::test]
async fn append_then_read_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let store = LogStore::new(tmp.path());
    let path = store.create(Utc::now()).unwrap();

    let mut appender = store.appender(&path).await.unwrap();
    appender.append("Server starting", Utc::now()).await.unwrap();
    appender.append("ready", Utc::now()).await.unwrap();

    let view = store.read(&path, LogFilter::All).await.unwrap();
    assert_eq!(view.total_records, 2);
    assert_eq!(view.returned_records, 2);
    assert_eq!(view.content, "Server starting\nready");

    // On-disk format: one JSON object per line, UTC timestamp with trailing Z.
    let raw = std::fs::read_to_string(&path).unwrap();
    let first = raw.lines().next().unwrap();
    let value: serde_json::Value = serde_json::from_str(first).unwrap();
    assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    assert_eq!(value["line"], "Server starting");
}

#[tokio::test]
async fn last_n_returns_the_tail_in_order() {
    let tmp = TempDir::new().unwrap();
    let store = LogStore::new(tmp.path());
    let path = store.create(Utc::now()).unwrap();
    let body = [
        record_line("2026-02-16T03:00:00Z", "one"),
        record_line("2026-02-16T03:00:01Z", "two"),
        record_line("2026-02-16T03:00:02Z", "three"),
    ]
    .join("\n");
    std::fs::write(&path, body + "\n").unwrap();

    let view = store.read(&path, LogFilter::LastN(2)).await.unwrap();
    assert_eq!(view.total_records, 3);
    assert_eq!(view.returned_records, 2);
    assert_eq!(view.content, "two\nthree");
}

#[tokio::test]
async fn last_n_larger_than_file_returns_everything() {
    let tmp = TempDir::new().unwrap();
    let store = LogStore::new(tmp.path());
    let path = store.create(Utc::now()).unwrap();
    std::fs::write(&path, record_line("2026-02-16T03:00:00Z", "only") + "\n").unwrap();

    let view = store.read(&path, LogFilter::LastN(50)).await.unwrap();
    assert_eq!(view.returned_records, 1);
    assert_eq!(view.content, "only");
}

#[tokio::test]
async fn since_seconds_filters_against_one_now_sample() {
    let tmp = TempDir::new().unwrap();
    let store = LogStore::new(tmp.path());
    let path = store.create(Utc::now()).unwrap();

    let old = (Utc::now() - ChronoDuration::seconds(30)).to_rfc3339();
    let fresh = Utc::now().to_rfc3339();
    let body = [record_line(&old, "old"), record_line(&fresh, "new")].join("\n");
    std::fs::write(&path, body + "\n").unwrap();

    let view = store.read(&path, LogFilter::SinceSeconds(5)).await.unwrap();
    assert_eq!(view.total_records, 2);
    assert_eq!(view.returned_records, 1);
    assert_eq!(view.content, "new");
}

#[tokio::test]
async fn malformed_and_partial_lines_are_skipped() {
    let tmp = TempDir::new().unwrap();
    let store = LogStore::new(tmp.path());
    let path = store.create(Utc::now()).unwrap();
    let body = format!(
        "{}\nnot json at all\n{}\n{{\"timestamp\":\"2026-02-16T03:00:05Z\",\"li",
        record_line("2026-02-16T03:00:00Z", "first"),
        record_line("2026-02-16T03:00:01Z", "second"),
    );
    std::fs::write(&path, body).unwrap();

    let view = store.read(&path, LogFilter::All).await.unwrap();
    assert_eq!(view.total_records, 2);
    assert_eq!(view.content, "first\nsecond");
}

#[tokio::test]
async fn empty_file_yields_empty_view() {
    let tmp = TempDir::new().unwrap();
    let store = LogStore::new(tmp.path());
    let path = store.create(Utc::now()).unwrap();

    let view = store.read(&path, LogFilter::LastN(1)).await.unwrap();
    assert_eq!(view.total_records, 0);
    assert_eq!(view.returned_records, 0);
    assert_eq!(view.content, "");
}

#[tokio::test]
async fn missing_file_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let store = LogStore::new(tmp.path());
    let err = store
        .read(&tmp.path().join("missing.log"), LogFilter::All)
        .await
        .unwrap_err();
    assert!(matches!(err, ShellError::NotFound(_)));
}
