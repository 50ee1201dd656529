use chrono::{TimeZone, Utc};
use wigg_adapters::{AdapterError, RecordSource, RedditDumpSource};

const DUMP: &str = r#"{
  "submissions": [
    {
      "id": "old1",
      "title": "When does Lost get good?",
      "selftext": "Stuck at S1E2",
      "permalink": "/r/television/comments/old1",
      "subreddit": "television",
      "score": 4,
      "created_utc": 1500000000.0,
      "comments": []
    },
    {
      "id": "new1",
      "title": "When does Severance get good?",
      "selftext": "",
      "permalink": "/r/television/comments/new1",
      "subreddit": "television",
      "score": 30,
      "created_utc": 1700000000.0,
      "comments": [
        {"id": "c1", "body": "It clicks at S1E3 around 20 min", "permalink": "/r/television/comments/new1/c1", "subreddit": "television", "score": 5, "created_utc": 1700000500.0},
        {"id": "c2", "body": "just keep going", "permalink": "/r/television/comments/new1/c2", "subreddit": "television", "score": 1, "created_utc": 1700000600.0}
      ]
    }
  ]
}"#;

#[test]
fn dump_source_filters_by_since_and_keeps_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("dump.json");
    std::fs::write(&path, DUMP).expect("write dump");

    let all = RedditDumpSource::new(&path).load_batches().expect("batches");
    assert_eq!(
        all.iter().map(|b| b.origin_id.as_str()).collect::<Vec<_>>(),
        vec!["old1", "new1"]
    );
    assert_eq!(all[0].candidates.len(), 1);
    assert_eq!(all[0].candidates[0].content_title, "Lost");

    let since = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).single();
    let recent = RedditDumpSource::new(&path)
        .with_since(since)
        .load_batches()
        .expect("batches");
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].origin_id, "new1");
    let moment = &recent[0].candidates[0];
    assert_eq!(moment.source_id, "c1");
    assert_eq!((moment.season, moment.episode, moment.minute), (Some(1), Some(3), Some(20)));
}

#[test]
fn unreadable_dump_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = RedditDumpSource::new(dir.path().join("missing.json"));
    assert!(source.load_batches().is_err());
}

#[test]
fn dump_without_submissions_array_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("empty.json");
    std::fs::write(&path, "{}").expect("write dump");

    let err = RedditDumpSource::new(&path)
        .load_batches()
        .expect_err("missing submissions");
    assert!(matches!(err, AdapterError::Message(ref message) if message.contains("no submissions array")));
}
