use deliberd::audit::{JsonlAuditWriter, KillAuditEntry, KillAuditLogger};
use deliberd::models::session::TerminationType;

fn sample_entry(session_id: &str) -> KillAuditEntry {
    KillAuditEntry::new(
        session_id.to_owned(),
        "admin".into(),
        TerminationType::AdminTerminated,
        Some("runaway panel".into()),
        12.5,
        0.25,
    )
}

#[test]
fn writes_one_json_line_per_entry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let writer = JsonlAuditWriter::new(dir.path().to_path_buf()).expect("writer");

    writer.log_entry(sample_entry("sess-1")).expect("log");
    writer.log_entry(sample_entry("sess-2")).expect("log");

    let files: Vec<_> = std::fs::read_dir(dir.path())
        .expect("read dir")
        .flatten()
        .collect();
    assert_eq!(files.len(), 1, "one file per calendar day");

    let name = files[0].file_name().to_string_lossy().to_string();
    assert!(name.starts_with("kills-"), "got {name}");
    assert!(name.ends_with(".jsonl"));

    let content = std::fs::read_to_string(files[0].path()).expect("read");
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);

    let first: serde_json::Value = serde_json::from_str(lines[0]).expect("valid json");
    assert_eq!(first["session_id"], "sess-1");
    assert_eq!(first["actor"], "admin");
    assert_eq!(first["termination_type"], "admin_terminated");
    assert_eq!(first["billable_portion"], 0.25);
}

#[test]
fn creates_missing_log_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let nested = dir.path().join("deep").join("logs");

    let writer = JsonlAuditWriter::new(nested.clone()).expect("writer");
    writer.log_entry(sample_entry("sess-1")).expect("log");

    assert!(nested.exists());
}

#[test]
fn entries_preserve_optional_reason() {
    let dir = tempfile::tempdir().expect("tempdir");
    let writer = JsonlAuditWriter::new(dir.path().to_path_buf()).expect("writer");

    let mut entry = sample_entry("sess-1");
    entry.reason = None;
    writer.log_entry(entry).expect("log");

    let file = std::fs::read_dir(dir.path())
        .expect("read dir")
        .flatten()
        .next()
        .expect("file");
    let content = std::fs::read_to_string(file.path()).expect("read");
    let parsed: serde_json::Value = serde_json::from_str(content.trim()).expect("json");
    assert!(parsed["reason"].is_null());
}
