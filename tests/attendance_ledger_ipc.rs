use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_studytrackd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn studytrackd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

fn create_subject(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    name: &str,
) -> String {
    let created = request_ok(stdin, reader, id, "subjects.create", json!({ "name": name }));
    created
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string()
}

#[test]
fn marking_is_write_once_per_subject_and_date() {
    let workspace = temp_dir("studytrack-ledger-once");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let subject_id = create_subject(&mut stdin, &mut reader, "2", "CS101");

    let marked = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.mark",
        json!({ "subjectId": subject_id, "status": "present", "date": "2024-03-01" }),
    );
    let record = marked.get("record").expect("record");
    assert_eq!(record.get("locked").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        record.get("status").and_then(|v| v.as_str()),
        Some("present")
    );

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.mark",
        json!({ "subjectId": subject_id, "status": "absent", "date": "2024-03-01" }),
    );
    assert_eq!(code, "duplicate_record");

    // The ledger holds exactly one record, with the original status.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.list",
        json!({ "subjectId": subject_id }),
    );
    let records = listed.get("records").and_then(|v| v.as_array()).expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].get("status").and_then(|v| v.as_str()),
        Some("present")
    );
}

#[test]
fn records_are_locked_after_creation() {
    let workspace = temp_dir("studytrack-ledger-locked");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let subject_id = create_subject(&mut stdin, &mut reader, "2", "CS101");

    let marked = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.mark",
        json!({ "subjectId": subject_id, "status": "absent", "date": "2024-03-01" }),
    );
    let record_id = marked
        .get("record")
        .and_then(|r| r.get("id"))
        .and_then(|v| v.as_str())
        .expect("record id")
        .to_string();

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.setStatus",
        json!({ "recordId": record_id, "status": "present" }),
    );
    assert_eq!(code, "record_locked");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.setStatus",
        json!({ "recordId": "no-such-record", "status": "present" }),
    );
    assert_eq!(code, "not_found");

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.list",
        json!({ "subjectId": subject_id }),
    );
    let records = listed.get("records").and_then(|v| v.as_array()).expect("records");
    assert_eq!(
        records[0].get("status").and_then(|v| v.as_str()),
        Some("absent")
    );
}

#[test]
fn future_and_malformed_dates_are_rejected() {
    let workspace = temp_dir("studytrack-ledger-dates");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let subject_id = create_subject(&mut stdin, &mut reader, "2", "CS101");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.mark",
        json!({ "subjectId": subject_id, "status": "present", "date": "2099-01-01" }),
    );
    assert_eq!(code, "invalid_date");

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.mark",
        json!({ "subjectId": subject_id, "status": "present", "date": "01/03/2024" }),
    );
    assert_eq!(code, "invalid_date");

    // Date defaults to today; marking without a date succeeds once.
    let marked = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.mark",
        json!({ "subjectId": subject_id, "status": "present" }),
    );
    assert!(marked.get("record").is_some());
}

#[test]
fn marking_unknown_subject_is_not_found() {
    let workspace = temp_dir("studytrack-ledger-unknown");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.mark",
        json!({ "subjectId": "missing", "status": "present", "date": "2024-03-01" }),
    );
    assert_eq!(code, "not_found");
}

#[test]
fn summary_matches_reference_scenario() {
    let workspace = temp_dir("studytrack-ledger-summary");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let subject_id = create_subject(&mut stdin, &mut reader, "2", "Math");

    // Present, Present, Absent, Present -> 3/4 = exactly 75, safe, nothing to recover.
    for (i, (date, status)) in [
        ("2024-03-01", "present"),
        ("2024-03-04", "present"),
        ("2024-03-05", "absent"),
        ("2024-03-06", "present"),
    ]
    .iter()
    .enumerate()
    {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("m{}", i),
            "attendance.mark",
            json!({ "subjectId": subject_id, "status": status, "date": date }),
        );
    }

    let summary = request_ok(&mut stdin, &mut reader, "9", "attendance.summary", json!({}));
    let subjects = summary
        .get("subjects")
        .and_then(|v| v.as_array())
        .expect("subjects");
    assert_eq!(subjects.len(), 1);
    let s = subjects[0].get("summary").expect("summary");
    assert_eq!(s.get("total").and_then(|v| v.as_i64()), Some(4));
    assert_eq!(s.get("present").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(s.get("percent").and_then(|v| v.as_i64()), Some(75));
    assert_eq!(s.get("zone").and_then(|v| v.as_str()), Some("safe"));
    assert_eq!(s.get("classesNeededFor75").and_then(|v| v.as_i64()), Some(0));

    // Single subject: the overall figure is the same aggregate.
    let overall = summary.get("overall").expect("overall");
    assert_eq!(overall.get("percent").and_then(|v| v.as_i64()), Some(75));
}

#[test]
fn archived_subjects_drop_out_of_analytics_but_keep_history() {
    let workspace = temp_dir("studytrack-ledger-archived");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let math = create_subject(&mut stdin, &mut reader, "2", "Math");
    let latin = create_subject(&mut stdin, &mut reader, "3", "Latin");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.mark",
        json!({ "subjectId": math, "status": "present", "date": "2024-03-01" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.mark",
        json!({ "subjectId": latin, "status": "absent", "date": "2024-03-01" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "subjects.archive",
        json!({ "subjectId": latin }),
    );

    let summary = request_ok(&mut stdin, &mut reader, "7", "attendance.summary", json!({}));
    let subjects = summary
        .get("subjects")
        .and_then(|v| v.as_array())
        .expect("subjects");
    assert_eq!(subjects.len(), 1);
    assert_eq!(
        subjects[0].get("subjectId").and_then(|v| v.as_str()),
        Some(math.as_str())
    );
    let overall = summary.get("overall").expect("overall");
    assert_eq!(overall.get("total").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(overall.get("percent").and_then(|v| v.as_i64()), Some(100));

    // The archived subject's ledger rows survive.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "attendance.list",
        json!({ "subjectId": latin }),
    );
    let records = listed.get("records").and_then(|v| v.as_array()).expect("records");
    assert_eq!(records.len(), 1);
}
