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
    let exe = env!("CARGO_BIN_EXE_reviewd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn reviewd");
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

/// One student with a guide review whose deadline passed in 2025.
fn setup(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, prefix: &str) {
    let workspace = temp_dir(prefix);
    request_ok(
        stdin,
        reader,
        "setup-ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        stdin,
        reader,
        "setup-rubric",
        "rubric.define",
        json!({
            "school": "SCOPE",
            "department": "CSE",
            "reviews": [{
                "reviewName": "review1",
                "facultyType": "guide",
                "components": [{ "name": "design", "weight": 20 }],
                "deadline": { "from": "2025-01-01T00:00:00Z", "to": "2025-01-10T00:00:00Z" }
            }]
        }),
    );
    request_ok(
        stdin,
        reader,
        "setup-project",
        "project.create",
        json!({
            "school": "SCOPE",
            "department": "CSE",
            "title": "Capstone",
            "guideFaculty": "F001",
            "students": [{ "regNo": "21BCE100", "name": "Asha" }]
        }),
    );
}

fn create_request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "extension.request",
        json!({
            "regNo": "21BCE100",
            "reviewName": "review1",
            "facultyType": "guide",
            "faculty": "F001",
            "reason": "hospitalized during review window"
        }),
    );
    created["requestId"].as_str().expect("requestId").to_string()
}

#[test]
fn approval_reopens_locked_review() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup(&mut stdin, &mut reader, "reviewd-ext-approve");

    // Locked before any request.
    let before = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "review.lockStatus",
        json!({ "regNo": "21BCE100", "reviewName": "review1", "facultyType": "guide" }),
    );
    assert_eq!(before["locked"].as_bool(), Some(true));

    let request_id = create_request(&mut stdin, &mut reader, "2");

    let status = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "review.status",
        json!({ "regNo": "21BCE100", "reviewName": "review1", "facultyType": "guide" }),
    );
    assert_eq!(status["status"].as_str(), Some("pending"));

    let resolved = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "extension.resolve",
        json!({
            "requestId": request_id,
            "status": "approved",
            "newDeadline": "2099-01-20T00:00:00Z"
        }),
    );
    assert_eq!(resolved["status"].as_str(), Some("approved"));

    let after = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "review.lockStatus",
        json!({ "regNo": "21BCE100", "reviewName": "review1", "facultyType": "guide" }),
    );
    assert_eq!(after["locked"].as_bool(), Some(false));
    assert_eq!(
        after["effectiveDeadline"].as_str(),
        Some("2099-01-20T00:00:00+00:00")
    );

    let status = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "review.status",
        json!({ "regNo": "21BCE100", "reviewName": "review1", "facultyType": "guide" }),
    );
    assert_eq!(status["status"].as_str(), Some("approved"));

    // The reopened window accepts submissions again.
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "review.submit",
        json!({
            "regNo": "21BCE100",
            "reviewName": "review1",
            "facultyType": "guide",
            "marks": { "design": 18 },
            "attendance": { "value": true }
        }),
    );
}

#[test]
fn approval_clears_hard_lock() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup(&mut stdin, &mut reader, "reviewd-ext-hard-lock");

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "review.setLock",
        json!({ "regNo": "21BCE100", "reviewName": "review1", "locked": true }),
    );
    let request_id = create_request(&mut stdin, &mut reader, "2");
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "extension.resolve",
        json!({
            "requestId": request_id,
            "status": "approved",
            "newDeadline": "2099-01-20T00:00:00Z"
        }),
    );

    let after = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "review.lockStatus",
        json!({ "regNo": "21BCE100", "reviewName": "review1", "facultyType": "guide" }),
    );
    assert_eq!(after["hardLocked"].as_bool(), Some(false));
    assert_eq!(after["locked"].as_bool(), Some(false));
}

#[test]
fn rejection_changes_nothing_and_is_terminal() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup(&mut stdin, &mut reader, "reviewd-ext-reject");

    let request_id = create_request(&mut stdin, &mut reader, "1");
    let resolved = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "extension.resolve",
        json!({ "requestId": request_id, "status": "rejected" }),
    );
    assert_eq!(resolved["status"].as_str(), Some("rejected"));

    // Still exactly as locked as the deadline dictates.
    let status = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "review.lockStatus",
        json!({ "regNo": "21BCE100", "reviewName": "review1", "facultyType": "guide" }),
    );
    assert_eq!(status["locked"].as_bool(), Some(true));

    // A rejected latest request gates as none.
    let review_status = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "review.status",
        json!({ "regNo": "21BCE100", "reviewName": "review1", "facultyType": "guide" }),
    );
    assert_eq!(review_status["status"].as_str(), Some("none"));
    assert_eq!(review_status["latest"].as_str(), Some("rejected"));

    // Terminal: re-resolving is a conflict and changes no state.
    let again = request(
        &mut stdin,
        &mut reader,
        "5",
        "extension.resolve",
        json!({
            "requestId": request_id,
            "status": "approved",
            "newDeadline": "2099-01-20T00:00:00Z"
        }),
    );
    assert_eq!(again["error"]["code"].as_str(), Some("conflict"));
    let still = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "review.lockStatus",
        json!({ "regNo": "21BCE100", "reviewName": "review1", "facultyType": "guide" }),
    );
    assert_eq!(still["locked"].as_bool(), Some(true));
}

#[test]
fn duplicate_pending_request_is_a_conflict() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup(&mut stdin, &mut reader, "reviewd-ext-duplicate");

    let _first = create_request(&mut stdin, &mut reader, "1");
    let second = request(
        &mut stdin,
        &mut reader,
        "2",
        "extension.request",
        json!({
            "regNo": "21BCE100",
            "reviewName": "review1",
            "facultyType": "guide",
            "faculty": "F001",
            "reason": "second tab"
        }),
    );
    assert_eq!(second["error"]["code"].as_str(), Some("conflict"));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "extension.list",
        json!({ "regNo": "21BCE100", "status": "pending" }),
    );
    assert_eq!(listed["requests"].as_array().map(|a| a.len()), Some(1));
}

#[test]
fn approval_validates_deadline_before_any_mutation() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup(&mut stdin, &mut reader, "reviewd-ext-bad-deadline");

    let request_id = create_request(&mut stdin, &mut reader, "1");

    let missing = request(
        &mut stdin,
        &mut reader,
        "2",
        "extension.resolve",
        json!({ "requestId": request_id, "status": "approved" }),
    );
    assert_eq!(missing["error"]["code"].as_str(), Some("bad_params"));

    let garbage = request(
        &mut stdin,
        &mut reader,
        "3",
        "extension.resolve",
        json!({ "requestId": request_id, "status": "approved", "newDeadline": "tomorrow" }),
    );
    assert_eq!(garbage["error"]["code"].as_str(), Some("bad_params"));

    let past = request(
        &mut stdin,
        &mut reader,
        "4",
        "extension.resolve",
        json!({
            "requestId": request_id,
            "status": "approved",
            "newDeadline": "2020-01-01T00:00:00Z"
        }),
    );
    assert_eq!(past["error"]["code"].as_str(), Some("bad_params"));

    // The request is still pending and the review still locked.
    let status = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "review.status",
        json!({ "regNo": "21BCE100", "reviewName": "review1", "facultyType": "guide" }),
    );
    assert_eq!(status["status"].as_str(), Some("pending"));
    let lock = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "review.lockStatus",
        json!({ "regNo": "21BCE100", "reviewName": "review1", "facultyType": "guide" }),
    );
    assert_eq!(lock["locked"].as_bool(), Some(true));

    let unknown = request(
        &mut stdin,
        &mut reader,
        "7",
        "extension.resolve",
        json!({
            "requestId": "no-such-request",
            "status": "approved",
            "newDeadline": "2099-01-20T00:00:00Z"
        }),
    );
    assert_eq!(unknown["error"]["code"].as_str(), Some("not_found"));
}

#[test]
fn override_deadline_never_moves_backwards() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup(&mut stdin, &mut reader, "reviewd-ext-monotonic");

    let first = create_request(&mut stdin, &mut reader, "1");
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "extension.resolve",
        json!({
            "requestId": first,
            "status": "approved",
            "newDeadline": "2099-06-01T00:00:00Z"
        }),
    );

    // A later approval with an earlier deadline keeps the further one.
    let second = create_request(&mut stdin, &mut reader, "3");
    let resolved = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "extension.resolve",
        json!({
            "requestId": second,
            "status": "approved",
            "newDeadline": "2099-03-01T00:00:00Z"
        }),
    );
    assert_eq!(
        resolved["newDeadline"].as_str(),
        Some("2099-06-01T00:00:00+00:00")
    );

    let lock = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "review.lockStatus",
        json!({ "regNo": "21BCE100", "reviewName": "review1", "facultyType": "guide" }),
    );
    assert_eq!(
        lock["effectiveDeadline"].as_str(),
        Some("2099-06-01T00:00:00+00:00")
    );
}
