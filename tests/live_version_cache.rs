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
    let exe = env!("CARGO_BIN_EXE_gradecored");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradecored");
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

fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

fn setup_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    tag: &str,
) -> (String, String, String) {
    let class = request_ok(
        stdin,
        reader,
        &format!("{}-c", tag),
        "classes.create",
        json!({ "name": tag }),
    );
    let class_id = str_field(&class, "classId");
    let student = request_ok(
        stdin,
        reader,
        &format!("{}-s", tag),
        "students.create",
        json!({ "firstName": "Live", "lastName": tag }),
    );
    let student_id = str_field(&student, "studentId");
    request_ok(
        stdin,
        reader,
        &format!("{}-e", tag),
        "enrollments.add",
        json!({ "classId": class_id, "studentId": student_id }),
    );
    request_ok(
        stdin,
        reader,
        &format!("{}-st", tag),
        "structures.save",
        json!({
            "classId": class_id,
            "definition": {
                "LECTURE": [
                    {
                        "name": "Quizzes",
                        "weight": 100,
                        "assessments": [ { "name": "Q1", "max_score": 10 } ]
                    }
                ],
                "LABORATORY": []
            }
        }),
    );
    let created = request_ok(
        stdin,
        reader,
        &format!("{}-a", tag),
        "assessments.create",
        json!({ "classId": class_id, "subcategory": "Quizzes", "name": "Q1", "maxScore": 10 }),
    );
    (class_id, student_id, str_field(&created, "assessmentId"))
}

fn live_version(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    class_id: &str,
) -> String {
    let v = request_ok(stdin, reader, id, "live.version", json!({ "classId": class_id }));
    str_field(&v, "version")
}

#[test]
fn score_writes_move_only_their_class_fingerprint() {
    let workspace = temp_dir("gradecored-live");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy(), "config": { "live_version_ttl_ms": 60000 } }),
    );
    let (c1, s1, a1) = setup_class(&mut stdin, &mut reader, "c1");
    let (c2, _, _) = setup_class(&mut stdin, &mut reader, "c2");

    let c1_before = live_version(&mut stdin, &mut reader, "2", &c1);
    let c2_before = live_version(&mut stdin, &mut reader, "3", &c2);
    assert_eq!(c1_before.len(), 64);
    assert_eq!(live_version(&mut stdin, &mut reader, "4", &c1), c1_before);

    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "scores.record",
        json!({ "assessmentId": a1, "studentId": s1, "score": 8 }),
    );
    assert_ne!(live_version(&mut stdin, &mut reader, "6", &c1), c1_before);
    assert_eq!(live_version(&mut stdin, &mut reader, "7", &c2), c2_before);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn normalized_and_grouped_reads_are_cached_per_version() {
    let workspace = temp_dir("gradecored-live-cache");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy(), "config": { "live_version_ttl_ms": 60000 } }),
    );
    let (class_id, _, _) = setup_class(&mut stdin, &mut reader, "norm");

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "structures.normalized",
        json!({ "classId": class_id }),
    );
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "structures.normalized",
        json!({ "classId": class_id }),
    );
    assert_eq!(first.get("cacheHit").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(second.get("cacheHit").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(first.get("rows"), second.get("rows"));
    assert_eq!(
        first.pointer("/rows/0/name").and_then(|v| v.as_str()),
        Some("Quizzes")
    );

    let grouped = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "structures.grouped",
        json!({ "classId": class_id }),
    );
    assert_eq!(
        grouped.pointer("/strings/0/assessment").and_then(|v| v.as_str()),
        Some("Q1")
    );
    assert_eq!(
        grouped.get("strings").and_then(|v| v.as_array()).map(|a| a.len()),
        grouped.get("numbers").and_then(|v| v.as_array()).map(|a| a.len())
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "structures.save",
        json!({
            "classId": class_id,
            "definition": {
                "LECTURE": [
                    {
                        "name": "Exams",
                        "weight": 100,
                        "assessments": [ { "name": "Final", "max_score": 100 } ]
                    }
                ],
                "LABORATORY": []
            }
        }),
    );
    let third = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "structures.normalized",
        json!({ "classId": class_id }),
    );
    assert_eq!(third.get("cacheHit").and_then(|v| v.as_bool()), Some(false));
    assert_ne!(third.get("version"), first.get("version"));
    assert_eq!(
        third.pointer("/rows/0/name").and_then(|v| v.as_str()),
        Some("Exams")
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn external_writes_show_up_once_the_ttl_lapses() {
    let workspace = temp_dir("gradecored-live-external");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy(), "config": { "live_version_ttl_ms": 0 } }),
    );
    let (class_id, _, _) = setup_class(&mut stdin, &mut reader, "ext");
    let before = live_version(&mut stdin, &mut reader, "2", &class_id);

    let conn = rusqlite::Connection::open(workspace.join("gradecore.sqlite3")).expect("open db");
    conn.busy_timeout(std::time::Duration::from_secs(5)).expect("busy timeout");
    conn.execute(
        "UPDATE classes SET updated_at = '2999-01-01T00:00:00.000000Z' WHERE id = ?",
        [&class_id],
    )
    .expect("external update");
    drop(conn);

    assert_ne!(live_version(&mut stdin, &mut reader, "3", &class_id), before);

    drop(stdin);
    let _ = child.wait();
}
