#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
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

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    spawn(None)
}

/// Sidecar with its clock pinned to `today` (YYYY-MM-DD).
pub fn spawn_sidecar_at(today: &str) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    spawn(Some(today))
}

fn spawn(today: Option<&str>) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_academyd");
    let mut cmd = Command::new(exe);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .env_remove("ACADEMYD_TODAY");
    if let Some(today) = today {
        cmd.env("ACADEMYD_TODAY", today);
    }
    let mut child = cmd.spawn().expect("spawn academyd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
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
    let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

/// Sends a request and returns `data`, failing the test on an error envelope.
pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("success").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("data").cloned().unwrap_or(Value::Null)
}

/// Sends a request expected to fail and returns the whole envelope.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("success").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    assert!(value.get("data").map(|d| d.is_null()).unwrap_or(false));
    value
}

pub fn error_code(envelope: &Value) -> &str {
    envelope
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

pub fn str_field(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing string {} in {}", key, v))
        .to_string()
}

/// One sidecar process with auto-numbered request ids.
pub struct Session {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Session {
    pub fn start_at(today: &str) -> Self {
        let (child, stdin, reader) = spawn_sidecar_at(today);
        Self {
            child,
            stdin,
            reader,
            next_id: 0,
        }
    }

    fn id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    pub fn call(&mut self, method: &str, params: Value) -> Value {
        let id = self.id();
        request(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    pub fn ok(&mut self, method: &str, params: Value) -> Value {
        let id = self.id();
        request_ok(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    pub fn fail(&mut self, method: &str, params: Value) -> Value {
        let id = self.id();
        request_err(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    pub fn select(&mut self, workspace: &PathBuf) {
        let _ = self.ok(
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub struct Catalog {
    pub student_id: String,
    pub modality_id: String,
    pub slot_ids: Vec<String>,
}

/// One student, one modality and one 18:00 slot per weekday.
pub fn seed_catalog(s: &mut Session, classes_total: i64, fee_cents: i64, weekdays: &[&str]) -> Catalog {
    let student = s.ok("students.create", json!({ "fullName": "Ana Torres" }));
    let modality = s.ok(
        "modalities.create",
        json!({
            "name": "Functional",
            "classesTotal": classes_total,
            "monthlyFeeCents": fee_cents,
        }),
    );
    let modality_id = str_field(&modality, "id");
    let slot_ids = weekdays
        .iter()
        .map(|day| {
            let slot = s.ok(
                "slots.create",
                json!({
                    "modalityId": modality_id,
                    "weekday": day,
                    "startTime": "18:00",
                    "endTime": "19:00",
                    "maxOccupancy": 10,
                }),
            );
            str_field(&slot, "id")
        })
        .collect();
    Catalog {
        student_id: str_field(&student, "id"),
        modality_id,
        slot_ids,
    }
}

pub fn add_student(s: &mut Session, name: &str) -> String {
    let student = s.ok("students.create", json!({ "fullName": name }));
    str_field(&student, "id")
}
