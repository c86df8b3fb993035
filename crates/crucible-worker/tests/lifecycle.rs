//! Full request lifecycle over an in-memory duplex connection.
//!
//! These tests stand in for the backend: they speak the framed JSON
//! protocol against a real connection handler and assert on the exact
//! envelope sequences. Tests that need the sandbox wrapper binary are
//! `#[ignore]`d and only run on hosts with `/usr/bin/nsjail`.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::{SinkExt as _, StreamExt as _};
use md5::{Digest as _, Md5};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crucible_core::rules::{BuildStages, Limits, Stage};
use crucible_worker::config::WorkerConfig;
use crucible_worker::framing::FrameCodec;
use crucible_worker::transport::handle_connection;

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

struct TestBackend {
    writer: FramedWrite<WriteHalf<DuplexStream>, FrameCodec>,
    reader: FramedRead<ReadHalf<DuplexStream>, FrameCodec>,
}

impl TestBackend {
    fn start(stages: Vec<Stage>, sources_dir: &TempDir) -> (Self, JoinHandle<()>) {
        let rules = Arc::new(BuildStages::new(stages).unwrap());
        let config = Arc::new(WorkerConfig {
            sources_dir: sources_dir.path().to_path_buf(),
            sources_size_limit_bytes: 8000,
        });

        let (backend_side, worker_side) = tokio::io::duplex(256 * 1024);
        let handle = tokio::spawn(handle_connection(worker_side, rules, config));

        let (read_half, write_half) = tokio::io::split(backend_side);
        let backend = Self {
            writer: FramedWrite::new(write_half, FrameCodec::new()),
            reader: FramedRead::new(read_half, FrameCodec::new()),
        };
        (backend, handle)
    }

    async fn send(&mut self, envelope: Value) {
        self.writer
            .send(serde_json::to_vec(&envelope).unwrap())
            .await
            .unwrap();
    }

    async fn send_raw(&mut self, payload: &[u8]) {
        self.writer.send(payload.to_vec()).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let frame = tokio::time::timeout(RECV_TIMEOUT, self.reader.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed while waiting for a frame")
            .expect("frame error");
        serde_json::from_slice(&frame).unwrap()
    }

    async fn collect_until_finish(&mut self) -> Vec<Value> {
        let mut events = Vec::new();
        loop {
            let event = self.recv().await;
            let finished = event.get("finish").is_some();
            events.push(event);
            if finished {
                break;
            }
        }
        events
    }
}

fn stage(name: &str, command: &str) -> Stage {
    Stage {
        name: name.to_owned(),
        command: command.to_owned(),
        env: vec![],
        mounts: vec![],
        depends_on: None,
        limits: Limits {
            address_space_mb: 128,
            run_time_sec: 5.0,
            file_descriptors: 16,
            file_writes_mb: 1,
            threads: 64,
            output_bytes: 65536,
        },
    }
}

fn source_file(name: &str, contents: &[u8]) -> Value {
    json!({
        "name": name,
        "text": BASE64.encode(contents),
        "hash": format!("{:x}", Md5::digest(contents)),
    })
}

fn new_request(request_id: &str, target: &str) -> Value {
    json!({"command": "new", "request_id": request_id, "target": target})
}

#[tokio::test]
async fn hash_mismatch_emits_init_error_then_finish() {
    let dir = TempDir::new().unwrap();
    let (mut backend, _handle) = TestBackend::start(vec![stage("run", "/bin/echo hi")], &dir);

    backend.send(new_request("r1", "run")).await;
    let mut bad = source_file("a.txt", b"hello");
    bad["hash"] = json!("00000000000000000000000000000000");
    backend.send(json!({"source_files": [bad]})).await;

    let events = backend.collect_until_finish().await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["stage"], "init");
    assert!(events[0]["description"].as_str().unwrap().contains("hash"));
    assert_eq!(events[0]["request_id"], "r1");
    assert_eq!(events[1], json!({"finish": true, "request_id": "r1"}));
}

#[tokio::test]
async fn init_test_rejecting_the_sources_skips_all_stages() {
    let dir = TempDir::new().unwrap();
    let (mut backend, _handle) =
        TestBackend::start(vec![stage("run_tests", "/bin/true")], &dir);

    backend.send(new_request("r1", "run_tests")).await;
    backend
        .send(json!({
            "init_test_cases": [{
                "description": "no forbidden words",
                "checks": [{"type": "text_excludes", "arg": "forbidden"}],
            }],
            "test_cases": [{
                "description": "zero",
                "checks": [{"type": "exit_code", "arg": "0"}],
            }],
        }))
        .await;
    backend
        .send(json!({"source_files": [source_file("main.txt", b"a forbidden word")]}))
        .await;

    let events = backend.collect_until_finish().await;
    assert_eq!(events.len(), 2);
    assert_eq!(
        events[0],
        json!({
            "test_case": "0", "result": false, "stage": "init", "request_id": "r1"
        })
    );
    assert_eq!(events[1]["finish"], true);
}

#[tokio::test]
async fn passing_init_tests_emit_results_per_case() {
    let dir = TempDir::new().unwrap();
    let (mut backend, _handle) =
        TestBackend::start(vec![stage("check_tests", "/bin/true")], &dir);

    backend.send(new_request("r1", "check_tests")).await;
    backend
        .send(json!({
            "init_test_cases": [
                {"description": "has main", "checks": [{"type": "text_contains", "arg": "main"}]},
                {"description": "bad word", "checks": [{"type": "text_excludes", "arg": "junk"}]},
            ],
            // No runtime cases: the fan-out over the final stage is
            // empty, so nothing is spawned after the init checks pass.
            "test_cases": [],
        }))
        .await;
    backend
        .send(json!({"source_files": [source_file("main.c", b"int main() {}")]}))
        .await;

    let events = backend.collect_until_finish().await;
    assert_eq!(events.len(), 3);
    assert_eq!(events[0]["result"], true);
    assert_eq!(events[0]["test_case"], "0");
    assert_eq!(events[1]["result"], true);
    assert_eq!(events[1]["test_case"], "1");
    assert_eq!(events[2]["finish"], true);
}

#[tokio::test]
async fn missing_test_suite_for_a_tests_target_is_an_init_error() {
    let dir = TempDir::new().unwrap();
    let (mut backend, _handle) =
        TestBackend::start(vec![stage("run_tests", "/bin/true")], &dir);

    backend.send(new_request("r1", "run_tests")).await;
    // The suite frame is skipped; sources arrive in its place.
    backend
        .send(json!({"source_files": [source_file("a.txt", b"x")]}))
        .await;

    let events = backend.collect_until_finish().await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["stage"], "init");
    assert!(events[0]["description"]
        .as_str()
        .unwrap()
        .contains("test suite"));
    assert_eq!(events[1]["finish"], true);
}

#[tokio::test]
async fn unknown_target_fails_before_any_stage() {
    let dir = TempDir::new().unwrap();
    let (mut backend, _handle) = TestBackend::start(vec![stage("run", "/bin/echo hi")], &dir);

    backend.send(new_request("r1", "deploy")).await;
    backend
        .send(json!({"source_files": [source_file("a.txt", b"x")]}))
        .await;

    let events = backend.collect_until_finish().await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["stage"], "init");
    assert!(events[0]["description"].as_str().unwrap().contains("deploy"));
    assert_eq!(events[1]["finish"], true);
}

#[tokio::test]
async fn malformed_opening_frames_are_dropped_without_a_request() {
    let dir = TempDir::new().unwrap();
    let (mut backend, _handle) = TestBackend::start(vec![stage("run", "/bin/echo hi")], &dir);

    // None of these opens a request: wrong command, empty request_id,
    // premature sources, unparseable payload.
    backend.send(json!({"command": "bogus"})).await;
    backend.send(json!({"command": "new", "request_id": ""})).await;
    backend
        .send(json!({
            "command": "new", "request_id": "r0", "target": "run",
            "source_files": [source_file("a.txt", b"x")],
        }))
        .await;
    backend.send_raw(b"not json at all").await;

    // A well-formed request still works afterwards.
    backend.send(new_request("r1", "run")).await;
    let mut bad = source_file("a.txt", b"hello");
    bad["hash"] = json!("00000000000000000000000000000000");
    backend.send(json!({"source_files": [bad]})).await;

    let events = backend.collect_until_finish().await;
    assert_eq!(events.last().unwrap()["request_id"], "r1");
}

#[tokio::test]
async fn sequential_requests_each_get_their_own_finish() {
    let dir = TempDir::new().unwrap();
    let (mut backend, _handle) = TestBackend::start(vec![stage("run", "/bin/echo hi")], &dir);

    for request_id in ["r1", "r2"] {
        backend.send(new_request(request_id, "run")).await;
        let mut bad = source_file("a.txt", b"hello");
        bad["hash"] = json!("00000000000000000000000000000000");
        backend.send(json!({"source_files": [bad]})).await;

        let events = backend.collect_until_finish().await;
        for event in &events {
            assert_eq!(event["request_id"], request_id);
        }
        assert_eq!(events.last().unwrap()["finish"], true);
    }
}

#[tokio::test]
async fn dropping_the_connection_tears_the_handler_down() {
    let dir = TempDir::new().unwrap();
    let (backend, handle) = TestBackend::start(vec![stage("run", "/bin/echo hi")], &dir);

    drop(backend);
    tokio::time::timeout(RECV_TIMEOUT, handle)
        .await
        .expect("handler did not exit after the connection dropped")
        .unwrap();
}

// The scenarios below execute real stage commands under the sandbox
// wrapper and only run on hosts with /usr/bin/nsjail available (and
// privileges to use it).

fn decoded_output_len(events: &[Value]) -> usize {
    events
        .iter()
        .filter(|e| e.get("output").is_some())
        .map(|e| BASE64.decode(e["output"].as_str().unwrap()).unwrap().len())
        .sum()
}

#[tokio::test]
#[ignore = "requires /usr/bin/nsjail"]
async fn trivial_success_streams_stdout_and_exit_zero() {
    let dir = TempDir::new().unwrap();
    let (mut backend, _handle) = TestBackend::start(vec![stage("run", "/bin/echo hi")], &dir);

    backend.send(new_request("r1", "run")).await;
    backend
        .send(json!({"source_files": [source_file("a.txt", b"")]}))
        .await;

    let events = backend.collect_until_finish().await;
    assert_eq!(events[0]["event"], "started");

    let stdout: Vec<u8> = events
        .iter()
        .filter(|e| e["type"] == "stdout")
        .flat_map(|e| BASE64.decode(e["output"].as_str().unwrap()).unwrap())
        .collect();
    assert_eq!(stdout, b"hi\n");

    let exit = events.iter().find(|e| e.get("exit_code").is_some()).unwrap();
    assert_eq!(exit["exit_code"], 0);
    assert!(events.iter().any(|e| e["event"] == "completed"));
    assert_eq!(events.last().unwrap()["finish"], true);
}

#[tokio::test]
#[ignore = "requires /usr/bin/nsjail"]
async fn output_cap_kills_a_flooding_child() {
    let dir = TempDir::new().unwrap();
    let mut flood = stage("run", "/bin/yes");
    flood.limits.output_bytes = 4096;
    let (mut backend, _handle) = TestBackend::start(vec![flood], &dir);

    backend.send(new_request("r1", "run")).await;
    backend
        .send(json!({"source_files": [source_file("a.txt", b"")]}))
        .await;

    let events = backend.collect_until_finish().await;
    let total = decoded_output_len(&events);
    assert!(total >= 4096, "expected at least the cap, got {total}");
    assert!(total <= 4096 + 512, "one trailing chunk may cross the cap");

    let exit = events.iter().find(|e| e.get("exit_code").is_some()).unwrap();
    assert_ne!(exit["exit_code"], 0);
    assert!(events.iter().any(|e| e["event"] == "completed"));
}

#[tokio::test]
#[ignore = "requires /usr/bin/nsjail"]
async fn stop_command_kills_the_running_stage() {
    let dir = TempDir::new().unwrap();
    let mut sleeper = stage("run", "/bin/sleep 10");
    sleeper.limits.run_time_sec = 30.0;
    let (mut backend, _handle) = TestBackend::start(vec![sleeper], &dir);

    backend.send(new_request("r1", "run")).await;
    backend
        .send(json!({"source_files": [source_file("a.txt", b"")]}))
        .await;

    let started = backend.recv().await;
    assert_eq!(started["event"], "started");
    backend.send(json!({"command": "stop"})).await;

    let events = backend.collect_until_finish().await;
    let duration = events
        .iter()
        .find(|e| e.get("duration_sec").is_some())
        .unwrap();
    assert!(duration["duration_sec"].as_f64().unwrap() < 10.0);
    let exit = events.iter().find(|e| e.get("exit_code").is_some()).unwrap();
    assert_ne!(exit["exit_code"], 0);
}

#[tokio::test]
#[ignore = "requires /usr/bin/nsjail"]
async fn exit_code_test_case_passes_on_the_final_stage() {
    let dir = TempDir::new().unwrap();
    let (mut backend, _handle) =
        TestBackend::start(vec![stage("run_tests", "/bin/true")], &dir);

    backend.send(new_request("r1", "run_tests")).await;
    backend
        .send(json!({
            "test_cases": [{
                "description": "zero",
                "checks": [{"type": "exit_code", "arg": "0"}],
            }],
        }))
        .await;
    backend
        .send(json!({"source_files": [source_file("a.txt", b"")]}))
        .await;

    let events = backend.collect_until_finish().await;
    let started = &events[0];
    assert_eq!(started["event"], "started");
    assert_eq!(started["test_case"], "0");

    let verdict = events.iter().find(|e| e.get("result").is_some()).unwrap();
    assert_eq!(verdict["test_case"], "0");
    assert_eq!(verdict["result"], true);
    assert_eq!(verdict["stage"], "run_tests");

    let exit = events.iter().find(|e| e.get("exit_code").is_some()).unwrap();
    assert_eq!(exit["exit_code"], 0);
    assert_eq!(events.last().unwrap()["finish"], true);
}
