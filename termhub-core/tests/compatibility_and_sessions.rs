// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end scenarios exercised against real (short-lived, `/bin/sh`-
//! class) child processes, the way this lineage's own integration tests
//! spawn real subshells rather than mocking the PTY layer.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use assert_matches::assert_matches;
use ntest::timeout;
use regex::Regex;
use termhub_core::{
    config::Config,
    daemon::{
        compat::{run_compatibility_command, CompatibilityRequest},
        manager::{CreateSessionOptions, SessionManager},
        session::BusSink,
    },
    error::Error,
};

fn manager() -> Arc<SessionManager> {
    SessionManager::new(Config::default()).expect("constructing session manager")
}

fn sh_options() -> CreateSessionOptions {
    CreateSessionOptions { shell: Some("/bin/sh".to_string()), ..Default::default() }
}

/// A [`BusSink`] test double that records every `data`/`exit` event it
/// receives, so tests can assert on fan-out ordering and content
/// without opening a real WebSocket.
struct RecordingSink {
    id: String,
    data: Mutex<Vec<u8>>,
    exited: Mutex<bool>,
}

impl RecordingSink {
    fn new(id: &str) -> Arc<RecordingSink> {
        Arc::new(RecordingSink { id: id.to_string(), data: Mutex::new(Vec::new()), exited: Mutex::new(false) })
    }
}

impl BusSink for RecordingSink {
    fn connection_id(&self) -> &str {
        &self.id
    }

    fn on_data(&self, _session_id: &str, data: &[u8]) {
        self.data.lock().unwrap().extend_from_slice(data);
    }

    fn on_exit(&self, _session_id: &str, _exit_code: Option<i32>, _signal: Option<i32>, _reason: Option<&str>) {
        *self.exited.lock().unwrap() = true;
    }

    fn on_state(&self, _metadata: termhub_protocol::SessionMetadata, _reason: Option<&str>) {}
}

fn wait_until<P: FnMut() -> bool>(mut pred: P, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if pred() {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
#[timeout(10000)]
fn create_input_output_round_trip() {
    let manager = manager();
    let session = manager.create_session("alice", sh_options()).unwrap();
    let created_at = session.created_at;

    let sink = RecordingSink::new("conn-1");
    manager.attach(&session.id, "alice", sink.clone(), 0).unwrap();

    manager.write(&session.id, "alice", b"printf \"hi\\n\"\r").unwrap();

    let got = wait_until(|| sink.data.lock().unwrap().windows(3).any(|w| w == b"hi\n"), Duration::from_secs(3));
    assert!(got, "expected 'hi' to appear in session output");
    assert!(session.last_active_at() > created_at);

    manager.close_session(&session.id, "alice", true).unwrap();
}

#[test]
#[timeout(10000)]
fn compatibility_run_success() {
    let manager = manager();
    let outcome = run_compatibility_command(
        &manager,
        CompatibilityRequest {
            client_id: "alice".to_string(),
            command: "echo ok".to_string(),
            cwd: None,
            cols: None,
            rows: None,
            timeout: Duration::from_secs(5),
        },
    )
    .unwrap();

    assert_eq!(outcome.output.trim(), "ok");
    assert_eq!(outcome.exit_code, 0);
    assert!(outcome.success);
    assert!(!outcome.timed_out);
}

#[test]
#[timeout(10000)]
fn compatibility_run_reports_nonzero_exit_code() {
    let manager = manager();
    let outcome = run_compatibility_command(
        &manager,
        CompatibilityRequest {
            client_id: "alice".to_string(),
            command: "false".to_string(),
            cwd: None,
            cols: None,
            rows: None,
            timeout: Duration::from_secs(5),
        },
    )
    .unwrap();

    assert_eq!(outcome.exit_code, 1);
    assert!(!outcome.success);
}

#[test]
#[timeout(10000)]
fn compatibility_run_times_out_and_force_closes() {
    let manager = manager();
    let outcome = run_compatibility_command(
        &manager,
        CompatibilityRequest {
            client_id: "alice".to_string(),
            command: "sleep 10".to_string(),
            cwd: None,
            cols: None,
            rows: None,
            timeout: Duration::from_millis(300),
        },
    )
    .unwrap();

    assert!(outcome.timed_out);
    assert_eq!(outcome.exit_code, 124);
    assert!(!outcome.success);
}

#[test]
#[timeout(10000)]
fn reattach_replay_carries_prior_output() {
    let manager = manager();
    let session = manager.create_session("alice", sh_options()).unwrap();

    let a = RecordingSink::new("conn-a");
    let (_, replay_a) = manager.attach(&session.id, "alice", a.clone(), 1024 * 1024).unwrap();
    assert!(replay_a.is_empty());

    manager.write(&session.id, "alice", b"printf 'first\\n'\r").unwrap();
    assert!(wait_until(|| session.buffer_bytes() > 0, Duration::from_secs(3)));

    let b = RecordingSink::new("conn-b");
    let (_, replay_b) = manager.attach(&session.id, "alice", b, 1024 * 1024).unwrap();
    assert!(!replay_b.is_empty(), "second attach should replay scrollback accumulated so far");

    manager.close_session(&session.id, "alice", true).unwrap();
}

#[test]
fn cross_client_access_is_denied() {
    let manager = manager();
    let session = manager.create_session("alice", sh_options()).unwrap();
    let result = manager.get_buffer_tail(&session.id, "bob", 1024);
    assert_matches!(result, Err(Error::AccessDenied { .. }));
    manager.close_session(&session.id, "alice", true).unwrap();
}

#[test]
#[timeout(10000)]
fn compatibility_run_output_matches_expected_shape() {
    let manager = manager();
    let outcome = run_compatibility_command(
        &manager,
        CompatibilityRequest {
            client_id: "alice".to_string(),
            command: "echo line1; echo line2".to_string(),
            cwd: None,
            cols: None,
            rows: None,
            timeout: Duration::from_secs(5),
        },
    )
    .unwrap();

    let expected = Regex::new(r"^line1\r?\nline2$").unwrap();
    assert!(expected.is_match(outcome.output.trim()), "unexpected output: {:?}", outcome.output);
}

#[test]
fn force_close_is_idempotent() {
    let manager = manager();
    let session = manager.create_session("alice", sh_options()).unwrap();
    manager.close_session(&session.id, "alice", true).unwrap();
    // Second call on an already-closed (and possibly already-removed)
    // session must still succeed.
    manager.close_session(&session.id, "alice", true).unwrap();
}

#[test]
fn quota_exceeded_rejects_extra_sessions() {
    let mut cfg = Config::default();
    cfg.max_sessions_per_client = 1;
    let manager = SessionManager::new(cfg).unwrap();
    let _first = manager.create_session("alice", sh_options()).unwrap();
    let second = manager.create_session("alice", sh_options());
    assert!(matches!(second, Err(Error::QuotaExceeded { .. })));
}

#[test]
fn create_session_rejects_out_of_range_grid() {
    let manager = manager();
    let too_narrow =
        manager.create_session("alice", CreateSessionOptions { cols: Some(9), ..sh_options() });
    assert!(matches!(too_narrow, Err(Error::InvalidArgument(_))));

    let too_wide =
        manager.create_session("alice", CreateSessionOptions { cols: Some(501), ..sh_options() });
    assert!(matches!(too_wide, Err(Error::InvalidArgument(_))));
}

#[test]
#[timeout(10000)]
fn resize_clamps_out_of_range_grid_instead_of_rejecting() {
    let manager = manager();
    let session = manager.create_session("alice", sh_options()).unwrap();
    manager.resize(&session.id, "alice", 9, 4).unwrap();
    let grid = session.grid();
    assert_eq!(grid.cols, 10);
    assert_eq!(grid.rows, 5);
    manager.close_session(&session.id, "alice", true).unwrap();
}

#[test]
#[timeout(10000)]
fn shutdown_force_closes_persistent_sessions_too() {
    let manager = manager();
    let persistent =
        manager.create_session("alice", CreateSessionOptions { persistent: true, ..sh_options() }).unwrap();
    manager.shutdown();
    assert!(wait_until(|| !persistent.is_live(), Duration::from_secs(3)));
    // idempotent: a second shutdown must not panic or hang.
    manager.shutdown();
}
