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

//! Smoke tests that spawn the real `termhubd` binary, the way this
//! lineage's own daemon tests spawn the real daemon process rather than
//! exercising its logic purely in-process.

use std::{
    io::Read,
    net::TcpStream,
    process::{Command, Stdio},
    time::Duration,
};

use ntest::timeout;

fn termhubd_bin() -> &'static str {
    env!("CARGO_BIN_EXE_termhubd")
}

fn free_local_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("binding ephemeral port");
    listener.local_addr().expect("reading local addr").to_string()
}

#[test]
#[timeout(30000)]
fn starts_up_and_accepts_a_connection() {
    let addr = free_local_addr();

    let mut child = Command::new(termhubd_bin())
        .arg("--listen")
        .arg(&addr)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawning termhubd");

    // Give the listener a moment to bind before we dial it.
    let mut connected = false;
    for _ in 0..50 {
        if TcpStream::connect(&addr).is_ok() {
            connected = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(connected, "termhubd never accepted a TCP connection on {addr}");

    child.kill().expect("killing termhubd");
    let mut stderr = String::new();
    child.stderr.take().unwrap().read_to_string(&mut stderr).expect("reading stderr");
    assert!(stderr.contains("listening"), "expected startup log, got: {stderr}");
}

#[test]
#[timeout(30000)]
fn rejects_malformed_config_file() {
    let tmp_dir = tempfile::Builder::new()
        .prefix("termhubd-test")
        .tempdir()
        .expect("creating temp dir");
    let config_path = tmp_dir.path().join("bad.toml");
    std::fs::write(&config_path, "max_sessions_per_client = 0\n").expect("writing bad config");

    let output = Command::new(termhubd_bin())
        .arg("--listen")
        .arg(free_local_addr())
        .arg("--config-file")
        .arg(&config_path)
        .output()
        .expect("running termhubd");

    assert!(!output.status.success(), "termhubd should refuse an out-of-bounds config value");
}
