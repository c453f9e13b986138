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

//! The Session entity (spec §3.1) and the Fan-out Bus (spec §4.3) that
//! lives inside it. A session owns exactly one PTY-reader thread for
//! its lifetime; that thread is the single writer of scrollback and
//! the single point of dispatch to subscribers, which is what gives
//! the ordering guarantees in spec §5 for free.

use std::{
    collections::HashSet,
    io::Read,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::Duration,
};

use chrono::{DateTime, Utc};
use termhub_protocol::{SessionMetadata, SessionState, ShellType};
use tracing::{debug, instrument, warn};

use crate::{
    consts,
    pty::{PtyChild, ShellFamily},
    scrollback::Scrollback,
    tty::Size,
};

/// A subscriber of a session's fan-out bus. Implemented by
/// [`crate::daemon::connection::Connection`]; kept as a trait here so
/// the Fan-out Bus does not need to know about WebSocket transport
/// details, only that it can hand a subscriber a `data`/`exit`/`state`
/// event.
pub trait BusSink: Send + Sync {
    fn connection_id(&self) -> &str;
    fn on_data(&self, session_id: &str, data: &[u8]);
    fn on_exit(&self, session_id: &str, exit_code: Option<i32>, signal: Option<i32>, reason: Option<&str>);
    /// A session-state transition, e.g. `running -> closing` on an
    /// idle-sweep or explicit close. Invoked synchronously on `attach`
    /// with the current metadata (spec §4.2 `onState`), and again on
    /// every subsequent transition for already-subscribed connections.
    fn on_state(&self, metadata: SessionMetadata, reason: Option<&str>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running,
    Closing,
    Exited,
    Removed,
}

struct Mutable {
    grid: Size,
    state: State,
    last_active_at: DateTime<Utc>,
    exit_code: Option<i32>,
    signal: Option<i32>,
    exit_reason: Option<String>,
    scrollback: Scrollback,
    subscribers: Vec<Arc<dyn BusSink>>,
    backpressured: HashSet<String>,
    flow_paused: bool,
    close_reason: Option<String>,
}

/// One live (or recently exited) child process behind a pseudo-
/// terminal, plus its scrollback and attached viewers.
pub struct Session {
    pub id: String,
    pub client_id: String,
    pub name: String,
    pub shell: String,
    pub shell_type: ShellFamily,
    pub cwd: PathBuf,
    pub persistent: bool,
    pub created_at: DateTime<Utc>,
    pub(crate) pty: Arc<dyn PtyChild>,
    reader_stop: Arc<AtomicBool>,
    mutable: Mutex<Mutable>,
    /// Signalled on every state transition. The Session Manager's
    /// per-session lifecycle timer thread waits on this (with a
    /// deadline once a timed state is entered) instead of polling the
    /// idle-sweep's fixed cadence, so `hardKillTimeoutMs` and the
    /// non-persistent exited grace are honored at the timeout actually
    /// configured rather than rounded up to the next sweep.
    state_changed: Condvar,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        client_id: String,
        name: String,
        shell: String,
        shell_type: ShellFamily,
        cwd: PathBuf,
        persistent: bool,
        grid: Size,
        max_buffer_bytes: usize,
        pty: Arc<dyn PtyChild>,
    ) -> Arc<Session> {
        let now = Utc::now();
        let session = Arc::new(Session {
            id,
            client_id,
            name,
            shell,
            shell_type,
            cwd,
            persistent,
            created_at: now,
            pty,
            reader_stop: Arc::new(AtomicBool::new(false)),
            mutable: Mutex::new(Mutable {
                grid,
                state: State::Running,
                last_active_at: now,
                exit_code: None,
                signal: None,
                exit_reason: None,
                scrollback: Scrollback::new(max_buffer_bytes),
                subscribers: Vec::new(),
                backpressured: HashSet::new(),
                flow_paused: false,
                close_reason: None,
            }),
            state_changed: Condvar::new(),
        });
        session
    }

    pub fn state(&self) -> State {
        self.mutable.lock().unwrap().state
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state(), State::Running | State::Closing)
    }

    pub fn grid(&self) -> Size {
        self.mutable.lock().unwrap().grid
    }

    pub fn last_active_at(&self) -> DateTime<Utc> {
        self.mutable.lock().unwrap().last_active_at
    }

    pub fn touch(&self) {
        self.mutable.lock().unwrap().last_active_at = Utc::now();
    }

    pub fn exit_info(&self) -> (Option<i32>, Option<i32>) {
        let m = self.mutable.lock().unwrap();
        (m.exit_code, m.signal)
    }

    pub fn exit_reason(&self) -> Option<String> {
        self.mutable.lock().unwrap().exit_reason.clone()
    }

    pub fn buffer_bytes(&self) -> usize {
        self.mutable.lock().unwrap().scrollback.byte_len()
    }

    pub fn attached_connection_count(&self) -> usize {
        self.mutable.lock().unwrap().subscribers.len()
    }

    pub fn flow_paused(&self) -> bool {
        self.mutable.lock().unwrap().flow_paused
    }

    pub fn scrollback_tail(&self, max_bytes: usize) -> Vec<u8> {
        self.mutable.lock().unwrap().scrollback.tail_bytes(max_bytes)
    }

    pub fn scrollback_text_tail(&self, max_bytes: usize) -> String {
        self.mutable.lock().unwrap().scrollback.tail_text(max_bytes)
    }

    /// The wire-level metadata payload for this session (spec §4.5
    /// "session-metadata payload"), snapshotted under the session lock.
    pub fn metadata(&self) -> SessionMetadata {
        let m = self.mutable.lock().unwrap();
        SessionMetadata {
            session_id: self.id.clone(),
            client_id: self.client_id.clone(),
            name: self.name.clone(),
            shell: self.shell.clone(),
            shell_type: shell_type_wire(self.shell_type),
            cwd: self.cwd.display().to_string(),
            cols: m.grid.cols,
            rows: m.grid.rows,
            state: state_wire(m.state),
            persistent: self.persistent,
            created_at: super::iso_timestamp(self.created_at),
            last_active_at: super::iso_timestamp(m.last_active_at),
            exit_code: m.exit_code,
            signal: m.signal,
            attached_connections: m.subscribers.len(),
            flow_paused: m.flow_paused,
            buffer_bytes: m.scrollback.byte_len(),
        }
    }

    /// Subscribe a connection to this session's fan-out bus. Returns
    /// the current scrollback tail to replay, per spec §4.2 `attach`.
    /// The synchronous "current metadata" the spec's `onState` handler
    /// would receive is the metadata this call's caller already gets
    /// back from the Session Manager's `attach` return value (spec
    /// §4.2); `on_state` itself is reserved for later transitions a
    /// subscriber wasn't present to request directly (see
    /// [`Session::begin_close`]).
    pub fn attach(&self, sink: Arc<dyn BusSink>, replay_max_bytes: usize) -> Vec<u8> {
        let mut m = self.mutable.lock().unwrap();
        m.subscribers.retain(|s| s.connection_id() != sink.connection_id());
        m.subscribers.push(sink);
        m.last_active_at = Utc::now();
        m.scrollback.tail_bytes(replay_max_bytes)
    }

    /// Unsubscribe a connection. Idempotent.
    pub fn detach(&self, connection_id: &str) {
        let mut m = self.mutable.lock().unwrap();
        m.subscribers.retain(|s| s.connection_id() != connection_id);
        m.backpressured.remove(connection_id);
        let paused = !m.backpressured.is_empty();
        self.apply_flow(&mut m, paused);
    }

    pub fn set_backpressure(&self, connection_id: &str, enabled: bool) {
        let mut m = self.mutable.lock().unwrap();
        if enabled {
            m.backpressured.insert(connection_id.to_string());
        } else {
            m.backpressured.remove(connection_id);
        }
        let paused = !m.backpressured.is_empty();
        self.apply_flow(&mut m, paused);
    }

    fn apply_flow(&self, m: &mut Mutable, should_pause: bool) {
        if m.flow_paused == should_pause {
            return;
        }
        m.flow_paused = should_pause;
        if should_pause {
            self.reader_stop.store(true, Ordering::Relaxed);
        } else {
            self.reader_stop.store(false, Ordering::Relaxed);
        }
    }

    pub fn write_input(&self, data: &[u8]) -> std::io::Result<()> {
        self.touch();
        self.pty.write(data)
    }

    pub fn resize(&self, size: Size) -> std::io::Result<()> {
        {
            let mut m = self.mutable.lock().unwrap();
            m.grid = size;
            m.last_active_at = Utc::now();
        }
        if self.is_live() {
            self.pty.resize(size)
        } else {
            Ok(())
        }
    }

    /// Mark the session as `closing`, asking the child to exit. The
    /// hard-kill timer that force-removes it if it does not cooperate
    /// is armed by the caller (the manager's per-session lifecycle
    /// timer thread, which wakes on this transition via
    /// [`Session::wait_while_running`]). `reason`, if given, is
    /// recorded so the eventual `exit` event (delivered once the child
    /// actually dies) can carry it — e.g. idle-sweep terminations
    /// report `reason: "idle-timeout"` even though the pty reader
    /// thread is what observes the actual exit.
    pub fn begin_close(&self, reason: Option<&str>) {
        let subscribers = {
            let mut m = self.mutable.lock().unwrap();
            if m.state == State::Running {
                m.state = State::Closing;
            }
            if reason.is_some() {
                m.close_reason = reason.map(String::from);
            }
            m.subscribers.clone()
        };
        self.state_changed.notify_all();
        let metadata = self.metadata();
        for sub in subscribers {
            sub.on_state(metadata.clone(), reason);
        }
    }

    /// Block until this session leaves `running`, however long that
    /// takes (there is no deadline on `running` itself — the idle
    /// sweep decides when it ends). Used by the Session Manager's
    /// per-session lifecycle timer thread so it picks up the
    /// hard-kill/exit-grace deadlines the instant they become
    /// relevant, instead of polling for them on a fixed cadence.
    pub(crate) fn wait_while_running(&self) -> State {
        let guard = self.mutable.lock().unwrap();
        let guard = self.state_changed.wait_while(guard, |m| m.state == State::Running).unwrap();
        guard.state
    }

    /// Block until this session's state changes away from `from`, or
    /// `timeout` elapses, whichever comes first. Returns the state
    /// observed when the wait ends (still `from` on timeout).
    pub(crate) fn wait_for_state_change(&self, from: State, timeout: Duration) -> State {
        let guard = self.mutable.lock().unwrap();
        let (guard, _timed_out) =
            self.state_changed.wait_timeout_while(guard, timeout, |m| m.state == from).unwrap();
        guard.state
    }

    /// Transition to `exited`, recording the exit status and notifying
    /// every current subscriber exactly once (spec §4.3).
    #[instrument(skip(self), fields(session = %self.id))]
    pub fn mark_exited(&self, exit_code: Option<i32>, signal: Option<i32>, reason: Option<&str>) {
        let subscribers = {
            let mut m = self.mutable.lock().unwrap();
            if m.state == State::Exited || m.state == State::Removed {
                return;
            }
            m.state = State::Exited;
            m.exit_code = exit_code;
            m.signal = signal;
            let resolved_reason = reason.map(String::from).or_else(|| m.close_reason.clone());
            m.exit_reason = resolved_reason;
            m.subscribers.clone()
        };
        self.state_changed.notify_all();
        let reason_ref = self.exit_reason();
        for sub in subscribers {
            sub.on_exit(&self.id, exit_code, signal, reason_ref.as_deref());
        }
    }

    pub fn mark_removed(&self) {
        self.mutable.lock().unwrap().state = State::Removed;
        self.state_changed.notify_all();
    }

    /// Spawn the single always-on PTY reader thread for this session.
    /// Owns the master read half for the session's whole lifetime.
    pub(crate) fn spawn_reader(self: &Arc<Self>, max_output_chunk_bytes: usize) {
        let session = Arc::clone(self);
        let stop = Arc::clone(&self.reader_stop);
        let name = self.name.clone();
        thread::Builder::new()
            .name(format!("pty-reader({name})"))
            .spawn(move || reader_loop(session, stop, max_output_chunk_bytes))
            .expect("spawning pty reader thread");
    }
}

fn shell_type_wire(family: ShellFamily) -> ShellType {
    match family {
        ShellFamily::Unix => ShellType::Unix,
        ShellFamily::Powershell => ShellType::Powershell,
        ShellFamily::Cmd => ShellType::Cmd,
    }
}

fn state_wire(state: State) -> SessionState {
    match state {
        State::Running => SessionState::Running,
        State::Closing => SessionState::Closing,
        State::Exited => SessionState::Exited,
        State::Removed => SessionState::Removed,
    }
}

fn reader_loop(session: Arc<Session>, stop: Arc<AtomicBool>, max_output_chunk_bytes: usize) {
    let mut master = match session.pty.try_clone_reader() {
        Ok(m) => m,
        Err(e) => {
            warn!("session {}: no readable pty handle, reader exiting: {:?}", session.id, e);
            session.mark_exited(None, None, Some("pty unavailable"));
            return;
        }
    };
    let mut buf = vec![0u8; consts::PTY_READ_BUF_SIZE];

    loop {
        if matches!(session.state(), State::Exited | State::Removed) {
            return;
        }
        if stop.load(Ordering::Relaxed) {
            // flow-paused: stop reading from the fd until resumed.
            thread::sleep(consts::JOIN_POLL_DURATION);
            continue;
        }

        let n = match master.read(&mut buf) {
            Ok(0) => {
                // EOF on the pty master means the child is gone or
                // about to be; the reaper thread's `waitpid` may not
                // have landed yet, so give it a brief window before
                // falling back to an unknown exit status.
                let status = session.pty.wait_exit(consts::EOF_EXIT_STATUS_GRACE);
                let (code, signal) = status.map(|s| (s.code, s.signal)).unwrap_or((None, None));
                session.mark_exited(code, signal, None);
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(consts::JOIN_POLL_DURATION);
                continue;
            }
            Err(e) => {
                debug!("session {}: pty read error, treating as exit: {:?}", session.id, e);
                session.mark_exited(None, None, None);
                return;
            }
        };

        dispatch_chunk(&session, &buf[..n], max_output_chunk_bytes);
    }
}

/// Append to scrollback and fan the chunk out to subscribers, split
/// into `max_output_chunk_bytes`-sized pieces per spec §4.3 item 3.
fn dispatch_chunk(session: &Arc<Session>, chunk: &[u8], max_output_chunk_bytes: usize) {
    let subscribers = {
        let mut m = session.mutable.lock().unwrap();
        m.last_active_at = Utc::now();
        m.scrollback.append(chunk);
        m.subscribers.clone()
    };

    for piece in chunk.chunks(max_output_chunk_bytes.max(1)) {
        for sub in &subscribers {
            sub.on_data(&session.id, piece);
        }
    }
}
