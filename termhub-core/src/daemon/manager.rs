//! The Session Manager (spec §4.2): the catalogue of live sessions,
//! per-client quotas, and the single idle-sweep thread that ages
//! sessions through `running -> closing -> exited -> removed`.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, select, Sender};
use termhub_protocol::SessionMetadata;
use tracing::{info, instrument, warn};

use crate::{
    config::Config,
    consts,
    daemon::session::{BusSink, Session, State},
    error::{Error, Result},
    ids, pty,
    tty::Size,
    user,
};

/// Everything a caller may specify when asking for a new session.
/// Unset fields fall back to configuration defaults or to shell
/// resolution rules, per spec §4.1.
#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    pub name: Option<String>,
    pub shell: Option<String>,
    pub cwd: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub persistent: bool,
    pub env: HashMap<String, String>,
    /// Disable local echo on the spawned pty. Used by
    /// `runCompatibilityCommand` for its throwaway sessions, where the
    /// caller wants the command's own output back rather than a
    /// transcript of what was written to the pty. Ordinary sessions
    /// leave this `false` so attached viewers see a normal terminal.
    pub suppress_echo: bool,
}

/// Outcome of a [`SessionManager::wait_for`] call.
#[derive(Debug, Clone)]
pub struct WaitForOutcome {
    /// Scrollback tail captured at the moment the wait resolved,
    /// bounded by the request's `max_output_bytes`.
    pub tail: String,
    /// `true` if `pattern` matched before the wait resolved.
    pub matched: bool,
    /// The session's exit status, if it had already exited by the
    /// time the wait resolved.
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// `true` if the session was no longer live when the wait
    /// resolved (whether or not the caller asked to wait for it).
    pub exited: bool,
    /// `true` if `timeout` elapsed without the requested condition
    /// being satisfied.
    pub timed_out: bool,
    /// `true` if `tail` was truncated to `max_output_bytes`.
    pub truncated: bool,
}

pub struct SessionManager {
    cfg: Arc<Config>,
    user_info: user::Info,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    shutting_down: AtomicBool,
    sweep_stop: Sender<()>,
}

impl SessionManager {
    pub fn new(cfg: Config) -> anyhow::Result<Arc<SessionManager>> {
        let user_info = user::info()?;
        let (sweep_stop, sweep_stop_rx) = bounded(0);
        let manager = Arc::new(SessionManager {
            cfg: Arc::new(cfg),
            user_info,
            sessions: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            sweep_stop,
        });
        manager.spawn_idle_sweep(sweep_stop_rx);
        Ok(manager)
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    #[instrument(skip(self, opts))]
    pub fn create_session(self: &Arc<Self>, client_id: &str, opts: CreateSessionOptions) -> Result<Arc<Session>> {
        if !self.cfg.enabled {
            return Err(Error::Disabled);
        }
        if !ids::is_valid_client_id(client_id) {
            return Err(Error::InvalidClientId(client_id.to_string()));
        }

        {
            let sessions = self.sessions.lock().unwrap();
            let live = sessions.values().filter(|s| s.client_id == client_id && s.is_live()).count();
            if live >= self.cfg.max_sessions_per_client {
                return Err(Error::QuotaExceeded {
                    client_id: client_id.to_string(),
                    limit: self.cfg.max_sessions_per_client,
                });
            }
        }

        let shell_spec = pty::resolve_shell(opts.shell.as_deref(), &self.user_info);
        let cwd = pty::validate_cwd(
            opts.cwd.as_deref(),
            &self.user_info.home_dir,
            self.cfg.allowed_root.as_deref(),
        )?;
        let cols = opts.cols.unwrap_or(self.cfg.default_cols);
        let rows = opts.rows.unwrap_or(self.cfg.default_rows);
        if !Size::in_range(cols, rows) {
            return Err(Error::InvalidArgument(format!(
                "cols/rows ({cols}x{rows}) out of range [{}..{}]x[{}..{}]",
                crate::tty::MIN_COLS,
                crate::tty::MAX_COLS,
                crate::tty::MIN_ROWS,
                crate::tty::MAX_ROWS,
            )));
        }
        let size = Size { cols, rows };
        let env = pty::build_env(&opts.env);
        let id = ids::new_session_id();
        let name = opts.name.unwrap_or_else(|| id.clone());

        let child = pty::spawn(&shell_spec, &cwd, &env, size, &name, opts.suppress_echo)?;

        let session = Session::new(
            id.clone(),
            client_id.to_string(),
            name,
            shell_spec.path.clone(),
            shell_spec.family,
            cwd,
            opts.persistent,
            size,
            self.cfg.max_buffer_bytes,
            Arc::new(child),
        );
        session.spawn_reader(self.cfg.max_output_chunk_bytes);

        self.sessions.lock().unwrap().insert(id, Arc::clone(&session));
        self.spawn_lifecycle_timer(Arc::clone(&session));
        info!(session = %session.id, client = %client_id, "session created");
        Ok(session)
    }

    /// List a client's sessions, ordered by creation timestamp ascending
    /// (spec §4.2 `listSessions`).
    pub fn list_sessions(&self, client_id: &str) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.client_id == client_id && s.state() != State::Removed)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub fn get_session(&self, session_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .filter(|s| s.state() != State::Removed)
            .cloned()
            .ok_or_else(|| Error::NotFound(session_id.to_string()))
    }

    fn get_owned_session(&self, session_id: &str, client_id: &str) -> Result<Arc<Session>> {
        let session = self.get_session(session_id)?;
        if session.client_id != client_id {
            return Err(Error::AccessDenied {
                session_id: session_id.to_string(),
                client_id: client_id.to_string(),
            });
        }
        Ok(session)
    }

    pub fn get_buffer_tail(&self, session_id: &str, client_id: &str, max_bytes: usize) -> Result<Vec<u8>> {
        let session = self.get_owned_session(session_id, client_id)?;
        Ok(session.scrollback_tail(max_bytes))
    }

    /// Subscribe a connection's [`BusSink`] to a session, returning the
    /// session plus the scrollback tail to replay (spec §4.2 `attach`).
    pub fn attach(
        &self,
        session_id: &str,
        client_id: &str,
        sink: Arc<dyn BusSink>,
        replay_max_bytes: usize,
    ) -> Result<(Arc<Session>, Vec<u8>)> {
        let session = self.get_owned_session(session_id, client_id)?;
        let replay = session.attach(sink, replay_max_bytes);
        Ok((session, replay))
    }

    /// Detach a connection from whichever session it was attached to.
    /// Cheap and idempotent; called unconditionally on disconnect since
    /// the endpoint does not separately track attachment state.
    pub fn detach_everywhere(&self, connection_id: &str) {
        for session in self.sessions.lock().unwrap().values() {
            session.detach(connection_id);
        }
    }

    pub fn set_backpressure(&self, session_id: &str, connection_id: &str, enabled: bool) {
        if let Ok(session) = self.get_session(session_id) {
            session.set_backpressure(connection_id, enabled);
        }
    }

    pub fn write(&self, session_id: &str, client_id: &str, data: &[u8]) -> Result<()> {
        if data.len() > self.cfg.max_input_bytes {
            return Err(Error::InputTooLarge { got: data.len(), limit: self.cfg.max_input_bytes });
        }
        let session = self.get_owned_session(session_id, client_id)?;
        if !session.is_live() {
            return Err(Error::NotRunning(session_id.to_string()));
        }
        session.write_input(data).map_err(Error::PtyFailure)
    }

    pub fn resize(&self, session_id: &str, client_id: &str, cols: u16, rows: u16) -> Result<()> {
        let session = self.get_owned_session(session_id, client_id)?;
        session.resize(Size::clamped(cols, rows)).map_err(Error::PtyFailure)
    }

    /// Close a session (spec §4.2 `closeSession`). `force` asks for a
    /// harder guarantee: the call must succeed even if the session has
    /// already fully exited and been reaped from the catalogue, which
    /// is why a forced close swallows `Error::NotFound` rather than
    /// propagating it — the caller asked "make sure it's gone", and a
    /// session that is already gone satisfies that trivially.
    #[instrument(skip(self))]
    pub fn close_session(&self, session_id: &str, client_id: &str, force: bool) -> Result<()> {
        let session = match self.get_owned_session(session_id, client_id) {
            Ok(session) => session,
            Err(Error::NotFound(_)) if force => return Ok(()),
            Err(e) => return Err(e),
        };
        if !session.is_live() {
            if force {
                // Already `exited`. A forced close asks for the harder
                // guarantee that the session is gone, so advance it to
                // `removed` inline instead of leaving it to its
                // lifecycle timer's exited-grace deadline (spec §4.2:
                // `exited -> removed` on "explicit closeSession({force:true})").
                session.mark_removed();
                self.remove_session(session_id);
            }
            return Ok(());
        }
        session.begin_close(None);
        if let Err(e) = session.pty.kill() {
            warn!(session = %session_id, "error signalling child during close: {}", e);
        }
        Ok(())
    }

    fn remove_session(&self, session_id: &str) {
        self.sessions.lock().unwrap().remove(session_id);
    }

    /// Poll a session's scrollback tail for a substring and/or wait for
    /// it to exit, used both directly by `waitFor` and indirectly by
    /// `runCompatibilityCommand`'s exit-marker scraping. Not a general
    /// regex matcher: this crate's dependency stack only carries
    /// `regex` as a test tool, so production pattern matching is
    /// restricted to substring search.
    #[allow(clippy::too_many_arguments)]
    pub fn wait_for(
        &self,
        session_id: &str,
        client_id: &str,
        pattern: Option<&str>,
        wait_for_exit: bool,
        timeout: Duration,
        max_output_bytes: usize,
    ) -> Result<WaitForOutcome> {
        let session = self.get_owned_session(session_id, client_id)?;
        let deadline = Instant::now() + timeout;
        loop {
            let tail = session.scrollback_text_tail(max_output_bytes);
            let truncated = session.buffer_bytes() > max_output_bytes;
            let matched = pattern.map(|p| tail.contains(p)).unwrap_or(false);
            let (exit_code, signal) = session.exit_info();
            let exited = !session.is_live();

            let satisfied = matched || (wait_for_exit && exited) || (pattern.is_none() && !wait_for_exit);
            if satisfied {
                return Ok(WaitForOutcome { tail, matched, exit_code, signal, exited, timed_out: false, truncated });
            }
            if exited && !wait_for_exit {
                // The session is gone and nothing else will change; a
                // pattern that hasn't matched by now never will.
                return Ok(WaitForOutcome { tail, matched, exit_code, signal, exited, timed_out: false, truncated });
            }
            if Instant::now() >= deadline {
                return Ok(WaitForOutcome { tail, matched, exit_code, signal, exited, timed_out: true, truncated });
            }
            thread::sleep(consts::JOIN_POLL_DURATION);
        }
    }

    /// Spawn the idle-sweep thread, ticking on a `crossbeam_channel`
    /// timer and selecting against a stop channel rather than polling an
    /// atomic flag — the same control-plane-channel idiom this
    /// lineage's daemon uses for its other background coordination
    /// (reaper registration, heartbeats), applied to the one periodic
    /// task this crate needs. This thread owns only the fixed 30 s
    /// idle-timeout check (spec §4.2 "idle sweep"); the hard-kill and
    /// exited-grace deadlines are each session's own concern, handled
    /// by [`SessionManager::spawn_lifecycle_timer`].
    fn spawn_idle_sweep(self: &Arc<Self>, stop: crossbeam_channel::Receiver<()>) {
        let manager = Arc::clone(self);
        thread::Builder::new()
            .name("idle-sweep".to_string())
            .spawn(move || {
                let ticks = crossbeam_channel::tick(consts::IDLE_SWEEP_INTERVAL);
                loop {
                    select! {
                        recv(stop) -> _ => return,
                        recv(ticks) -> _ => manager.sweep_once(),
                    }
                }
            })
            .expect("spawning idle sweep thread");
    }

    fn sweep_once(&self) {
        let snapshot: Vec<Arc<Session>> = self.sessions.lock().unwrap().values().cloned().collect();
        let mut to_remove = Vec::new();

        for session in &snapshot {
            match session.state() {
                State::Running => {
                    if session.attached_connection_count() == 0 {
                        let idle_for = chrono::Utc::now().signed_duration_since(session.last_active_at());
                        if idle_for
                            > chrono::Duration::from_std(self.cfg.idle_timeout).unwrap_or_default()
                        {
                            info!(session = %session.id, "idle timeout reached, closing");
                            session.begin_close(Some("idle-timeout"));
                            let _ = session.pty.kill();
                        }
                    }
                }
                // Handled by the session's own lifecycle timer thread,
                // which is woken by state-change notifications rather
                // than this sweep's fixed cadence.
                State::Closing | State::Exited => {}
                // Defensive cleanup: a session should never actually be
                // observed here, since whatever marks a session removed
                // also removes its catalogue entry in the same step.
                State::Removed => to_remove.push(session.id.clone()),
            }
        }

        if !to_remove.is_empty() {
            let mut sessions = self.sessions.lock().unwrap();
            for id in to_remove {
                sessions.remove(&id);
            }
        }
    }

    /// Spawn the per-session lifecycle timer thread that enforces the
    /// hard-kill deadline (spec §4.2: "hard-kill timer (default 10 s,
    /// bounded 1 s..60 s)") and the post-exit cleanup grace (§4.2:
    /// `exitedSessionTtlMs` if persistent, else ~5 s), realized the way
    /// SPEC_FULL §5 describes: a detachable timer thread, woken by a
    /// condition variable on every state transition instead of being
    /// polled by the (much coarser, fixed-cadence) idle sweep. One
    /// thread per session, exiting once the session reaches `removed`.
    fn spawn_lifecycle_timer(self: &Arc<Self>, session: Arc<Session>) {
        let manager = Arc::clone(self);
        thread::Builder::new()
            .name(format!("session-timer({})", session.name))
            .spawn(move || {
                let mut state = session.wait_while_running();

                if state == State::Closing {
                    state = session.wait_for_state_change(State::Closing, manager.cfg.hard_kill_timeout);
                    if state == State::Closing {
                        warn!(session = %session.id, "hard-kill deadline elapsed, forcing exit");
                        let _ = session.pty.kill();
                        // Spec §4.2: past the hard-kill deadline the
                        // session "is removed regardless" — it skips the
                        // usual exited-TTL grace a natural exit gets,
                        // since the child has already proven uncooperative.
                        session.mark_exited(None, None, Some("hard_kill_timeout"));
                        session.mark_removed();
                        manager.remove_session(&session.id);
                        return;
                    }
                }

                if state == State::Exited {
                    let ttl = if session.persistent {
                        manager.cfg.exited_session_ttl
                    } else {
                        consts::NON_PERSISTENT_EXIT_GRACE
                    };
                    state = session.wait_for_state_change(State::Exited, ttl);
                    if state == State::Exited {
                        session.mark_removed();
                        manager.remove_session(&session.id);
                    }
                }

                // Any other observed state (`removed`) means something
                // else — a forced close, or this same race losing to
                // another transition — already took care of it.
            })
            .expect("spawning session lifecycle timer thread");
    }

    /// Stop the idle-sweep thread and force-close every catalogued
    /// session (spec §4.2 `shutdown`), regardless of `persistent` — this
    /// process's child pty handles do not outlive it, so there is no
    /// sense in which a "persistent" session can survive a shutdown of
    /// the manager that owns its only handle. Idempotent.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::Relaxed) {
            return;
        }
        // Rendezvous with the idle-sweep thread's `select!`, which is
        // always ready to receive; this wakes it immediately instead of
        // waiting out the rest of its current tick interval.
        let _ = self.sweep_stop.send(());
        let sessions = self.sessions.lock().unwrap();
        for session in sessions.values() {
            if session.is_live() {
                session.begin_close(Some("shutdown"));
                let _ = session.pty.kill();
            }
        }
    }
}

/// The wire-level metadata payload for a session (spec §4.5). A thin
/// forwarder to [`Session::metadata`] kept here since it's the shape
/// every Session Manager caller (the protocol endpoint, `list`, tests)
/// reaches for.
pub fn session_metadata(session: &Session) -> SessionMetadata {
    session.metadata()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_client_id() {
        let manager = SessionManager::new(Config::default()).unwrap();
        let err = manager.create_session("has a space", CreateSessionOptions::default());
        assert!(matches!(err, Err(Error::InvalidClientId(_))));
    }

    #[test]
    fn unknown_session_is_not_found() {
        let manager = SessionManager::new(Config::default()).unwrap();
        let err = manager.get_owned_session("nope", "alice");
        assert!(matches!(err, Err(Error::NotFound(_))));
    }

    #[test]
    #[cfg_attr(not(unix), ignore)]
    fn hard_kill_deadline_removes_an_uncooperative_session_outright() {
        let cfg =
            Config { hard_kill_timeout: Duration::from_secs(1), ..Config::default() };
        let manager = SessionManager::new(cfg).unwrap();
        let session = manager
            .create_session(
                "alice",
                CreateSessionOptions {
                    shell: Some("/bin/sh".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        // Ignore SIGHUP so the soft-kill signal sent by `close_session`
        // never lets the child exit on its own, forcing the hard-kill
        // path in `sweep_once` to be the only thing that clears it out.
        manager.write(&session.id, "alice", b"trap '' HUP\r").unwrap();
        thread::sleep(Duration::from_millis(200));

        manager.close_session(&session.id, "alice", false).unwrap();
        assert_eq!(session.state(), State::Closing);

        // The session's own lifecycle timer, not the 30 s idle sweep,
        // owns the hard-kill deadline, so poll for it rather than
        // calling a sweep directly.
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && manager.get_session(&session.id).is_ok() {
            thread::sleep(Duration::from_millis(50));
        }

        // Past the hard-kill deadline the session is removed outright
        // (spec §4.2), not merely marked exited and left to the usual
        // exited-TTL grace period.
        assert!(manager.get_session(&session.id).is_err());
    }
}
