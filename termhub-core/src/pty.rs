//! PTY Spawner (spec §4.1): shell resolution, cwd validation, the
//! environment overlay, and the platform-specific fork/exec behind a
//! pseudo-terminal.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
};

use serde_derive::{Deserialize, Serialize};
use tracing::instrument;

use crate::{error::Error, tty::Size, user};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellFamily {
    Unix,
    Powershell,
    Cmd,
}

impl fmt::Display for ShellFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShellFamily::Unix => write!(f, "unix"),
            ShellFamily::Powershell => write!(f, "powershell"),
            ShellFamily::Cmd => write!(f, "cmd"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShellSpec {
    pub path: String,
    pub family: ShellFamily,
    pub args: Vec<String>,
}

/// Resolve which shell to spawn, per spec §4.1's shell-resolution rules.
#[instrument(skip(user_info))]
pub fn resolve_shell(explicit: Option<&str>, user_info: &user::Info) -> ShellSpec {
    if let Some(shell) = explicit.filter(|s| !s.is_empty()) {
        let family = if cfg!(windows) { ShellFamily::Powershell } else { ShellFamily::Unix };
        return ShellSpec { path: shell.to_string(), family, args: vec![] };
    }

    if cfg!(windows) {
        resolve_windows_shell()
    } else {
        let path = if user_info.default_shell.is_empty() {
            "/bin/bash".to_string()
        } else {
            user_info.default_shell.clone()
        };
        ShellSpec { path, family: ShellFamily::Unix, args: vec![] }
    }
}

fn resolve_windows_shell() -> ShellSpec {
    if let Ok(pwsh) = std::env::var("TERMHUB_POWERSHELL_PATH") {
        return ShellSpec {
            path: pwsh,
            family: ShellFamily::Powershell,
            args: vec!["-NoLogo".to_string(), "-NoProfile".to_string()],
        };
    }
    if which_on_path("powershell.exe").is_some() || which_on_path("pwsh.exe").is_some() {
        return ShellSpec {
            path: "powershell.exe".to_string(),
            family: ShellFamily::Powershell,
            args: vec!["-NoLogo".to_string(), "-NoProfile".to_string()],
        };
    }
    ShellSpec { path: "cmd.exe".to_string(), family: ShellFamily::Cmd, args: vec![] }
}

fn which_on_path(exe: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).map(|dir| dir.join(exe)).find(|candidate| candidate.exists())
}

/// Validate and canonicalize a working directory against an optional
/// allowed-root boundary, per spec §4.1/§3.2 invariant 6.
#[instrument(skip(allowed_root))]
pub fn validate_cwd(
    requested: Option<&str>,
    home_dir: &str,
    allowed_root: Option<&Path>,
) -> Result<PathBuf, Error> {
    let raw = match requested {
        Some(p) if !p.is_empty() => PathBuf::from(p),
        _ => PathBuf::from(home_dir),
    };

    let normalized = normalize(&raw);
    if !normalized.is_dir() {
        return Err(Error::InvalidCwd(format!(
            "'{}' does not exist or is not a directory",
            normalized.display()
        )));
    }

    let Some(root) = allowed_root else {
        return Ok(normalized);
    };

    let canonical_root = canonicalize_best_effort(root);
    let canonical_cwd = canonicalize_best_effort(&normalized);

    let ok = canonical_cwd == canonical_root
        || canonical_cwd.starts_with(&canonical_root)
            && canonical_cwd
                .strip_prefix(&canonical_root)
                .map(|rest| rest.as_os_str().is_empty() || rest.components().next().is_some())
                .unwrap_or(false);

    if ok {
        Ok(normalized)
    } else {
        Err(Error::OutsideAllowedRoot {
            cwd: normalized.display().to_string(),
            allowed_root: root.display().to_string(),
        })
    }
}

/// Lexical (syntactic) normalization: collapse `.`/`..` components
/// without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        use std::path::Component::*;
        match component {
            CurDir => {}
            ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize through symlinks, walking up to the deepest existing
/// ancestor for paths with a non-existent leaf (spec §4.1: "walk
/// parents for non-existent leaves to find the deepest real ancestor").
fn canonicalize_best_effort(path: &Path) -> PathBuf {
    let mut candidate = path.to_path_buf();
    let mut trailing = PathBuf::new();
    loop {
        match candidate.canonicalize() {
            Ok(real) => return real.join(trailing),
            Err(_) => {
                let Some(file_name) = candidate.file_name() else {
                    return path.to_path_buf();
                };
                let mut rest = PathBuf::from(file_name);
                rest.push(&trailing);
                trailing = rest;
                if !candidate.pop() {
                    return path.to_path_buf();
                }
            }
        }
    }
}

/// Build the environment overlay described in spec §4.1: inherit the
/// process environment, overlay `TERM`/`COLORTERM` unless already set,
/// then overlay caller-supplied pairs.
pub fn build_env(overrides: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.entry("TERM".to_string()).or_insert_with(|| "xterm-256color".to_string());
    env.entry("COLORTERM".to_string()).or_insert_with(|| "truecolor".to_string());
    for (k, v) in overrides {
        env.insert(k.clone(), v.clone());
    }
    env.into_iter().collect()
}

/// Opaque handle to a running pseudo-terminal child, satisfying the
/// spec §4.1 spawn contract: `write`, `resize`, `kill`, and (through
/// [`PtyChild::reader`]) `onData`.
pub trait PtyChild: Send + Sync {
    fn write(&self, data: &[u8]) -> std::io::Result<()>;
    fn resize(&self, size: Size) -> std::io::Result<()>;
    /// Terminate the child. Polite first (SIGHUP on Unix), escalating
    /// to a forceful kill if it does not exit promptly.
    fn kill(&self) -> std::io::Result<()>;
    fn child_pid(&self) -> i32;
    /// An independently-owned handle for reading the child's output.
    /// The session's single pty-reader thread calls this exactly once,
    /// at session creation, and owns the result for the session's
    /// whole lifetime.
    fn try_clone_reader(&self) -> std::io::Result<Box<dyn std::io::Read + Send>>;
    /// Best-effort fetch of the child's exit status once it becomes
    /// known, waiting up to `timeout`. Used by the pty-reader thread to
    /// attach a real `(code, signal)` to a session's `exited` state
    /// instead of guessing from EOF alone (the reaper thread that calls
    /// `waitpid` and this EOF-on-read may race by a few milliseconds).
    fn wait_exit(&self, timeout: std::time::Duration) -> Option<crate::daemon::exit_notify::ExitStatus>;
}

#[cfg(unix)]
pub use unix::{spawn, UnixPtyChild};

#[cfg(unix)]
mod unix {
    use std::{
        ffi::CString,
        io::{Read, Write},
        sync::Arc,
        thread,
    };

    use anyhow::Context;
    use nix::{sys::signal, unistd::Pid};
    use tracing::{info, span, Level};

    use super::{PtyChild, ShellSpec};
    use crate::{consts, daemon::exit_notify::ExitNotifier, error::Error, tty::Size};

    pub struct UnixPtyChild {
        fork: shpool_pty::fork::Fork,
        child_pid: libc::pid_t,
        pub exit_notifier: Arc<ExitNotifier>,
    }

    impl UnixPtyChild {
        /// A fresh master handle for reading/writing pty bytes. The pty
        /// reader thread owns exactly one of these for the session's
        /// lifetime.
        pub fn master(&self) -> anyhow::Result<shpool_pty::fork::Master> {
            self.fork.is_parent().context("internal error: executing in child fork")
        }
    }

    impl PtyChild for UnixPtyChild {
        fn write(&self, data: &[u8]) -> std::io::Result<()> {
            let mut master = self.master().map_err(std::io::Error::other)?;
            master.write_all(data)?;
            master.flush()
        }

        fn resize(&self, size: Size) -> std::io::Result<()> {
            let master = self.master().map_err(std::io::Error::other)?;
            let fd = (*master.raw_fd())
                .ok_or_else(|| std::io::Error::other("no master fd available to resize"))?;
            size.set_fd(fd).map_err(std::io::Error::other)
        }

        fn kill(&self) -> std::io::Result<()> {
            signal::kill(Pid::from_raw(self.child_pid), Some(signal::Signal::SIGHUP))
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;

            if self.exit_notifier.wait(Some(consts::SOFT_KILL_ESCALATION)).is_none() {
                info!(pid = self.child_pid, "child did not exit after SIGHUP, sending SIGKILL");
                signal::kill(Pid::from_raw(self.child_pid), Some(signal::Signal::SIGKILL))
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            }
            Ok(())
        }

        fn child_pid(&self) -> i32 {
            self.child_pid
        }

        fn try_clone_reader(&self) -> std::io::Result<Box<dyn Read + Send>> {
            let master = self.master().map_err(std::io::Error::other)?;
            Ok(Box::new(master))
        }

        fn wait_exit(&self, timeout: std::time::Duration) -> Option<crate::daemon::exit_notify::ExitStatus> {
            self.exit_notifier.wait(Some(timeout))
        }
    }

    /// Fork, exec the resolved shell in a fresh pty, and spawn the
    /// background reaper thread that reports its exit status.
    pub fn spawn(
        spec: &ShellSpec,
        cwd: &std::path::Path,
        env: &[(String, String)],
        size: Size,
        session_name: &str,
        suppress_echo: bool,
    ) -> Result<UnixPtyChild, Error> {
        let mut fork = shpool_pty::fork::Fork::from_ptmx()
            .map_err(|e| Error::PtyFailure(std::io::Error::other(e.to_string())))?;

        if let Ok(slave) = fork.is_child() {
            if let Some(fd) = *slave.raw_fd() {
                let _ = size.set_fd(fd);
                if suppress_echo {
                    let _ = crate::tty::disable_echo(fd);
                }
            }
            for fd in consts::STDERR_FD + 1..(nix::unistd::SysconfVar::OPEN_MAX as i32) {
                let _ = nix::unistd::close(fd);
            }
            if std::env::set_current_dir(cwd).is_err() {
                std::process::exit(1);
            }
            for (k, _) in std::env::vars() {
                std::env::remove_var(k);
            }
            for (k, v) in env {
                std::env::set_var(k, v);
            }
            let path = CString::new(spec.path.as_bytes()).unwrap_or_default();
            let mut argv: Vec<CString> = vec![path.clone()];
            for a in &spec.args {
                argv.push(CString::new(a.as_bytes()).unwrap_or_default());
            }
            let mut argv_ptrs: Vec<*const libc::c_char> =
                argv.iter().map(|a| a.as_ptr()).collect();
            argv_ptrs.push(std::ptr::null());
            unsafe {
                // Safety: argv_ptrs is a null-terminated array of valid
                // C strings kept alive in `argv` for the duration of
                // this call, which never returns on success.
                libc::execvp(path.as_ptr(), argv_ptrs.as_ptr());
            }
            std::process::exit(1);
        }

        let exit_notifier = Arc::new(ExitNotifier::new());
        let waitable_child_pid =
            fork.child_pid().ok_or_else(|| Error::PtyFailure(std::io::Error::other("no child pid")))?;
        let notifiable = Arc::clone(&exit_notifier);
        let name = session_name.to_string();
        thread::spawn(move || {
            let _s = span!(Level::INFO, "pty_child_watcher", s = name).entered();
            let mut status: libc::c_int = 0;
            let exit_status = loop {
                unsafe {
                    // Safety: waitable_child_pid is a valid pid owned
                    // by this process; status is stack allocated.
                    match libc::waitpid(waitable_child_pid, &mut status, 0) {
                        -1 => break crate::daemon::exit_notify::ExitStatus::exited(1),
                        0 => continue,
                        _ => {
                            if libc::WIFEXITED(status) {
                                break crate::daemon::exit_notify::ExitStatus::exited(
                                    libc::WEXITSTATUS(status),
                                );
                            } else if libc::WIFSIGNALED(status) {
                                break crate::daemon::exit_notify::ExitStatus::signaled(
                                    libc::WTERMSIG(status),
                                );
                            } else {
                                break crate::daemon::exit_notify::ExitStatus::exited(1);
                            }
                        }
                    }
                }
            };
            info!(code = ?exit_status.code, signal = ?exit_status.signal, "child exited");
            notifiable.notify_exit(exit_status);
        });

        Ok(UnixPtyChild { fork, child_pid: waitable_child_pid, exit_notifier })
    }
}

#[cfg(windows)]
pub use windows::{spawn, WindowsPtyChild};

#[cfg(windows)]
mod windows {
    use super::{PtyChild, ShellSpec};
    use crate::{error::Error, tty::Size};

    /// Best-effort Windows pty child. Shell resolution and cwd
    /// validation are fully implemented (see the parent module); the
    /// actual conpty-backed spawn is not, since no vetted cross-
    /// platform pty crate is already present in this crate's
    /// dependency stack. Every operation fails with `PtyFailure`
    /// rather than silently no-opping.
    pub struct WindowsPtyChild;

    impl PtyChild for WindowsPtyChild {
        fn write(&self, _data: &[u8]) -> std::io::Result<()> {
            Err(std::io::Error::other("windows pty backend not implemented"))
        }
        fn resize(&self, _size: Size) -> std::io::Result<()> {
            Err(std::io::Error::other("windows pty backend not implemented"))
        }
        fn kill(&self) -> std::io::Result<()> {
            Err(std::io::Error::other("windows pty backend not implemented"))
        }
        fn child_pid(&self) -> i32 {
            -1
        }

        fn try_clone_reader(&self) -> std::io::Result<Box<dyn std::io::Read + Send>> {
            Err(std::io::Error::other("windows pty backend not implemented"))
        }

        fn wait_exit(&self, _timeout: std::time::Duration) -> Option<crate::daemon::exit_notify::ExitStatus> {
            None
        }
    }

    pub fn spawn(
        _spec: &ShellSpec,
        _cwd: &std::path::Path,
        _env: &[(String, String)],
        _size: Size,
        _session_name: &str,
        _suppress_echo: bool,
    ) -> Result<WindowsPtyChild, Error> {
        Err(Error::PtyFailure(std::io::Error::other(
            "windows pty spawning is not yet supported by this build",
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_shell_prefers_explicit() {
        let info = user::Info {
            default_shell: "/bin/zsh".to_string(),
            home_dir: "/home/alice".to_string(),
            user: "alice".to_string(),
        };
        let spec = resolve_shell(Some("/usr/bin/fish"), &info);
        assert_eq!(spec.path, "/usr/bin/fish");
    }

    #[test]
    fn resolve_shell_falls_back_to_bash() {
        let info = user::Info {
            default_shell: String::new(),
            home_dir: "/home/alice".to_string(),
            user: "alice".to_string(),
        };
        let spec = resolve_shell(None, &info);
        if !cfg!(windows) {
            assert_eq!(spec.path, "/bin/bash");
            assert_eq!(spec.family, ShellFamily::Unix);
        }
    }

    #[test]
    fn validate_cwd_rejects_nonexistent() {
        let err = validate_cwd(Some("/does/not/exist/anywhere"), "/home/alice", None);
        assert!(matches!(err, Err(Error::InvalidCwd(_))));
    }

    #[test]
    fn validate_cwd_accepts_root_itself() {
        let tmp = std::env::temp_dir();
        let result = validate_cwd(Some(tmp.to_str().unwrap()), "/home/alice", Some(&tmp));
        assert!(result.is_ok());
    }

    #[test]
    fn validate_cwd_rejects_outside_allowed_root() {
        let tmp = std::env::temp_dir();
        let result = validate_cwd(Some("/"), "/home/alice", Some(&tmp));
        assert_matches::assert_matches!(result, Err(Error::OutsideAllowedRoot { .. }));
    }

    #[test]
    fn validate_cwd_accepts_nested_subdir_of_allowed_root() {
        let root = tempfile::tempdir().expect("creating temp allowed-root");
        let nested = root.path().join("project").join("src");
        std::fs::create_dir_all(&nested).expect("creating nested project dir");
        let result = validate_cwd(Some(nested.to_str().unwrap()), "/home/alice", Some(root.path()));
        assert_matches::assert_matches!(result, Ok(_));
    }

    #[test]
    fn build_env_sets_term_defaults() {
        let env = build_env(&HashMap::new());
        let term = env.iter().find(|(k, _)| k == "TERM").map(|(_, v)| v.clone());
        assert_eq!(term.as_deref(), Some("xterm-256color"));
    }

    #[test]
    fn build_env_caller_overrides_win() {
        let mut overrides = HashMap::new();
        overrides.insert("TERM".to_string(), "screen".to_string());
        let env = build_env(&overrides);
        let term = env.iter().find(|(k, _)| k == "TERM").map(|(_, v)| v.clone());
        assert_eq!(term.as_deref(), Some("screen"));
    }
}
