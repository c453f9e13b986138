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

//! `runCompatibilityCommand`: a synchronous run-to-completion helper
//! layered on top of the Session Manager and Fan-out Bus. It spawns an
//! ephemeral session, writes the caller's command followed by a
//! shell-family-specific exit-marker emission, waits for the marker to
//! surface in scrollback, scrapes the exit code out of it, and tears
//! the session down — giving callers a plain `(output, exit_code)`
//! result without having to speak the attach/output protocol directly.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use tracing::{instrument, warn};

use crate::{
    consts,
    daemon::manager::{CreateSessionOptions, SessionManager},
    error::Result,
    pty::ShellFamily,
};

/// Arguments to [`run_compatibility_command`].
#[derive(Debug, Clone)]
pub struct CompatibilityRequest {
    pub client_id: String,
    pub command: String,
    pub cwd: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub timeout: Duration,
}

/// Result of a compatibility run.
#[derive(Debug, Clone)]
pub struct CompatibilityOutcome {
    /// Captured output up to (but not including) the exit marker.
    pub output: String,
    pub exit_code: i32,
    pub success: bool,
    pub truncated: bool,
    pub timed_out: bool,
}

/// Generate a fresh exit marker: the configured prefix, a millisecond
/// timestamp, and 64 bits of randomness rendered as hex, so uniqueness
/// holds even across two runs started in the same millisecond.
fn new_marker() -> String {
    let ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
    let mut entropy = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut entropy);
    let hex: String = entropy.iter().map(|b| format!("{b:02x}")).collect();
    format!("{}{}_{}__", consts::EXIT_MARKER_PREFIX, ms, hex)
}

/// The shell-family-specific command line that, once run, prints the
/// marker followed by the previous command's exit status.
fn marker_emission(family: ShellFamily, marker: &str) -> String {
    match family {
        ShellFamily::Unix => format!("printf \"\\n{marker}:%s\\n\" \"$?\""),
        ShellFamily::Powershell => format!("Write-Output \"{marker}:$LASTEXITCODE\""),
        ShellFamily::Cmd => format!("echo {marker}:%ERRORLEVEL%"),
    }
}

/// Scan `haystack` for `marker` followed by `:<int>`, returning the
/// cleaned output (everything before the marker) and the parsed exit
/// code, or `None` if the marker has not appeared yet.
fn parse_marker(haystack: &str, marker: &str) -> Option<(String, i32)> {
    let marker_start = haystack.find(marker)?;
    let rest = &haystack[marker_start + marker.len()..];
    let rest = rest.strip_prefix(':')?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit() || *c == '-').collect();
    let code: i32 = digits.parse().ok()?;
    let cleaned = haystack[..marker_start].trim_end_matches(['\r', '\n']).to_string();
    Some((cleaned, code))
}

/// Run `req.command` to completion in a throwaway session and report
/// its exit status, per spec §4.2 `runCompatibilityCommand`.
#[instrument(skip(manager, req), fields(client = %req.client_id))]
pub fn run_compatibility_command(
    manager: &Arc<SessionManager>,
    req: CompatibilityRequest,
) -> Result<CompatibilityOutcome> {
    let session = manager.create_session(
        &req.client_id,
        CreateSessionOptions {
            name: None,
            shell: None,
            cwd: req.cwd.clone(),
            cols: req.cols,
            rows: req.rows,
            persistent: false,
            env: Default::default(),
            // This session is driven purely programmatically; its pty
            // should echo nothing back so `output` is the command's
            // own stdout/stderr, not a transcript of what was written.
            suppress_echo: true,
        },
    )?;
    let session_id = session.id.clone();
    let marker = new_marker();
    let emission = marker_emission(session.shell_type, &marker);

    // The command and the marker emission are written verbatim,
    // unquoted and unescaped, exactly as typed interactively; see the
    // decided open question on quoting in runCompatibilityCommand.
    let mut line = req.command.clone();
    line.push('\r');
    line.push_str(&emission);
    line.push('\r');

    if let Err(e) = manager.write(&session_id, &req.client_id, line.as_bytes()) {
        let _ = manager.close_session(&session_id, &req.client_id, true);
        return Err(e);
    }

    let outcome = manager.wait_for(
        &session_id,
        &req.client_id,
        Some(&marker),
        false,
        req.timeout,
        manager.config().max_buffer_bytes,
    )?;

    if let Err(e) = manager.close_session(&session_id, &req.client_id, true) {
        warn!(session = %session_id, "error force-closing compatibility session: {}", e);
    }

    if outcome.matched {
        let (output, exit_code) =
            parse_marker(&outcome.tail, &marker).unwrap_or_else(|| (outcome.tail.clone(), consts::TIMEOUT_EXIT_CODE));
        Ok(CompatibilityOutcome {
            success: exit_code == 0,
            output,
            exit_code,
            truncated: outcome.truncated,
            timed_out: false,
        })
    } else {
        Ok(CompatibilityOutcome {
            output: outcome.tail,
            exit_code: consts::TIMEOUT_EXIT_CODE,
            success: false,
            truncated: outcome.truncated,
            timed_out: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_is_well_formed_and_unique() {
        let a = new_marker();
        let b = new_marker();
        assert!(a.starts_with(consts::EXIT_MARKER_PREFIX));
        assert!(a.ends_with("__"));
        assert_ne!(a, b);
    }

    #[test]
    fn marker_emission_matches_shell_family_syntax() {
        let m = "__EVOBREW_EXIT_123_abc__";
        assert_eq!(marker_emission(ShellFamily::Unix, m), "printf \"\\n__EVOBREW_EXIT_123_abc__:%s\\n\" \"$?\"");
        assert_eq!(marker_emission(ShellFamily::Powershell, m), "Write-Output \"__EVOBREW_EXIT_123_abc__:$LASTEXITCODE\"");
        assert_eq!(marker_emission(ShellFamily::Cmd, m), "echo __EVOBREW_EXIT_123_abc__:%ERRORLEVEL%");
    }

    #[test]
    fn parses_exit_code_and_cleans_output() {
        let marker = "__EVOBREW_EXIT_1_dead__";
        let haystack = format!("ok\n{marker}:0\n");
        let (cleaned, code) = parse_marker(&haystack, marker).unwrap();
        assert_eq!(cleaned, "ok");
        assert_eq!(code, 0);
    }

    #[test]
    fn parses_negative_and_nonzero_exit_codes() {
        let marker = "__EVOBREW_EXIT_1_beef__";
        let haystack = format!("some output\n{marker}:137\n");
        let (_, code) = parse_marker(&haystack, marker).unwrap();
        assert_eq!(code, 137);
    }

    #[test]
    fn missing_marker_returns_none() {
        assert_eq!(parse_marker("no marker here", "__EVOBREW_EXIT_1_x__"), None);
    }
}
