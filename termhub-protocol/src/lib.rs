//! Wire types exchanged between a termhub client and the termhub
//! terminal-multiplexing daemon over a WebSocket text-frame transport.
//!
//! Every frame is UTF-8 JSON with a required `type` tag. Incoming and
//! outgoing messages are modeled as separate tagged enums so that
//! `serde_json` does the dispatch for us instead of hand-matching on a
//! string field.

use serde_derive::{Deserialize, Serialize};

/// A message sent from a client to the daemon.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Incoming {
    Attach { session_id: String },
    Input { session_id: Option<String>, data: String },
    Resize { session_id: Option<String>, cols: u16, rows: u16 },
    Close { session_id: Option<String> },
    List,
    Ping,
}

/// A message sent from the daemon to a client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outgoing {
    Ready {
        connection_id: String,
        client_id: String,
        ts: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<SessionMetadata>,
        #[serde(skip_serializing_if = "Option::is_none")]
        replay: Option<String>,
    },
    Output {
        session_id: String,
        data: String,
        ts: String,
    },
    Exit {
        session_id: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
        ts: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    State {
        session: SessionMetadata,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Sessions {
        sessions: Vec<SessionMetadata>,
    },
    Pong {
        ts: String,
    },
    Error {
        error: String,
    },
}

/// The shell family a session's child process belongs to, used by the
/// exit-marker scraping logic and reported to clients for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellType {
    Unix,
    Powershell,
    Cmd,
}

/// The lifecycle state of a session, as reported over the wire. Mirrors
/// the `running -> closing -> exited -> removed` progression; `removed`
/// sessions are never reported since they no longer exist in the
/// catalogue, but the variant exists so state transitions can be logged
/// and tested uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Running,
    Closing,
    Exited,
    Removed,
}

/// The full metadata payload for a session, sent in `ready` (on attach),
/// `state`, and `sessions` frames.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub client_id: String,
    pub name: String,
    pub shell: String,
    pub shell_type: ShellType,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub state: SessionState,
    pub persistent: bool,
    pub created_at: String,
    pub last_active_at: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub attached_connections: usize,
    pub flow_paused: bool,
    pub buffer_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incoming_attach_round_trips() {
        let json = r#"{"type":"attach","session_id":"abc123"}"#;
        let msg: Incoming = serde_json::from_str(json).unwrap();
        match msg {
            Incoming::Attach { session_id } => assert_eq!(session_id, "abc123"),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn incoming_input_session_id_optional() {
        let json = r#"{"type":"input","data":"ls\n"}"#;
        let msg: Incoming = serde_json::from_str(json).unwrap();
        match msg {
            Incoming::Input { session_id, data } => {
                assert_eq!(session_id, None);
                assert_eq!(data, "ls\n");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn incoming_unknown_type_fails_to_parse() {
        let json = r#"{"type":"frobnicate"}"#;
        assert!(serde_json::from_str::<Incoming>(json).is_err());
    }

    #[test]
    fn outgoing_error_serializes_with_tag() {
        let msg = Outgoing::Error { error: "boom".to_string() };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("\"error\":\"boom\""));
    }

    #[test]
    fn outgoing_ready_omits_absent_optionals() {
        let msg = Outgoing::Ready {
            connection_id: "c1".into(),
            client_id: "alice".into(),
            ts: "2026-07-27T00:00:00.000Z".into(),
            session: None,
            replay: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("session"));
        assert!(!json.contains("replay"));
    }
}
