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

//! The Message Protocol Endpoint (spec §4.5): the per-connection read
//! loop that turns JSON/WebSocket frames into Session Manager calls and
//! Session Manager state into JSON/WebSocket frames. Everything else in
//! `daemon` is transport-agnostic; this module is the only place that
//! knows the wire format.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use termhub_protocol::{Incoming, Outgoing};
use tracing::{debug, info, instrument};

use crate::{
    daemon::{
        connection::{Connection, Transport, TransportEvent},
        iso_now,
        manager::{session_metadata, SessionManager},
    },
    ids,
};

const KNOWN_TYPES: &[&str] = &["attach", "input", "resize", "close", "list", "ping"];

/// Serve one accepted connection until the peer disconnects or a fatal
/// protocol error closes it. Blocks the calling thread for the
/// connection's whole lifetime; callers spawn one thread per accepted
/// connection, the way this lineage's daemon spawns one thread per
/// client session.
#[instrument(skip(manager, transport), fields(client = %client_id))]
pub fn serve_connection(manager: Arc<SessionManager>, client_id: String, transport: Box<dyn Transport>) {
    let connection_id = ids::new_connection_id();
    let cfg = manager.config().clone();
    let max_frame_bytes = cfg.max_incoming_message_bytes;
    let replay_max_bytes = cfg.max_buffer_bytes;

    let manager_for_bp = Arc::clone(&manager);
    let connection_id_for_bp = connection_id.clone();
    let attached: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let attached_for_bp = Arc::clone(&attached);
    let conn = Connection::new(
        connection_id.clone(),
        client_id.clone(),
        transport,
        &cfg,
        Box::new(move |enabled| {
            if let Some(sid) = attached_for_bp.lock().unwrap().as_ref() {
                manager_for_bp.set_backpressure(sid, &connection_id_for_bp, enabled);
            }
        }),
    );

    let _ = conn.send(&Outgoing::Ready {
        connection_id: connection_id.clone(),
        client_id: client_id.clone(),
        ts: iso_now(),
        session: None,
        replay: None,
    });

    info!(connection = %connection_id, "connection established");

    loop {
        if conn.is_closed() {
            break;
        }
        match conn.read_event() {
            Ok(TransportEvent::TimedOut) => continue,
            Ok(TransportEvent::Ignored) => continue,
            Ok(TransportEvent::Closed) => break,
            Ok(TransportEvent::Text(text)) => {
                if text.len() > max_frame_bytes {
                    let _ = conn.send(&Outgoing::Error {
                        error: format!(
                            "incoming frame of {} bytes exceeds the {}-byte limit",
                            text.len(),
                            max_frame_bytes
                        ),
                    });
                    continue;
                }
                handle_frame(&manager, &conn, &client_id, &attached, replay_max_bytes, &text);
            }
            Err(e) => {
                debug!(connection = %connection_id, "transport read error, closing: {}", e);
                break;
            }
        }
    }

    manager.detach_everywhere(&connection_id);
    conn.close(1000, "connection closed");
    info!(connection = %connection_id, "connection closed");
}

fn handle_frame(
    manager: &Arc<SessionManager>,
    conn: &Arc<Connection>,
    client_id: &str,
    attached: &Arc<Mutex<Option<String>>>,
    replay_max_bytes: usize,
    text: &str,
) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            let _ = conn.send(&Outgoing::Error { error: "invalid JSON".to_string() });
            return;
        }
    };

    let ty = match value.get("type").and_then(Value::as_str) {
        Some(t) => t,
        None => {
            let _ = conn.send(&Outgoing::Error { error: "missing 'type' field".to_string() });
            return;
        }
    };

    if !KNOWN_TYPES.contains(&ty) {
        let _ = conn.send(&Outgoing::Error { error: format!("Unknown message type: {ty}") });
        return;
    }

    let incoming: Incoming = match serde_json::from_value(value) {
        Ok(msg) => msg,
        Err(e) => {
            let _ = conn.send(&Outgoing::Error { error: format!("malformed '{ty}' message: {e}") });
            return;
        }
    };

    match incoming {
        Incoming::Attach { session_id } => handle_attach(manager, conn, client_id, attached, replay_max_bytes, session_id),
        Incoming::Input { session_id, data } => handle_input(manager, conn, client_id, attached, session_id, data),
        Incoming::Resize { session_id, cols, rows } => {
            handle_resize(manager, conn, client_id, attached, session_id, cols, rows)
        }
        Incoming::Close { session_id } => handle_close(manager, conn, client_id, attached, session_id),
        Incoming::List => handle_list(manager, conn, client_id),
        Incoming::Ping => {
            let _ = conn.send(&Outgoing::Pong { ts: iso_now() });
        }
    }
}

fn resolve_session_id(attached: &Arc<Mutex<Option<String>>>, explicit: Option<String>) -> Option<String> {
    explicit.or_else(|| attached.lock().unwrap().clone())
}

fn handle_attach(
    manager: &Arc<SessionManager>,
    conn: &Arc<Connection>,
    client_id: &str,
    attached: &Arc<Mutex<Option<String>>>,
    replay_max_bytes: usize,
    session_id: String,
) {
    manager.detach_everywhere(&conn.id);
    let sink: Arc<dyn crate::daemon::session::BusSink> = Arc::clone(conn);
    match manager.attach(&session_id, client_id, sink, replay_max_bytes) {
        Ok((session, replay)) => {
            *attached.lock().unwrap() = Some(session_id.clone());
            let metadata = session_metadata(&session);
            let _ = conn.send(&Outgoing::Ready {
                connection_id: conn.id.clone(),
                client_id: client_id.to_string(),
                ts: iso_now(),
                session: Some(metadata),
                replay: Some(String::from_utf8_lossy(&replay).into_owned()),
            });
        }
        Err(e) => {
            let _ = conn.send(&Outgoing::Error { error: e.to_string() });
        }
    }
}

fn handle_input(
    manager: &Arc<SessionManager>,
    conn: &Arc<Connection>,
    client_id: &str,
    attached: &Arc<Mutex<Option<String>>>,
    session_id: Option<String>,
    data: String,
) {
    let Some(sid) = resolve_session_id(attached, session_id) else {
        let _ = conn.send(&Outgoing::Error { error: "no session attached".to_string() });
        return;
    };
    if let Err(e) = manager.write(&sid, client_id, data.as_bytes()) {
        let _ = conn.send(&Outgoing::Error { error: e.to_string() });
    }
}

fn handle_resize(
    manager: &Arc<SessionManager>,
    conn: &Arc<Connection>,
    client_id: &str,
    attached: &Arc<Mutex<Option<String>>>,
    session_id: Option<String>,
    cols: u16,
    rows: u16,
) {
    let Some(sid) = resolve_session_id(attached, session_id) else {
        let _ = conn.send(&Outgoing::Error { error: "no session attached".to_string() });
        return;
    };
    if let Err(e) = manager.resize(&sid, client_id, cols, rows) {
        let _ = conn.send(&Outgoing::Error { error: e.to_string() });
    }
}

fn handle_close(
    manager: &Arc<SessionManager>,
    conn: &Arc<Connection>,
    client_id: &str,
    attached: &Arc<Mutex<Option<String>>>,
    session_id: Option<String>,
) {
    let Some(sid) = resolve_session_id(attached, session_id) else {
        let _ = conn.send(&Outgoing::Error { error: "no session attached".to_string() });
        return;
    };
    if let Err(e) = manager.close_session(&sid, client_id, true) {
        let _ = conn.send(&Outgoing::Error { error: e.to_string() });
    }
}

fn handle_list(manager: &Arc<SessionManager>, conn: &Arc<Connection>, client_id: &str) {
    let sessions = manager.list_sessions(client_id).iter().map(|s| session_metadata(s)).collect();
    let _ = conn.send(&Outgoing::Sessions { sessions });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_is_rejected_before_variant_parsing() {
        assert!(!KNOWN_TYPES.contains(&"frobnicate"));
    }

    #[test]
    fn resolve_session_id_prefers_explicit_over_attached() {
        let attached = Arc::new(Mutex::new(Some("attached-session".to_string())));
        assert_eq!(
            resolve_session_id(&attached, Some("explicit-session".to_string())),
            Some("explicit-session".to_string())
        );
        assert_eq!(resolve_session_id(&attached, None), Some("attached-session".to_string()));
    }

    #[test]
    fn resolve_session_id_none_when_nothing_attached() {
        let attached: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        assert_eq!(resolve_session_id(&attached, None), None);
    }
}
