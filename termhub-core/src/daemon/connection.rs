//! The Backpressure & Flow Controller and the Connection entity it
//! governs (spec §4.4). Each connection owns exactly one outbound
//! queue, one flush thread, and one transport; nothing else writes to
//! the transport, so frame ordering within a connection falls out of
//! that ownership for free.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
};

use termhub_protocol::Outgoing;
use tracing::{debug, warn};

use crate::{config::Config, consts, daemon::session::BusSink, error::Error};

/// What the read side of a transport observed on one poll. The
/// protocol endpoint's read loop matches on this rather than the raw
/// `tungstenite::Message` so that its dispatch logic stays testable
/// against the same [`Transport`] double the write-side tests use.
pub enum TransportEvent {
    /// A text frame carrying one protocol message.
    Text(String),
    /// A frame this endpoint doesn't act on (binary, ping/pong): a
    /// no-op from the protocol's point of view.
    Ignored,
    /// The read timed out without a frame arriving; not an error, just
    /// the read side's way of periodically giving up the transport
    /// lock back to the write side.
    TimedOut,
    /// The peer closed the connection.
    Closed,
}

/// The read/write sides of a connection's transport. Implemented for
/// the sync `tungstenite` WebSocket directly; kept as a trait so tests
/// can supply an in-memory double without opening a socket.
pub trait Transport: Send {
    fn send_text(&mut self, text: &str) -> std::io::Result<()>;
    fn close(&mut self, code: u16, reason: &str);
    /// Block for at most the socket's configured read timeout waiting
    /// for the next client frame. Sync `tungstenite` offers no split
    /// read/write halves, so the endpoint's read loop and the
    /// connection's write path share the same transport behind a
    /// mutex; a short read timeout (set on the raw socket before the
    /// WebSocket handshake) keeps this method from starving outbound
    /// flushes while it waits.
    fn read_text(&mut self) -> std::io::Result<TransportEvent>;
}

impl Transport for tungstenite::WebSocket<std::net::TcpStream> {
    fn send_text(&mut self, text: &str) -> std::io::Result<()> {
        self.send(tungstenite::Message::Text(text.to_string())).map_err(ws_err_to_io)
    }

    fn close(&mut self, code: u16, reason: &str) {
        use tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
        let frame =
            CloseFrame { code: CloseCode::from(code), reason: reason.to_string().into() };
        let _ = tungstenite::WebSocket::close(self, Some(frame));
    }

    fn read_text(&mut self) -> std::io::Result<TransportEvent> {
        match self.read() {
            Ok(tungstenite::Message::Text(text)) => Ok(TransportEvent::Text(text)),
            Ok(tungstenite::Message::Close(_)) => Ok(TransportEvent::Closed),
            Ok(_) => Ok(TransportEvent::Ignored),
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) =>
            {
                Ok(TransportEvent::TimedOut)
            }
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(TransportEvent::Closed)
            }
            Err(e) => Err(ws_err_to_io(e)),
        }
    }
}

fn ws_err_to_io(e: tungstenite::Error) -> std::io::Error {
    match e {
        tungstenite::Error::Io(io_err) => io_err,
        tungstenite::Error::WriteBufferFull(_) => {
            std::io::Error::new(std::io::ErrorKind::WouldBlock, "websocket write buffer full")
        }
        other => std::io::Error::other(other.to_string()),
    }
}

struct Queue {
    frames: VecDeque<Vec<u8>>,
}

/// One client's WebSocket connection. Implements [`BusSink`] so a
/// session's fan-out bus can hand it data/exit events directly; those
/// events become `output`/`exit` frames subject to the same
/// queue/watermark policy as everything else sent to this connection.
pub struct Connection {
    pub id: String,
    pub client_id: String,
    queue: Mutex<Queue>,
    queued_bytes: AtomicUsize,
    backpressured: AtomicBool,
    closed: AtomicBool,
    transport: Mutex<Box<dyn Transport>>,
    high_watermark: usize,
    low_watermark: usize,
    hard_cap: usize,
    on_backpressure_change: Box<dyn Fn(bool) + Send + Sync>,
}

impl Connection {
    pub fn new(
        id: String,
        client_id: String,
        transport: Box<dyn Transport>,
        cfg: &Config,
        on_backpressure_change: Box<dyn Fn(bool) + Send + Sync>,
    ) -> Arc<Connection> {
        let conn = Arc::new(Connection {
            id,
            client_id,
            queue: Mutex::new(Queue { frames: VecDeque::new() }),
            queued_bytes: AtomicUsize::new(0),
            backpressured: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            transport: Mutex::new(transport),
            high_watermark: cfg.queue_high_watermark_bytes,
            low_watermark: cfg.queue_low_watermark_bytes,
            hard_cap: cfg.max_queued_outbound_bytes,
            on_backpressure_change,
        });
        conn.spawn_flush_loop();
        conn
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn is_backpressured(&self) -> bool {
        self.backpressured.load(Ordering::Relaxed)
    }

    /// Serialize and deliver a frame, per spec §4.4's send policy:
    /// write straight through when the queue is already empty, else
    /// append and let the flush loop catch up.
    pub fn send(&self, frame: &Outgoing) -> Result<(), Error> {
        if self.is_closed() {
            return Ok(());
        }
        let bytes = match serde_json::to_vec(frame) {
            Ok(b) => b,
            Err(e) => {
                warn!("connection {}: failed to serialize outgoing frame: {}", self.id, e);
                return Ok(());
            }
        };
        self.enqueue_or_write(bytes)
    }

    fn enqueue_or_write(&self, bytes: Vec<u8>) -> Result<(), Error> {
        let mut q = self.queue.lock().unwrap();
        if q.frames.is_empty() {
            drop(q);
            match self.write_direct(&bytes) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    q = self.queue.lock().unwrap();
                }
                Err(e) => {
                    debug!("connection {}: transport write failed, closing: {}", self.id, e);
                    self.force_close(1011, "transport write failed");
                    return Ok(());
                }
            }
        }

        let next_total = self.queued_bytes.load(Ordering::Relaxed) + bytes.len();
        if next_total > self.hard_cap {
            drop(q);
            self.force_close(1011, "outbound queue overflow");
            return Err(Error::QueueOverflow { connection_id: self.id.clone(), limit: self.hard_cap });
        }

        q.frames.push_back(bytes);
        self.queued_bytes.store(next_total, Ordering::Relaxed);
        drop(q);
        self.recheck_watermarks();
        Ok(())
    }

    fn write_direct(&self, bytes: &[u8]) -> std::io::Result<()> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| std::io::Error::other("non-utf8 outgoing frame"))?;
        self.transport.lock().unwrap().send_text(text)
    }

    fn spawn_flush_loop(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        thread::Builder::new()
            .name(format!("conn-flush({})", conn.id))
            .spawn(move || loop {
                if conn.is_closed() {
                    return;
                }
                conn.flush_once();
                thread::sleep(consts::FLUSH_LOOP_INTERVAL);
            })
            .expect("spawning connection flush thread");
    }

    fn flush_once(&self) {
        loop {
            let next = {
                let q = self.queue.lock().unwrap();
                q.frames.front().cloned()
            };
            let Some(bytes) = next else { break };
            match self.write_direct(&bytes) {
                Ok(()) => {
                    let mut q = self.queue.lock().unwrap();
                    q.frames.pop_front();
                    self.queued_bytes.fetch_sub(bytes.len(), Ordering::Relaxed);
                    drop(q);
                    self.recheck_watermarks();
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("connection {}: flush failed, closing: {}", self.id, e);
                    self.force_close(1011, "transport write failed");
                    break;
                }
            }
        }
    }

    fn recheck_watermarks(&self) {
        let bytes = self.queued_bytes.load(Ordering::Relaxed);
        let was = self.backpressured.load(Ordering::Relaxed);
        if !was && bytes >= self.high_watermark {
            self.backpressured.store(true, Ordering::Relaxed);
            (self.on_backpressure_change)(true);
        } else if was && bytes <= self.low_watermark {
            self.backpressured.store(false, Ordering::Relaxed);
            (self.on_backpressure_change)(false);
        }
    }

    fn force_close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        self.transport.lock().unwrap().close(code, reason);
        (self.on_backpressure_change)(false);
    }

    pub fn close(&self, code: u16, reason: &str) {
        self.force_close(code, reason);
    }

    /// Poll the transport for the next incoming frame. Locks the same
    /// mutex the write path uses; bounded by the short read timeout
    /// the endpoint sets on the underlying socket, so this never holds
    /// the lock long enough to starve a pending flush.
    pub fn read_event(&self) -> std::io::Result<TransportEvent> {
        self.transport.lock().unwrap().read_text()
    }
}

impl BusSink for Connection {
    fn connection_id(&self) -> &str {
        &self.id
    }

    fn on_data(&self, session_id: &str, data: &[u8]) {
        let frame = Outgoing::Output {
            session_id: session_id.to_string(),
            data: String::from_utf8_lossy(data).into_owned(),
            ts: super::iso_now(),
        };
        let _ = self.send(&frame);
    }

    fn on_exit(&self, session_id: &str, exit_code: Option<i32>, signal: Option<i32>, reason: Option<&str>) {
        let frame = Outgoing::Exit {
            session_id: session_id.to_string(),
            exit_code,
            signal,
            ts: super::iso_now(),
            reason: reason.map(String::from),
        };
        let _ = self.send(&frame);
    }

    fn on_state(&self, metadata: termhub_protocol::SessionMetadata, reason: Option<&str>) {
        let frame = Outgoing::State { session: metadata, reason: reason.map(String::from) };
        let _ = self.send(&frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingTransport {
        sent: Arc<StdMutex<Vec<String>>>,
        fail_next: bool,
    }

    impl Transport for RecordingTransport {
        fn send_text(&mut self, text: &str) -> std::io::Result<()> {
            if self.fail_next {
                return Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, "full"));
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
        fn close(&mut self, _code: u16, _reason: &str) {}
        fn read_text(&mut self) -> std::io::Result<TransportEvent> {
            Ok(TransportEvent::TimedOut)
        }
    }

    fn test_config() -> Config {
        Config {
            queue_high_watermark_bytes: 32,
            queue_low_watermark_bytes: 8,
            max_queued_outbound_bytes: 1024,
            ..Default::default()
        }
    }

    #[test]
    fn send_writes_directly_when_queue_empty() {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let transport = Box::new(RecordingTransport { sent: Arc::clone(&sent), fail_next: false });
        let conn = Connection::new(
            "c1".into(),
            "alice".into(),
            transport,
            &test_config(),
            Box::new(|_| {}),
        );
        conn.send(&Outgoing::Pong { ts: "now".into() }).unwrap();
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn queue_overflow_beyond_hard_cap_closes_and_errors() {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let transport = Box::new(RecordingTransport { sent: Arc::clone(&sent), fail_next: true });
        let mut cfg = test_config();
        cfg.max_queued_outbound_bytes = 4;
        let conn =
            Connection::new("c1".into(), "alice".into(), transport, &cfg, Box::new(|_| {}));
        let result = conn.send(&Outgoing::Pong { ts: "0123456789".into() });
        assert!(matches!(result, Err(Error::QueueOverflow { .. })));
        assert!(conn.is_closed());
    }

    #[test]
    fn backpressure_callback_fires_once_above_high_watermark() {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let transport = Box::new(RecordingTransport { sent, fail_next: true });
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let calls2 = Arc::clone(&calls);
        let conn = Connection::new(
            "c1".into(),
            "alice".into(),
            transport,
            &test_config(),
            Box::new(move |enabled| calls2.lock().unwrap().push(enabled)),
        );
        for _ in 0..5 {
            let _ = conn.send(&Outgoing::Pong { ts: "0123456789".into() });
        }
        assert_eq!(calls.lock().unwrap().last().copied(), Some(true));
    }
}
