//! The daemon-side implementation of the terminal-multiplexing core:
//! PTY child exit notification, sessions and their fan-out bus, the
//! session manager and catalogue, per-connection backpressure, the
//! exit-marker compatibility runner, and the JSON-over-WebSocket
//! protocol endpoint that ties them together.

pub mod compat;
pub mod connection;
pub mod endpoint;
pub mod exit_notify;
pub mod manager;
pub mod session;
pub mod signals;

use chrono::{DateTime, SecondsFormat, Utc};

/// Render a timestamp the way every wire frame reports one: UTC,
/// millisecond precision, RFC 3339 with a literal `Z` offset.
pub(crate) fn iso_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn iso_now() -> String {
    iso_timestamp(Utc::now())
}
