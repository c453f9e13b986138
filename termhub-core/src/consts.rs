//! Constants shared across the daemon's components. Grouped here rather
//! than scattered at each call site, the way shell-session daemons in
//! this lineage have always done it.

use std::time::Duration;

/// Size of the read buffer used by each session's PTY-reader thread.
pub const PTY_READ_BUF_SIZE: usize = 1024 * 16;

/// Cadence of a session's flush-loop poll when nothing else wakes it.
pub const JOIN_POLL_DURATION: Duration = Duration::from_millis(100);

/// How often a connection's flush loop ticks while its queue is non-empty.
pub const FLUSH_LOOP_INTERVAL: Duration = Duration::from_millis(20);

/// Fixed cadence of the idle-sweep task. Deliberately not configurable;
/// see the design notes on this decision.
pub const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Grace period an `exited`, non-persistent session remains queryable.
pub const NON_PERSISTENT_EXIT_GRACE: Duration = Duration::from_secs(5);

/// How long `Session::kill` waits after a soft kill before escalating.
pub const SOFT_KILL_ESCALATION: Duration = Duration::from_millis(500);

/// Fragment count past which the scrollback buffer coalesces into one
/// contiguous fragment to keep per-append work amortized O(1).
pub const SCROLLBACK_COALESCE_THRESHOLD: usize = 512;

/// Prefix for the unique compatibility-run exit marker.
pub const EXIT_MARKER_PREFIX: &str = "__EVOBREW_EXIT_";

/// Exit code reported when `runCompatibilityCommand` times out without
/// ever observing its exit marker.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

pub const STDERR_FD: i32 = 2;

/// How long the pty-reader thread waits for the reaper thread's
/// `waitpid` result after seeing EOF on the master fd, before reporting
/// the session exited with an unknown status.
pub const EOF_EXIT_STATUS_GRACE: Duration = Duration::from_millis(250);

/// Read timeout set on an accepted WebSocket's underlying socket so the
/// protocol endpoint's blocking read loop periodically releases its
/// connection lock for outbound flushes instead of starving them.
pub const WS_READ_POLL_INTERVAL: Duration = Duration::from_millis(50);
