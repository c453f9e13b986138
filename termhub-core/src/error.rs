//! The closed error taxonomy surfaced by every Session Manager and
//! Protocol Endpoint operation that a caller might need to branch on.
//!
//! Internal plumbing (config I/O, startup failures) uses `anyhow`
//! instead; this type is reserved for errors a caller acts on by kind.

use thiserror::Error;

/// One variant per error kind a caller of this crate's public
/// operations can receive.
#[derive(Debug, Error)]
pub enum Error {
    #[error("the terminal-session feature is disabled")]
    Disabled,

    #[error("invalid client id: {0}")]
    InvalidClientId(String),

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("invalid working directory: {0}")]
    InvalidCwd(String),

    #[error("working directory '{cwd}' is outside the allowed root '{allowed_root}'")]
    OutsideAllowedRoot { cwd: String, allowed_root: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("client '{client_id}' already owns {limit} live sessions")]
    QuotaExceeded { client_id: String, limit: usize },

    #[error("session '{0}' not found")]
    NotFound(String),

    #[error("session '{session_id}' is not owned by client '{client_id}'")]
    AccessDenied { session_id: String, client_id: String },

    #[error("session '{0}' is not running")]
    NotRunning(String),

    #[error("input of {got} bytes exceeds the {limit}-byte cap")]
    InputTooLarge { got: usize, limit: usize },

    #[error("incoming frame of {got} bytes exceeds the {limit}-byte cap")]
    FrameTooLarge { got: usize, limit: usize },

    #[error("connection '{connection_id}' outbound queue overflowed its {limit}-byte cap")]
    QueueOverflow { connection_id: String, limit: usize },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("pty failure: {0}")]
    PtyFailure(#[source] std::io::Error),
}

impl Error {
    /// A short, stable identifier for the error's kind, useful for
    /// logging and for clients that want to match on something more
    /// structured than the human message.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Disabled => "disabled",
            Error::InvalidClientId(_) => "invalid_client_id",
            Error::InvalidSessionId(_) => "invalid_session_id",
            Error::InvalidCwd(_) => "invalid_cwd",
            Error::OutsideAllowedRoot { .. } => "outside_allowed_root",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::QuotaExceeded { .. } => "quota_exceeded",
            Error::NotFound(_) => "not_found",
            Error::AccessDenied { .. } => "access_denied",
            Error::NotRunning(_) => "not_running",
            Error::InputTooLarge { .. } => "input_too_large",
            Error::FrameTooLarge { .. } => "frame_too_large",
            Error::QueueOverflow { .. } => "queue_overflow",
            Error::Timeout(_) => "timeout",
            Error::PtyFailure(_) => "pty_failure",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
