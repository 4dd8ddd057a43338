//! Error types for the connector.
//!
//! Breaker rejections are distinct typed variants so callers and the
//! dispatcher classify them structurally instead of inspecting messages.

use thiserror::Error;

/// Result type alias for connector operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the connector.
///
/// All variants carry owned data so per-command pipeline errors can be kept
/// in their slots while an aggregate copy is derived.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The node's circuit is open; the call was rejected without dispatch.
    #[error("circuit open: {key}")]
    CircuitOpen {
        /// Breaker key of the rejecting node.
        key: String,
    },

    /// The node's concurrency cap (or its waiting queue) is exhausted.
    #[error("max concurrency reached: {key}")]
    MaxConcurrency {
        /// Breaker key of the rejecting node.
        key: String,
    },

    /// The breaker-imposed per-call timeout expired.
    #[error("breaker timeout after {timeout_ms}ms: {key}")]
    BreakerTimeout {
        /// Breaker key of the timed-out node.
        key: String,
        /// The configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// A protected call panicked; converted to an error and counted.
    #[error("panic in protected call: {0}")]
    Panicked(String),

    /// Dial/read/write failure or pool exhaustion in the driver layer.
    #[error("transport error: {0}")]
    Transport(String),

    /// Well-formed negative reply from the server, surfaced verbatim.
    #[error("server error: {0}")]
    Server(String),

    /// A writable target reported itself read-only (topology drift).
    #[error("read-only node: {0}")]
    ReadOnlyNode(String),

    /// The caller's context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's deadline expired.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Configuration or reload-validation failure.
    #[error("config error: {0}")]
    Config(String),

    /// The command catalog was not available at construction.
    #[error("no command cache")]
    NoCommandCache,

    /// The connector has been shut down.
    #[error("client is closed")]
    ClientClosed,

    /// The shadow queue was full and the task was not accepted.
    #[error("shadow queue full (depth {depth})")]
    QueueFull {
        /// Queue depth observed at rejection time.
        depth: usize,
    },
}

impl Error {
    /// Whether this error originated at the breaker boundary.
    pub fn is_breaker(&self) -> bool {
        matches!(
            self,
            Error::CircuitOpen { .. }
                | Error::MaxConcurrency { .. }
                | Error::BreakerTimeout { .. }
                | Error::Panicked(_)
        )
    }

    /// Whether this is a server-reported error with the given prefix.
    pub fn has_server_prefix(&self, prefix: &str) -> bool {
        matches!(self, Error::Server(msg) if msg.starts_with(prefix))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}
