//! Errors surfaced to relay callers.

use std::time::Duration;

/// Failure of a single relay exchange.
///
/// Each variant is reported at most once per `relay` call and never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("invalid json (send JSON-RPC object or framed MCP message)")]
    MalformedPayload,

    #[error("subprocess unavailable: {0}")]
    SubprocessUnavailable(String),

    #[error("timeout: no reply from subprocess within {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("relay is shutting down")]
    ShuttingDown,
}
