//! # Error Model
//!
//! Two layers of error handling live here:
//!
//! - [`ErrorKind`] is the closed, wire-stable set of failure names carried in
//!   reply frames. Peers on both ends of a session agree on these names.
//! - [`RpcError`] is the library error surfaced to callers. It reconstructs
//!   from a wire kind plus payload on the client, and is produced directly
//!   for local failures (timeouts, lost connections, closed handles).
//!
//! Failures raised by a hosted object are never fatal to its server. They are
//! captured as a [`RemoteError`] record carrying the error type name, message,
//! a rendered traceback and the cause chain, so callers get diagnostics
//! without holding references into the remote process.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-stable failure names carried in reply frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Target ID not present or already released
    UnknownObject,
    /// Target lacks the required capability
    UnsupportedOp,
    /// Target operation failed; payload carries the remote error record
    RemoteRaised,
    /// A value in args or result could not be encoded under the requested
    /// return mode
    Unserializable,
    /// Sync deadline elapsed
    Timeout,
    /// Future was cancelled before completion
    Cancelled,
    /// Transport failed mid-flight
    ConnectionLost,
    /// Server rejected the request because it is closing
    ShuttingDown,
    /// Attempted to pass a local value by reference without a local server
    NoLocalServer,
    /// Child process failed to come up (surfaced by an external spawner)
    BootstrapFailed,
    /// Client was closed while the request was pending
    Closed,
}

impl ErrorKind {
    /// Stable name used in logs and diagnostics on both sides of the wire.
    pub fn wire_name(&self) -> &'static str {
        match self {
            ErrorKind::UnknownObject => "UNKNOWN_OBJECT",
            ErrorKind::UnsupportedOp => "UNSUPPORTED_OP",
            ErrorKind::RemoteRaised => "REMOTE_RAISED",
            ErrorKind::Unserializable => "UNSERIALIZABLE",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::ConnectionLost => "CONNECTION_LOST",
            ErrorKind::ShuttingDown => "SHUTTING_DOWN",
            ErrorKind::NoLocalServer => "NO_LOCAL_SERVER",
            ErrorKind::BootstrapFailed => "BOOTSTRAP_FAILED",
            ErrorKind::Closed => "CLOSED",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Structured record of a failure raised by a remote target operation.
///
/// Captured on the server from the full error chain so the client can render
/// useful diagnostics long after the originating objects are gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Error type name on the remote side
    pub type_name: String,
    /// Top-level error message
    pub message: String,
    /// Rendered multi-line traceback text
    pub traceback: String,
    /// Messages of the cause chain, outermost first
    pub chain: Vec<String>,
}

impl RemoteError {
    /// Capture an error chain into a wire-transportable record.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let chain: Vec<String> = err.chain().map(|cause| cause.to_string()).collect();
        let mut traceback = String::new();
        for (depth, cause) in chain.iter().enumerate() {
            if depth == 0 {
                traceback.push_str(cause);
            } else {
                traceback.push_str("\n  caused by: ");
                traceback.push_str(cause);
            }
        }
        Self {
            type_name: "anyhow::Error".to_string(),
            message: err.to_string(),
            traceback,
            chain,
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

/// Library error type surfaced by client and proxy operations.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("unknown object id {0}")]
    UnknownObject(u64),

    #[error("unsupported operation: {0}")]
    UnsupportedOp(String),

    #[error("remote raised {0}")]
    Remote(RemoteError),

    #[error("unserializable value: {0}")]
    Unserializable(String),

    #[error("request timed out")]
    Timeout,

    #[error("request was cancelled")]
    Cancelled,

    #[error("connection lost")]
    ConnectionLost,

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("no local server to host by-reference values")]
    NoLocalServer,

    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("client is closed")]
    Closed,

    /// Malformed traffic on an otherwise healthy session. Fatal to the
    /// session, reported locally only.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Result alias used across the public API.
pub type RpcResult<T> = Result<T, RpcError>;

impl RpcError {
    /// Wire kind for this error.
    ///
    /// [`RpcError::Protocol`] has no wire form of its own; sessions that hit
    /// it are torn down, so the peer observes a lost connection.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::UnknownObject(_) => ErrorKind::UnknownObject,
            RpcError::UnsupportedOp(_) => ErrorKind::UnsupportedOp,
            RpcError::Remote(_) => ErrorKind::RemoteRaised,
            RpcError::Unserializable(_) => ErrorKind::Unserializable,
            RpcError::Timeout => ErrorKind::Timeout,
            RpcError::Cancelled => ErrorKind::Cancelled,
            RpcError::ConnectionLost => ErrorKind::ConnectionLost,
            RpcError::ShuttingDown => ErrorKind::ShuttingDown,
            RpcError::NoLocalServer => ErrorKind::NoLocalServer,
            RpcError::Bootstrap(_) => ErrorKind::BootstrapFailed,
            RpcError::Closed => ErrorKind::Closed,
            RpcError::Protocol(_) => ErrorKind::ConnectionLost,
        }
    }

    /// Payload value accompanying the wire kind in a reply frame.
    pub fn to_payload(&self) -> Value {
        match self {
            RpcError::UnknownObject(id) => Value::Int(*id as i64),
            RpcError::UnsupportedOp(msg)
            | RpcError::Unserializable(msg)
            | RpcError::Bootstrap(msg)
            | RpcError::Protocol(msg) => Value::Str(msg.clone()),
            RpcError::Remote(remote) => {
                Value::opaque_from("RemoteError", remote).unwrap_or(Value::Null)
            }
            _ => Value::Null,
        }
    }

    /// Rebuild an error from a reply frame's kind and payload.
    pub fn from_wire(kind: ErrorKind, payload: &Value) -> Self {
        match kind {
            ErrorKind::UnknownObject => {
                RpcError::UnknownObject(payload.as_i64().unwrap_or(0) as u64)
            }
            ErrorKind::UnsupportedOp => {
                RpcError::UnsupportedOp(payload.as_str().unwrap_or("").to_string())
            }
            ErrorKind::RemoteRaised => match payload.opaque_as::<RemoteError>() {
                Some(remote) => RpcError::Remote(remote),
                None => RpcError::Remote(RemoteError {
                    type_name: "unknown".to_string(),
                    message: "remote error record was not decodable".to_string(),
                    traceback: String::new(),
                    chain: Vec::new(),
                }),
            },
            ErrorKind::Unserializable => {
                RpcError::Unserializable(payload.as_str().unwrap_or("").to_string())
            }
            ErrorKind::Timeout => RpcError::Timeout,
            ErrorKind::Cancelled => RpcError::Cancelled,
            ErrorKind::ConnectionLost => RpcError::ConnectionLost,
            ErrorKind::ShuttingDown => RpcError::ShuttingDown,
            ErrorKind::NoLocalServer => RpcError::NoLocalServer,
            ErrorKind::BootstrapFailed => {
                RpcError::Bootstrap(payload.as_str().unwrap_or("").to_string())
            }
            ErrorKind::Closed => RpcError::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn remote_error_captures_chain() {
        let inner = anyhow::anyhow!("disk on fire");
        let err = Err::<(), _>(inner)
            .context("while flushing")
            .context("save failed")
            .unwrap_err();

        let remote = RemoteError::from_anyhow(&err);
        assert_eq!(remote.message, "save failed");
        assert_eq!(remote.chain.len(), 3);
        assert_eq!(remote.chain[2], "disk on fire");
        assert!(remote.traceback.contains("caused by: disk on fire"));
    }

    #[test]
    fn wire_round_trip_preserves_kind_and_payload() {
        let err = RpcError::UnknownObject(42);
        let rebuilt = RpcError::from_wire(err.kind(), &err.to_payload());
        match rebuilt {
            RpcError::UnknownObject(id) => assert_eq!(id, 42),
            other => panic!("unexpected error: {other:?}"),
        }

        let remote = RemoteError {
            type_name: "ValueError".to_string(),
            message: "bad input".to_string(),
            traceback: "ValueError: bad input".to_string(),
            chain: vec!["bad input".to_string()],
        };
        let err = RpcError::Remote(remote.clone());
        match RpcError::from_wire(err.kind(), &err.to_payload()) {
            RpcError::Remote(r) => assert_eq!(r, remote),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn kind_names_are_wire_stable() {
        assert_eq!(ErrorKind::UnknownObject.wire_name(), "UNKNOWN_OBJECT");
        assert_eq!(ErrorKind::NoLocalServer.wire_name(), "NO_LOCAL_SERVER");
        assert_eq!(ErrorKind::RemoteRaised.to_string(), "REMOTE_RAISED");
    }
}
