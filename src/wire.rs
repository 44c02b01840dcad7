//! # Wire Protocol
//!
//! Frame model and framing I/O shared by clients and servers. Every message
//! on a session is a single [`Frame`]:
//!
//! - `Req`: an operation on a target object, tagged with the invocation mode
//!   and the requested return mode
//! - `Rep`: the response to a request, correlated by request id
//! - `Notice`: one-way traffic with no id: handshakes, reference releases,
//!   cancellations, forwarded log records and shutdown announcements
//!
//! On the byte level a frame is a little-endian `u32` length prefix followed
//! by the bincode encoding of the `Frame` enum, capped at
//! [`crate::defaults::MAX_FRAME_BYTES`] to bound decoder allocations.

use crate::error::ErrorKind;
use crate::proxy::PathSegment;
use crate::value::Value;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// How the caller observes the outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallMode {
    /// Block until the reply arrives or the deadline passes
    Sync,
    /// Return a future handle; the reply completes it
    Async,
    /// Fire and forget: no request id, no reply, errors stay on the server
    Off,
}

/// Whether a reply carries a copied value or a new proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnMode {
    /// Force a deep copy; fail with `UNSERIALIZABLE` when impossible
    Value,
    /// Force by-reference
    Proxy,
    /// Copy small plain data, proxy everything else
    Auto,
}

impl Default for ReturnMode {
    fn default() -> Self {
        ReturnMode::Auto
    }
}

/// Comparison operator carried by the `Cmp` opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Operations a request may perform on its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    /// Invoke the target with positional and keyword arguments
    Call,
    /// Fetch a named member; with no name argument, fetch the resolved
    /// target itself
    GetAttr,
    /// Assign a named member
    SetAttr,
    /// Container read access
    GetItem,
    /// Container write access
    SetItem,
    /// Container deletion
    DelItem,
    /// Structural comparison
    Cmp(CmpOp),
    /// Integer length
    Len,
    /// Load a published module by name (server builtin, target 0)
    Import,
    /// Return the target's object id for identity checks
    GetId,
    /// No-op round trip
    Ping,
}

impl Opcode {
    /// Stable name for logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Call => "CALL",
            Opcode::GetAttr => "GETATTR",
            Opcode::SetAttr => "SETATTR",
            Opcode::GetItem => "GETITEM",
            Opcode::SetItem => "SETITEM",
            Opcode::DelItem => "DELITEM",
            Opcode::Cmp(_) => "CMP",
            Opcode::Len => "LEN",
            Opcode::Import => "IMPORT",
            Opcode::GetId => "GET_ID",
            Opcode::Ping => "PING",
        }
    }
}

/// An operation on a remote target.
///
/// `path` holds the lazily composed attribute/item chain of the issuing
/// proxy; the server walks it before applying the opcode, so chained access
/// costs a single round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique per client, monotonic; 0 for fire-and-forget requests
    pub id: u64,
    pub op: Opcode,
    /// Object id on the receiving server; 0 addresses the server itself
    pub target: u64,
    pub path: Vec<PathSegment>,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
    pub mode: CallMode,
    pub return_mode: ReturnMode,
}

/// Outcome status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Err(ErrorKind),
}

/// Response to a request, correlated by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub id: u64,
    pub status: Status,
    pub payload: Value,
}

/// Severity of a forwarded log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// One-way traffic outside the request/reply cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Notice {
    /// First frame on every connection: names the connecting peer. Servers
    /// key reference attribution and reentrancy classification on it.
    Hello { peer: String },
    /// Batched reference releases: `(object id, count)` pairs
    Release { pairs: Vec<(u64, i64)> },
    /// Reference transfer for a forwarded third-party proxy
    Incref { id: u64, n: i64, holder: String },
    /// Best-effort cancellation of a pending request
    Cancel { request: u64 },
    /// Log record forwarded across the wire
    Log { level: LogLevel, message: String },
    /// The server is closing; pending requests will not be answered
    ServerClosed,
}

/// A single message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    Req(Request),
    Rep(Reply),
    Notice(Notice),
}

/// Read one length-prefixed frame from the stream.
///
/// Fails on malformed prefixes, oversized frames and mid-frame disconnects.
/// A clean EOF before the prefix surfaces as an error too; callers treat it
/// as the end of the session.
pub async fn read_frame<R>(stream: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let frame_len = u32::from_le_bytes(len_bytes) as usize;

    if frame_len > crate::defaults::MAX_FRAME_BYTES {
        return Err(anyhow!("frame too large: {} bytes", frame_len));
    }

    let mut frame_data = vec![0u8; frame_len];
    stream.read_exact(&mut frame_data).await?;

    Ok(bincode::deserialize(&frame_data)?)
}

/// Write one length-prefixed frame to the stream.
pub async fn write_frame<W>(stream: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame_bytes = bincode::serialize(frame)?;
    if frame_bytes.len() > crate::defaults::MAX_FRAME_BYTES {
        return Err(anyhow!("frame too large: {} bytes", frame_bytes.len()));
    }
    let frame_len = frame_bytes.len() as u32;

    stream.write_all(&frame_len.to_le_bytes()).await?;
    stream.write_all(&frame_bytes).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Request {
        Request {
            id: 9,
            op: Opcode::Call,
            target: 3,
            path: vec![PathSegment::Attr("add".to_string())],
            args: vec![Value::Int(2), Value::Int(3)],
            kwargs: BTreeMap::new(),
            mode: CallMode::Sync,
            return_mode: ReturnMode::Auto,
        }
    }

    #[tokio::test]
    async fn frame_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let frame = Frame::Req(sample_request());
        write_frame(&mut a, &frame).await.unwrap();

        let decoded = read_frame(&mut b).await.unwrap();
        match decoded {
            Frame::Req(req) => {
                assert_eq!(req.id, 9);
                assert_eq!(req.op, Opcode::Call);
                assert_eq!(req.args, vec![Value::Int(2), Value::Int(3)]);
                assert_eq!(req.path.len(), 1);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_prefix_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let huge = (crate::defaults::MAX_FRAME_BYTES as u32 + 1).to_le_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &huge)
            .await
            .unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(err.to_string().contains("frame too large"));
    }

    #[tokio::test]
    async fn disconnect_mid_frame_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        // Announce 100 bytes but deliver only 3, then hang up.
        tokio::io::AsyncWriteExt::write_all(&mut a, &100u32.to_le_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut a, &[1, 2, 3])
            .await
            .unwrap();
        drop(a);

        assert!(read_frame(&mut b).await.is_err());
    }

    #[test]
    fn notice_round_trip() {
        let notice = Frame::Notice(Notice::Release {
            pairs: vec![(4, 1), (9, 2)],
        });
        let bytes = bincode::serialize(&notice).unwrap();
        match bincode::deserialize::<Frame>(&bytes).unwrap() {
            Frame::Notice(Notice::Release { pairs }) => {
                assert_eq!(pairs, vec![(4, 1), (9, 2)])
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
