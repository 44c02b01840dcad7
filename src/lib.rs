//! # objlink
//!
//! Transparent remote object proxies over TCP. A process hosts values on an
//! [`RpcServer`]; other processes hold [`ObjectProxy`] handles whose calls,
//! attribute access, indexing, comparisons and lifetime events are forwarded
//! to the owning process. Small results are copied back, complex results come
//! back as further proxies, and proxies may travel the other way as arguments
//! so remote code can call back into the sender.
//!
//! The crate provides:
//! - a framed message transport over `tcp://host:port` and `inproc://name`
//! - a self-describing value codec with proxy and opaque-blob extension points
//! - a per-server object registry with per-peer reference counting
//! - sync, async and fire-and-forget invocation modes
//! - a reentrant server loop so callback arguments do not deadlock

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod local;
pub mod logging;
pub mod objects;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod transport;
pub mod value;
pub mod wire;

pub use client::{CallFuture, CallOptions, Returned, RpcClient};
pub use config::{ClientOptions, ReleasePolicy, SerializerKind, ServerOptions};
pub use error::{ErrorKind, RemoteError, RpcError, RpcResult};
pub use objects::{Caps, Kwargs, Outcome, RemoteObject, ServiceFn, ValueCell};
pub use proxy::{ObjectProxy, PathSegment, ProxyDescriptor};
pub use server::{CallCx, RpcServer};
pub use value::Value;
pub use wire::{CallMode, CmpOp, ReturnMode};

/// The current version of the objlink crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default deadline for `sync` calls
    pub const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default coalescing window for batched release notices
    pub const RELEASE_BATCH_EVERY: Duration = Duration::from_millis(50);

    /// Default entry count that forces an early release flush
    pub const RELEASE_BATCH_MAX: usize = 64;

    /// Encoded size above which `auto` return mode prefers by-reference
    pub const AUTO_PROXY_THRESHOLD: usize = 64 * 1024;

    /// Default socket send/receive buffer size in bytes
    pub const BUFFER_SIZE: usize = 8192;

    /// Hard cap on a single wire frame
    pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
}
