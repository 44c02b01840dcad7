//! # Configuration
//!
//! Option structs for clients and servers. Every knob has a documented
//! default in [`crate::defaults`]; construction via `Default` plus struct
//! update syntax is the expected style:
//!
//! ```
//! use objlink::ClientOptions;
//! use std::time::Duration;
//!
//! let opts = ClientOptions {
//!     default_timeout: Duration::from_secs(2),
//!     ..Default::default()
//! };
//! ```

use std::time::Duration;

/// Payload serializer variant negotiated between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializerKind {
    /// Compact binary encoding of the value tree
    Compact,
    /// Compact encoding plus the packed numeric array extension
    CompactArrays,
}

/// When release notices for dropped proxies go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleasePolicy {
    /// Coalesce releases into one notice per window or per `max` entries.
    /// This is the contract mode; it keeps release storms off the wire.
    Coalesced { every: Duration, max: usize },
    /// Send each release immediately. Debug aid only.
    Immediate,
}

impl Default for ReleasePolicy {
    fn default() -> Self {
        ReleasePolicy::Coalesced {
            every: crate::defaults::RELEASE_BATCH_EVERY,
            max: crate::defaults::RELEASE_BATCH_MAX,
        }
    }
}

/// Client-side configuration.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Deadline applied to `sync` calls that do not carry their own
    pub default_timeout: Duration,
    /// Batching of release notices for dropped proxies
    pub release: ReleasePolicy,
    /// Payload serializer
    pub serializer: SerializerKind,
    /// Encoded size above which `auto` mode prefers by-reference
    pub auto_proxy_threshold: usize,
    /// Socket send/receive buffer size in bytes
    pub buffer_size: usize,
    /// Peer name announced in the connection handshake. Servers key
    /// reference attribution on it. `None` derives one: the local server's
    /// address when the process has one, otherwise a unique client token.
    pub peer_name: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            default_timeout: crate::defaults::SYNC_TIMEOUT,
            release: ReleasePolicy::default(),
            serializer: SerializerKind::Compact,
            auto_proxy_threshold: crate::defaults::AUTO_PROXY_THRESHOLD,
            buffer_size: crate::defaults::BUFFER_SIZE,
            peer_name: None,
        }
    }
}

/// Server-side configuration.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Payload serializer
    pub serializer: SerializerKind,
    /// Encoded size above which `auto` return mode prefers by-reference
    pub auto_proxy_threshold: usize,
    /// Socket send/receive buffer size in bytes
    pub buffer_size: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            serializer: SerializerKind::Compact,
            auto_proxy_threshold: crate::defaults::AUTO_PROXY_THRESHOLD,
            buffer_size: crate::defaults::BUFFER_SIZE,
        }
    }
}
