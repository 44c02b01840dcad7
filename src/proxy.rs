//! # Proxies
//!
//! An [`ObjectProxy`] is a local handle standing in for a value owned by a
//! remote server. Its wire identity is the [`ProxyDescriptor`]: the owning
//! server's address, the object id, the capability bitmap and an attribute
//! or item path composed lazily on the client.
//!
//! `proxy.attr("a").attr("b")` never touches the network; it produces a new
//! handle whose descriptor extends the path. The round trip happens at the
//! terminal operation: a call, a comparison, a length, an item access or an
//! explicit fetch.
//!
//! Handles are cached per client in a weak table keyed by
//! `(object id, path)`, so equal descriptors resolve to the same live handle
//! and identity comparisons stay meaningful. Dropping the last handle for a
//! counted descriptor schedules a batched release notice to the owning
//! server.

use crate::client::{CallFuture, CallOptions, Returned, RpcClient};
use crate::error::{RpcError, RpcResult};
use crate::objects::Caps;
use crate::value::Value;
use crate::wire::{CmpOp, Opcode, ReturnMode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::warn;

/// One lazily composed step of attribute or item access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PathSegment {
    /// Named member access
    Attr(String),
    /// Container key or index access
    Item(Value),
}

/// Wire-serializable identity of a remote value.
///
/// Two descriptors denote the same live object exactly when their server
/// address, object id and path are all equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyDescriptor {
    /// Canonical URL of the owning server
    pub server_addr: String,
    /// Object id on that server; never 0
    pub object_id: u64,
    /// Type label of the root object
    pub type_name: String,
    /// Capability bitmap of the root object
    pub caps: Caps,
    /// Lazily composed access path below the root
    pub path: Vec<PathSegment>,
}

impl ProxyDescriptor {
    /// Derive a descriptor one access step deeper.
    pub fn with_segment(&self, segment: PathSegment) -> Self {
        let mut path = self.path.clone();
        path.push(segment);
        Self {
            server_addr: self.server_addr.clone(),
            object_id: self.object_id,
            type_name: self.type_name.clone(),
            caps: self.caps,
            path,
        }
    }

    /// Whether this descriptor points at the root object rather than into
    /// an attribute or item chain.
    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    fn table_key(&self) -> TableKey {
        let path_bytes = bincode::serialize(&self.path).unwrap_or_default();
        (self.object_id, path_bytes)
    }
}

pub(crate) struct ProxyInner {
    pub(crate) desc: ProxyDescriptor,
    pub(crate) client: Arc<RpcClient>,
    /// Whether this handle owns one wire reference to the remote entry.
    /// Path-derived handles share their root's reference instead.
    counted: bool,
    /// Keeps the counted root alive while derived handles exist.
    _parent: Option<Arc<ProxyInner>>,
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        if self.counted {
            self.client.schedule_release(self.desc.object_id, 1);
        }
    }
}

type TableKey = (u64, Vec<u8>);

/// Per-client weak cache of live proxies.
#[derive(Default)]
pub(crate) struct ProxyTable {
    map: Mutex<HashMap<TableKey, Weak<ProxyInner>>>,
}

impl ProxyTable {
    /// Resolve a decoded descriptor to a live handle.
    ///
    /// `counted` marks descriptors that arrived over the wire, where the
    /// sender transferred one reference. When such a descriptor hits a live
    /// cache entry the transferred reference is redundant and is returned to
    /// the server right away.
    pub(crate) fn claim(
        &self,
        client: &Arc<RpcClient>,
        desc: ProxyDescriptor,
        counted: bool,
    ) -> ObjectProxy {
        self.claim_inner(client, desc, counted, None)
    }

    fn claim_inner(
        &self,
        client: &Arc<RpcClient>,
        desc: ProxyDescriptor,
        counted: bool,
        parent: Option<Arc<ProxyInner>>,
    ) -> ObjectProxy {
        let key = desc.table_key();
        let mut map = self.map.lock();

        if let Some(existing) = map.get(&key).and_then(Weak::upgrade) {
            drop(map);
            if counted {
                // The sender bumped the count for a handle we already have.
                client.schedule_release(desc.object_id, 1);
            }
            return ObjectProxy { inner: existing };
        }

        let inner = Arc::new(ProxyInner {
            desc,
            client: Arc::clone(client),
            counted,
            _parent: parent,
        });
        map.retain(|_, weak| weak.strong_count() > 0);
        map.insert(key, Arc::downgrade(&inner));
        ObjectProxy { inner }
    }

    /// Number of live cached handles.
    pub(crate) fn live_count(&self) -> usize {
        self.map
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

/// Local handle for a value owned by a remote server.
#[derive(Clone)]
pub struct ObjectProxy {
    inner: Arc<ProxyInner>,
}

impl std::fmt::Debug for ObjectProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectProxy")
            .field("server", &self.inner.desc.server_addr)
            .field("id", &self.inner.desc.object_id)
            .field("path", &self.inner.desc.path)
            .finish()
    }
}

impl PartialEq for ObjectProxy {
    /// Identity comparison: same server, object and path.
    fn eq(&self, other: &Self) -> bool {
        self.inner.desc.server_addr == other.inner.desc.server_addr
            && self.inner.desc.object_id == other.inner.desc.object_id
            && self.inner.desc.path == other.inner.desc.path
    }
}

impl ObjectProxy {
    /// Descriptor naming the remote value.
    pub fn descriptor(&self) -> &ProxyDescriptor {
        &self.inner.desc
    }

    /// Client this handle forwards through.
    pub fn client(&self) -> &Arc<RpcClient> {
        &self.inner.client
    }

    /// Wire form of this handle, for use as an argument value.
    pub fn to_value(&self) -> Value {
        Value::ObjectRef(self.inner.desc.clone())
    }

    /// Derive a handle for a named member. No round trip happens until a
    /// terminal operation.
    pub fn attr(&self, name: &str) -> ObjectProxy {
        let desc = self
            .inner
            .desc
            .with_segment(PathSegment::Attr(name.to_string()));
        self.inner.client.proxy_table().claim_inner(
            &self.inner.client,
            desc,
            false,
            Some(Arc::clone(&self.inner)),
        )
    }

    /// Derive a handle for a contained item. No round trip happens until a
    /// terminal operation.
    pub fn at(&self, key: impl Into<Value>) -> ObjectProxy {
        let desc = self
            .inner
            .desc
            .with_segment(PathSegment::Item(key.into()));
        self.inner.client.proxy_table().claim_inner(
            &self.inner.client,
            desc,
            false,
            Some(Arc::clone(&self.inner)),
        )
    }

    fn check_cap(&self, required: Caps, op: &'static str) -> RpcResult<()> {
        // Only root handles know their capabilities; path-derived targets
        // are checked by the server after resolution.
        if self.inner.desc.is_root() && !self.inner.desc.caps.contains(required) {
            warn!(
                op,
                type_name = %self.inner.desc.type_name,
                "operation rejected by capability bitmap"
            );
            return Err(RpcError::UnsupportedOp(format!(
                "{} does not support {}",
                self.inner.desc.type_name, op
            )));
        }
        Ok(())
    }

    /// Invoke the remote value synchronously with positional arguments.
    pub async fn call(&self, args: Vec<Value>) -> RpcResult<Returned> {
        self.call_with(args, Default::default(), CallOptions::default())
            .await
    }

    /// Invoke with positional and keyword arguments plus explicit options.
    pub async fn call_with(
        &self,
        args: Vec<Value>,
        kwargs: crate::objects::Kwargs,
        opts: CallOptions,
    ) -> RpcResult<Returned> {
        self.check_cap(Caps::CALL, "CALL")?;
        self.inner
            .client
            .request(self.spec(Opcode::Call, args, kwargs, opts.return_mode), opts)
            .await
    }

    /// Invoke in async mode; the returned future observes the reply.
    pub fn call_async(&self, args: Vec<Value>) -> RpcResult<CallFuture> {
        self.check_cap(Caps::CALL, "CALL")?;
        self.inner.client.submit(self.spec(
            Opcode::Call,
            args,
            Default::default(),
            ReturnMode::Auto,
        ))
    }

    /// Invoke in fire-and-forget mode: no reply, errors stay on the server.
    pub fn call_off(&self, args: Vec<Value>) -> RpcResult<()> {
        self.check_cap(Caps::CALL, "CALL")?;
        self.inner.client.send_off(self.spec(
            Opcode::Call,
            args,
            Default::default(),
            ReturnMode::Auto,
        ))
    }

    /// Fetch the value this handle resolves to. This is the explicit
    /// materialization point of a lazily composed path.
    pub async fn get(&self) -> RpcResult<Returned> {
        self.inner
            .client
            .request(
                self.spec(
                    Opcode::GetAttr,
                    Vec::new(),
                    Default::default(),
                    ReturnMode::Auto,
                ),
                CallOptions::default(),
            )
            .await
    }

    /// Assign a named member on the remote value.
    pub async fn set_attr(&self, name: &str, value: Value) -> RpcResult<()> {
        self.check_cap(Caps::GET_ATTR, "SETATTR")?;
        self.inner
            .client
            .request(
                self.spec(
                    Opcode::SetAttr,
                    vec![Value::from(name), value],
                    Default::default(),
                    ReturnMode::Auto,
                ),
                CallOptions::default(),
            )
            .await
            .map(|_| ())
    }

    /// Terminal item fetch: one round trip resolves the whole path plus
    /// this key.
    pub async fn get_item(&self, key: impl Into<Value>) -> RpcResult<Returned> {
        self.check_cap(Caps::GET_ITEM, "GETITEM")?;
        self.inner
            .client
            .request(
                self.spec(
                    Opcode::GetItem,
                    vec![key.into()],
                    Default::default(),
                    ReturnMode::Auto,
                ),
                CallOptions::default(),
            )
            .await
    }

    /// Assign a contained item on the remote value.
    pub async fn set_item(&self, key: impl Into<Value>, value: Value) -> RpcResult<()> {
        self.check_cap(Caps::SET_ITEM, "SETITEM")?;
        self.inner
            .client
            .request(
                self.spec(
                    Opcode::SetItem,
                    vec![key.into(), value],
                    Default::default(),
                    ReturnMode::Auto,
                ),
                CallOptions::default(),
            )
            .await
            .map(|_| ())
    }

    /// Delete a contained item on the remote value.
    pub async fn del_item(&self, key: impl Into<Value>) -> RpcResult<()> {
        self.check_cap(Caps::SET_ITEM, "DELITEM")?;
        self.inner
            .client
            .request(
                self.spec(
                    Opcode::DelItem,
                    vec![key.into()],
                    Default::default(),
                    ReturnMode::Auto,
                ),
                CallOptions::default(),
            )
            .await
            .map(|_| ())
    }

    /// Number of elements in the remote value.
    pub async fn len(&self) -> RpcResult<u64> {
        self.check_cap(Caps::LEN, "LEN")?;
        let returned = self
            .inner
            .client
            .request(
                self.spec(
                    Opcode::Len,
                    Vec::new(),
                    Default::default(),
                    ReturnMode::Value,
                ),
                CallOptions::default(),
            )
            .await?;
        returned
            .value
            .as_i64()
            .map(|n| n as u64)
            .ok_or_else(|| RpcError::Protocol("LEN reply was not an integer".to_string()))
    }

    /// Structural comparison against a plain value.
    pub async fn compare(&self, op: CmpOp, other: Value) -> RpcResult<bool> {
        let required = match op {
            CmpOp::Eq | CmpOp::Ne => Caps::CMP_EQ,
            _ => Caps::CMP_ORD,
        };
        self.check_cap(required, "CMP")?;
        let returned = self
            .inner
            .client
            .request(
                self.spec(
                    Opcode::Cmp(op),
                    vec![other],
                    Default::default(),
                    ReturnMode::Value,
                ),
                CallOptions::default(),
            )
            .await?;
        returned
            .value
            .as_bool()
            .ok_or_else(|| RpcError::Protocol("CMP reply was not a boolean".to_string()))
    }

    /// Object id on the owning server, for identity checks.
    ///
    /// Only root handles carry an id; a path-derived handle names a place
    /// inside an object, not a registry entry.
    pub async fn obj_id(&self) -> RpcResult<u64> {
        if !self.inner.desc.is_root() {
            return Err(RpcError::UnsupportedOp(
                "GET_ID identifies root objects, not path-derived handles".to_string(),
            ));
        }
        let returned = self
            .inner
            .client
            .request(
                self.spec(
                    Opcode::GetId,
                    Vec::new(),
                    Default::default(),
                    ReturnMode::Value,
                ),
                CallOptions::default(),
            )
            .await?;
        returned
            .value
            .as_i64()
            .map(|n| n as u64)
            .ok_or_else(|| RpcError::Protocol("GET_ID reply was not an integer".to_string()))
    }

    fn spec(
        &self,
        op: Opcode,
        args: Vec<Value>,
        kwargs: crate::objects::Kwargs,
        return_mode: ReturnMode,
    ) -> crate::client::RequestSpec {
        crate::client::RequestSpec {
            op,
            target: self.inner.desc.object_id,
            path: self.inner.desc.path.clone(),
            args,
            kwargs,
            return_mode,
        }
    }
}

impl From<&ObjectProxy> for Value {
    fn from(proxy: &ObjectProxy) -> Self {
        proxy.to_value()
    }
}
