//! # Hosted Objects
//!
//! A server hosts values behind the [`RemoteObject`] trait. The trait mirrors
//! the fixed opcode table: calls, attribute and item access, length,
//! comparison, plus `snapshot` for forced deep copies. Operations an object
//! does not implement answer `UNSUPPORTED_OP`, and each object reports a
//! [`Caps`] bitmap so descriptors can tell the holder what its proxy can do
//! without a follow-up round trip.
//!
//! Objects use interior mutability; the server serializes all operation
//! execution, so a plain lock never contends with other requests on the same
//! server.
//!
//! Two adapters cover the common cases: [`ServiceFn`] lifts a closure into a
//! callable object and [`ValueCell`] hosts a value tree by reference.

use crate::server::CallCx;
use crate::value::Value;
use crate::wire::CmpOp;
use async_trait::async_trait;
use bitflags::bitflags;
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Keyword arguments of a call.
pub type Kwargs = BTreeMap<String, Value>;

bitflags! {
    /// Polymorphic operations a hosted object supports.
    ///
    /// `ITER`, `CONTEXT` and `BUFFER` travel in descriptors for fidelity but
    /// have no opcode; they describe object shape, not invokable surface.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u16 {
        const CALL     = 1 << 0;
        const GET_ITEM = 1 << 1;
        const SET_ITEM = 1 << 2;
        const ITER     = 1 << 3;
        const LEN      = 1 << 4;
        const CMP_EQ   = 1 << 5;
        const CMP_ORD  = 1 << 6;
        const GET_ATTR = 1 << 7;
        const CONTEXT  = 1 << 8;
        const BUFFER   = 1 << 9;
    }
}

impl Serialize for Caps {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.bits())
    }
}

impl<'de> Deserialize<'de> for Caps {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Caps::from_bits_truncate(u16::deserialize(deserializer)?))
    }
}

/// Failure of a single object operation.
#[derive(Debug, Error)]
pub enum OpError {
    /// The object does not implement this operation
    #[error("operation not supported")]
    Unsupported,
    /// The operation ran and failed; the chain crosses the wire as a
    /// structured remote error record
    #[error(transparent)]
    Raised(#[from] anyhow::Error),
}

/// What an operation produced.
pub enum Outcome {
    /// Plain data, eligible for by-value return
    Value(Value),
    /// Another hosted object, returned by reference
    ByRef(Arc<dyn RemoteObject>),
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Outcome::ByRef(obj) => f.debug_tuple("ByRef").field(&obj.type_name()).finish(),
        }
    }
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Outcome::Value(value)
    }
}

/// Result of a single object operation.
pub type OpResult = Result<Outcome, OpError>;

/// A value hosted on a server and addressable by remote proxies.
///
/// Only `call` is async: it may invoke proxy arguments through its
/// [`CallCx`], which is where nested remote traffic and reentrancy happen.
/// Everything else is a plain synchronous accessor.
#[async_trait]
pub trait RemoteObject: Send + Sync {
    /// Human-readable type label carried in descriptors.
    fn type_name(&self) -> &str {
        "object"
    }

    /// Operations this object supports.
    fn caps(&self) -> Caps;

    /// Invoke the object with positional and keyword arguments.
    async fn call(&self, cx: &mut CallCx<'_>, args: Vec<Value>, kwargs: Kwargs) -> OpResult {
        let _ = (cx, args, kwargs);
        Err(OpError::Unsupported)
    }

    /// Fetch a named member.
    fn get_attr(&self, name: &str) -> OpResult {
        let _ = name;
        Err(OpError::Unsupported)
    }

    /// Assign a named member.
    fn set_attr(&self, name: &str, value: Value) -> OpResult {
        let _ = (name, value);
        Err(OpError::Unsupported)
    }

    /// Container read access.
    fn get_item(&self, key: &Value) -> OpResult {
        let _ = key;
        Err(OpError::Unsupported)
    }

    /// Container write access.
    fn set_item(&self, key: &Value, value: Value) -> OpResult {
        let _ = (key, value);
        Err(OpError::Unsupported)
    }

    /// Container deletion.
    fn del_item(&self, key: &Value) -> OpResult {
        let _ = key;
        Err(OpError::Unsupported)
    }

    /// Number of contained elements.
    fn len(&self) -> OpResult {
        Err(OpError::Unsupported)
    }

    /// Structural comparison against a plain value.
    fn compare(&self, op: CmpOp, other: &Value) -> OpResult {
        let _ = (op, other);
        Err(OpError::Unsupported)
    }

    /// Deep copy for forced by-value returns. `None` means the object cannot
    /// be copied and `UNSERIALIZABLE` is reported instead.
    fn snapshot(&self) -> Option<Value> {
        None
    }
}

type SyncHandler = dyn Fn(Vec<Value>, Kwargs) -> anyhow::Result<Value> + Send + Sync;
type BoxedCallFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;
type AsyncHandler = dyn Fn(Vec<Value>, Kwargs) -> BoxedCallFuture + Send + Sync;

enum Handler {
    Sync(Box<SyncHandler>),
    Async(Box<AsyncHandler>),
}

/// A closure hosted as a callable object.
pub struct ServiceFn {
    name: String,
    handler: Handler,
}

impl ServiceFn {
    /// Host a synchronous closure.
    pub fn new<F>(name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>, Kwargs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            handler: Handler::Sync(Box::new(f)),
        }
    }

    /// Host an async closure. The returned future runs on the server's
    /// dispatch loop, serialized with every other operation.
    pub fn new_async<F, Fut>(name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>, Kwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            handler: Handler::Async(Box::new(move |args, kwargs| Box::pin(f(args, kwargs)))),
        }
    }

    /// Name this function was created with.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl RemoteObject for ServiceFn {
    fn type_name(&self) -> &str {
        "function"
    }

    fn caps(&self) -> Caps {
        Caps::CALL
    }

    async fn call(&self, _cx: &mut CallCx<'_>, args: Vec<Value>, kwargs: Kwargs) -> OpResult {
        let result = match &self.handler {
            Handler::Sync(f) => f(args, kwargs),
            Handler::Async(f) => f(args, kwargs).await,
        };
        result.map(Outcome::Value).map_err(OpError::Raised)
    }
}

/// A value tree hosted by reference.
///
/// Useful for large mappings and lists that should stay on the server while
/// remote peers index into them through proxies.
pub struct ValueCell {
    inner: RwLock<Value>,
}

impl ValueCell {
    pub fn new(value: Value) -> Self {
        Self {
            inner: RwLock::new(value),
        }
    }

    /// Copy of the current contents.
    pub fn value(&self) -> Value {
        self.inner.read().clone()
    }
}

#[async_trait]
impl RemoteObject for ValueCell {
    fn type_name(&self) -> &str {
        "value"
    }

    fn caps(&self) -> Caps {
        let base = Caps::GET_ITEM | Caps::SET_ITEM | Caps::LEN | Caps::CMP_EQ | Caps::GET_ATTR;
        match &*self.inner.read() {
            Value::List(_) | Value::Map(_) => base | Caps::ITER,
            Value::Int(_) | Value::Float(_) | Value::Str(_) => base | Caps::CMP_ORD,
            _ => base,
        }
    }

    fn get_attr(&self, name: &str) -> OpResult {
        // Attribute access on a hosted mapping reads the same-named key.
        match self.inner.read().item(&Value::from(name)) {
            Some(found) => Ok(Outcome::Value(found.clone())),
            None => Err(OpError::Raised(anyhow::anyhow!(
                "no attribute or key {name:?}"
            ))),
        }
    }

    fn get_item(&self, key: &Value) -> OpResult {
        match self.inner.read().item(key) {
            Some(found) => Ok(Outcome::Value(found.clone())),
            None => Err(OpError::Raised(anyhow::anyhow!(
                "no item {:?}",
                key.kind_name()
            ))),
        }
    }

    fn set_item(&self, key: &Value, value: Value) -> OpResult {
        let mut guard = self.inner.write();
        match (&mut *guard, key) {
            (Value::Map(map), Value::Str(k)) => {
                map.insert(k.clone(), value);
                Ok(Outcome::Value(Value::Null))
            }
            (Value::List(items), Value::Int(i)) if *i >= 0 && (*i as usize) < items.len() => {
                items[*i as usize] = value;
                Ok(Outcome::Value(Value::Null))
            }
            _ => Err(OpError::Raised(anyhow::anyhow!(
                "cannot assign item on {}",
                guard.kind_name()
            ))),
        }
    }

    fn del_item(&self, key: &Value) -> OpResult {
        let mut guard = self.inner.write();
        match (&mut *guard, key) {
            (Value::Map(map), Value::Str(k)) => {
                if map.remove(k).is_some() {
                    Ok(Outcome::Value(Value::Null))
                } else {
                    Err(OpError::Raised(anyhow::anyhow!("no key {k:?}")))
                }
            }
            (Value::List(items), Value::Int(i)) if *i >= 0 && (*i as usize) < items.len() => {
                items.remove(*i as usize);
                Ok(Outcome::Value(Value::Null))
            }
            _ => Err(OpError::Raised(anyhow::anyhow!(
                "cannot delete item on {}",
                guard.kind_name()
            ))),
        }
    }

    fn len(&self) -> OpResult {
        match self.inner.read().len_of() {
            Some(n) => Ok(Outcome::Value(Value::Int(n as i64))),
            None => Err(OpError::Unsupported),
        }
    }

    fn compare(&self, op: CmpOp, other: &Value) -> OpResult {
        match self.inner.read().compare(op, other) {
            Some(answer) => Ok(Outcome::Value(Value::Bool(answer))),
            None => Err(OpError::Unsupported),
        }
    }

    fn snapshot(&self) -> Option<Value> {
        Some(self.inner.read().clone())
    }
}
