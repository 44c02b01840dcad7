//! # Codec Policy
//!
//! The value tree serializes itself; what lives here is the policy applied
//! at the serialization boundary:
//!
//! - which return mode a reply is encoded under, and when `auto` flips a
//!   result from by-value to by-reference
//! - reference accounting for every descriptor that crosses the wire, so a
//!   transmitted proxy always carries exactly one transferred reference
//! - claiming on decode, turning received descriptors into live handles
//!
//! The accounting rules, applied uniformly on both sides:
//!
//! - a server encoding its own object increfs the entry for the destination
//!   peer before the frame leaves
//! - a client encoding a descriptor homed at its own local server increfs
//!   that registry directly, attributed to the destination address
//! - a descriptor travelling back to its home server transfers nothing; the
//!   home resolves it to the owned value instead of a proxy
//! - any other descriptor is a third-party forward: an `INCREF` notice names
//!   the new holder to the home server, fire-and-forget

use crate::client::RpcClient;
use crate::config::SerializerKind;
use crate::error::{RpcError, RpcResult};
use crate::objects::{Outcome, RemoteObject, ValueCell};
use crate::proxy::{ObjectProxy, ProxyDescriptor};
use crate::registry::ObjectRegistry;
use crate::value::Value;
use crate::wire::ReturnMode;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// A reference transfer that must be announced to a third-party home server.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardIncref {
    pub home: String,
    pub object_id: u64,
    pub holder: String,
}

/// Server-side encoding context for one reply.
pub struct ServerEncodeCx<'a> {
    /// Canonical address of the encoding server
    pub server_addr: &'a str,
    /// Registry owning this server's objects
    pub registry: &'a Mutex<ObjectRegistry>,
    /// Peer name of the reply's recipient
    pub dest_peer: &'a str,
    /// Byte size above which `auto` prefers by-reference
    pub threshold: usize,
    /// Negotiated serializer
    pub serializer: SerializerKind,
    /// Reference transfers to announce after encoding
    pub forwards: Vec<ForwardIncref>,
}

impl<'a> ServerEncodeCx<'a> {
    /// Register an object (idempotently) and hand the recipient one
    /// reference to it.
    fn register_by_ref(&mut self, obj: &Arc<dyn RemoteObject>) -> Value {
        let mut registry = self.registry.lock();
        let id = registry.own(obj);
        registry.incref(id, 1, self.dest_peer);
        let (type_name, caps) = registry.meta(id).expect("freshly owned entry");
        Value::ObjectRef(ProxyDescriptor {
            server_addr: self.server_addr.to_string(),
            object_id: id,
            type_name,
            caps,
            path: Vec::new(),
        })
    }

    /// Account for every descriptor already embedded in a plain value that
    /// is about to leave by value.
    fn account_embedded_refs(&mut self, value: &Value) {
        match value {
            Value::ObjectRef(desc) => {
                if desc.server_addr == self.server_addr {
                    self.registry
                        .lock()
                        .incref(desc.object_id, 1, self.dest_peer);
                } else {
                    self.forwards.push(ForwardIncref {
                        home: desc.server_addr.clone(),
                        object_id: desc.object_id,
                        holder: self.dest_peer.to_string(),
                    });
                }
            }
            Value::List(items) => items.iter().for_each(|v| self.account_embedded_refs(v)),
            Value::Map(map) => map.values().for_each(|v| self.account_embedded_refs(v)),
            _ => {}
        }
    }
}

fn arrays_allowed(kind: SerializerKind) -> bool {
    matches!(kind, SerializerKind::CompactArrays)
}

fn contains_array(value: &Value) -> bool {
    match value {
        Value::Array(_) => true,
        Value::List(items) => items.iter().any(contains_array),
        Value::Map(map) => map.values().any(contains_array),
        _ => false,
    }
}

/// Encode an operation outcome under the requested return mode.
///
/// `Value` forces a deep copy and fails with `UNSERIALIZABLE` when the
/// outcome holds references. `Proxy` forces by-reference, wrapping plain
/// data in a hosted cell. `Auto` copies small plain data and proxies
/// everything else.
pub fn encode_outcome(
    outcome: Outcome,
    return_mode: ReturnMode,
    cx: &mut ServerEncodeCx<'_>,
) -> RpcResult<Value> {
    match outcome {
        Outcome::ByRef(obj) => match return_mode {
            ReturnMode::Value => {
                let copied = obj.snapshot().ok_or_else(|| {
                    RpcError::Unserializable(format!(
                        "{} cannot be copied by value",
                        obj.type_name()
                    ))
                })?;
                encode_plain_value(copied, ReturnMode::Value, cx)
            }
            ReturnMode::Proxy | ReturnMode::Auto => Ok(cx.register_by_ref(&obj)),
        },
        Outcome::Value(value) => encode_plain_value(value, return_mode, cx),
    }
}

fn encode_plain_value(
    value: Value,
    return_mode: ReturnMode,
    cx: &mut ServerEncodeCx<'_>,
) -> RpcResult<Value> {
    match return_mode {
        ReturnMode::Value => {
            if value.contains_object_ref() {
                return Err(RpcError::Unserializable(
                    "value contains object references".to_string(),
                ));
            }
            if contains_array(&value) && !arrays_allowed(cx.serializer) {
                return Err(RpcError::Unserializable(
                    "packed arrays need the array serializer".to_string(),
                ));
            }
            Ok(value)
        }
        ReturnMode::Proxy => {
            let cell: Arc<dyn RemoteObject> = Arc::new(ValueCell::new(value));
            Ok(cx.register_by_ref(&cell))
        }
        ReturnMode::Auto => {
            // Arrays without the negotiated plug-in go by reference.
            if contains_array(&value) && !arrays_allowed(cx.serializer) {
                debug!("auto mode: array without plug-in goes by reference");
                let cell: Arc<dyn RemoteObject> = Arc::new(ValueCell::new(value));
                return Ok(cx.register_by_ref(&cell));
            }

            let encoded_size = bincode::serialized_size(&value).unwrap_or(u64::MAX);
            if encoded_size > cx.threshold as u64 {
                debug!(
                    encoded_size,
                    threshold = cx.threshold,
                    "auto mode: large value goes by reference"
                );
                let cell: Arc<dyn RemoteObject> = Arc::new(ValueCell::new(value));
                return Ok(cx.register_by_ref(&cell));
            }

            cx.account_embedded_refs(&value);
            Ok(value)
        }
    }
}

/// Client-side argument encoding: account for every descriptor leaving this
/// process.
///
/// `dest_addr` is the server the request goes to, `local_server` the address
/// and registry of this process's local server when it has one.
pub fn account_outgoing_args(
    values: &[Value],
    dest_addr: &str,
    local_server: Option<(&str, &Mutex<ObjectRegistry>)>,
    forwards: &mut Vec<ForwardIncref>,
) {
    for value in values {
        account_outgoing_value(value, dest_addr, local_server, forwards);
    }
}

fn account_outgoing_value(
    value: &Value,
    dest_addr: &str,
    local_server: Option<(&str, &Mutex<ObjectRegistry>)>,
    forwards: &mut Vec<ForwardIncref>,
) {
    match value {
        Value::ObjectRef(desc) => {
            if desc.server_addr == dest_addr {
                // Going home: the owner resolves it to the owned value, no
                // reference changes hands.
                return;
            }
            if let Some((local_addr, registry)) = local_server {
                if desc.server_addr == local_addr {
                    registry.lock().incref(desc.object_id, 1, dest_addr);
                    return;
                }
            }
            forwards.push(ForwardIncref {
                home: desc.server_addr.clone(),
                object_id: desc.object_id,
                holder: dest_addr.to_string(),
            });
        }
        Value::List(items) => {
            for item in items {
                account_outgoing_value(item, dest_addr, local_server, forwards);
            }
        }
        Value::Map(map) => {
            for item in map.values() {
                account_outgoing_value(item, dest_addr, local_server, forwards);
            }
        }
        _ => {}
    }
}

/// Claim every descriptor embedded in a decoded payload, yielding live
/// handles in tree order.
///
/// Descriptors homed at `client`'s server resolve through it; anything else
/// resolves through the process client for its home address, created
/// lazily. Claiming must happen even when the payload ends up discarded,
/// otherwise the reference the sender transferred would leak.
pub async fn claim_embedded(
    value: &Value,
    client: &Arc<RpcClient>,
) -> RpcResult<Vec<ObjectProxy>> {
    let mut proxies = Vec::new();
    claim_embedded_inner(value, client, &mut proxies).await?;
    Ok(proxies)
}

async fn claim_embedded_inner(
    value: &Value,
    client: &Arc<RpcClient>,
    proxies: &mut Vec<ObjectProxy>,
) -> RpcResult<()> {
    // Depth-first, left to right, so handle order matches reading order.
    let mut stack = vec![value];
    while let Some(node) = stack.pop() {
        match node {
            Value::ObjectRef(desc) => {
                let proxy = if desc.server_addr == client.addr() {
                    client.claim_proxy(desc.clone(), true)
                } else {
                    let home = crate::local::client_to(&desc.server_addr).await?;
                    home.claim_proxy(desc.clone(), true)
                };
                proxies.push(proxy);
            }
            Value::List(items) => stack.extend(items.iter().rev()),
            Value::Map(map) => stack.extend(map.values().rev()),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::Caps;
    use crate::objects::ServiceFn;
    use std::collections::BTreeMap;

    fn encode_cx<'a>(
        registry: &'a Mutex<ObjectRegistry>,
        threshold: usize,
    ) -> ServerEncodeCx<'a> {
        ServerEncodeCx {
            server_addr: "tcp://127.0.0.1:9000",
            registry,
            dest_peer: "client-test",
            threshold,
            serializer: SerializerKind::Compact,
            forwards: Vec::new(),
        }
    }

    #[test]
    fn auto_copies_small_values() {
        let registry = Mutex::new(ObjectRegistry::new());
        let mut cx = encode_cx(&registry, 1024);

        let encoded =
            encode_outcome(Outcome::Value(Value::Int(5)), ReturnMode::Auto, &mut cx).unwrap();
        assert_eq!(encoded, Value::Int(5));
        assert!(registry.lock().is_empty());
    }

    #[test]
    fn auto_proxies_large_values() {
        let registry = Mutex::new(ObjectRegistry::new());
        let mut cx = encode_cx(&registry, 64);

        let big = Value::Bytes(vec![0u8; 4096]);
        let encoded = encode_outcome(Outcome::Value(big), ReturnMode::Auto, &mut cx).unwrap();
        let desc = encoded.as_object_ref().expect("large value must proxy");
        assert_eq!(desc.server_addr, "tcp://127.0.0.1:9000");
        assert!(desc.caps.contains(Caps::GET_ITEM));
        assert_eq!(registry.lock().refcount(desc.object_id), Some(1));
        assert_eq!(
            registry.lock().contribution(desc.object_id, "client-test"),
            1
        );
    }

    #[test]
    fn by_ref_outcome_registers_once_per_object() {
        let registry = Mutex::new(ObjectRegistry::new());
        let mut cx = encode_cx(&registry, 1024);

        let obj: Arc<dyn RemoteObject> =
            Arc::new(ServiceFn::new("noop", |_args, _kwargs| Ok(Value::Null)));

        let first = encode_outcome(
            Outcome::ByRef(Arc::clone(&obj)),
            ReturnMode::Auto,
            &mut cx,
        )
        .unwrap();
        let second = encode_outcome(Outcome::ByRef(obj), ReturnMode::Proxy, &mut cx).unwrap();

        let id_a = first.as_object_ref().unwrap().object_id;
        let id_b = second.as_object_ref().unwrap().object_id;
        assert_eq!(id_a, id_b);
        // Two transmissions, two references for the recipient.
        assert_eq!(registry.lock().refcount(id_a), Some(2));
    }

    #[test]
    fn value_mode_rejects_uncopyable() {
        let registry = Mutex::new(ObjectRegistry::new());
        let mut cx = encode_cx(&registry, 1024);

        // Functions have no snapshot.
        let obj: Arc<dyn RemoteObject> =
            Arc::new(ServiceFn::new("noop", |_args, _kwargs| Ok(Value::Null)));
        let err = encode_outcome(Outcome::ByRef(obj), ReturnMode::Value, &mut cx).unwrap_err();
        assert!(matches!(err, RpcError::Unserializable(_)));

        // Embedded references cannot be deep-copied either.
        let desc = ProxyDescriptor {
            server_addr: "tcp://10.0.0.9:1".to_string(),
            object_id: 3,
            type_name: "value".to_string(),
            caps: Caps::empty(),
            path: Vec::new(),
        };
        let holding_ref = Value::List(vec![Value::ObjectRef(desc)]);
        let err =
            encode_outcome(Outcome::Value(holding_ref), ReturnMode::Value, &mut cx).unwrap_err();
        assert!(matches!(err, RpcError::Unserializable(_)));
    }

    #[test]
    fn auto_accounts_embedded_refs() {
        let registry = Mutex::new(ObjectRegistry::new());

        // Register a local object so the reply can embed its descriptor.
        let obj: Arc<dyn RemoteObject> =
            Arc::new(ServiceFn::new("cb", |_args, _kwargs| Ok(Value::Null)));
        let id = registry.lock().own(&obj);

        let local_desc = ProxyDescriptor {
            server_addr: "tcp://127.0.0.1:9000".to_string(),
            object_id: id,
            type_name: "function".to_string(),
            caps: Caps::CALL,
            path: Vec::new(),
        };
        let foreign_desc = ProxyDescriptor {
            server_addr: "tcp://10.1.1.1:7".to_string(),
            object_id: 42,
            type_name: "value".to_string(),
            caps: Caps::empty(),
            path: Vec::new(),
        };

        let mut cx = encode_cx(&registry, 1024);
        let payload = Value::List(vec![
            Value::ObjectRef(local_desc),
            Value::ObjectRef(foreign_desc),
        ]);
        encode_outcome(Outcome::Value(payload), ReturnMode::Auto, &mut cx).unwrap();

        // Local descriptor: counted directly for the recipient.
        assert_eq!(registry.lock().contribution(id, "client-test"), 1);
        // Foreign descriptor: announced to its home.
        assert_eq!(
            cx.forwards,
            vec![ForwardIncref {
                home: "tcp://10.1.1.1:7".to_string(),
                object_id: 42,
                holder: "client-test".to_string(),
            }]
        );
    }

    #[test]
    fn outgoing_args_accounting() {
        let registry = Mutex::new(ObjectRegistry::new());
        let obj: Arc<dyn RemoteObject> =
            Arc::new(ServiceFn::new("cb", |_args, _kwargs| Ok(Value::Null)));
        let id = registry.lock().own(&obj);

        let local = Value::ObjectRef(ProxyDescriptor {
            server_addr: "inproc://local".to_string(),
            object_id: id,
            type_name: "function".to_string(),
            caps: Caps::CALL,
            path: Vec::new(),
        });
        let homeward = Value::ObjectRef(ProxyDescriptor {
            server_addr: "tcp://127.0.0.1:9000".to_string(),
            object_id: 8,
            type_name: "value".to_string(),
            caps: Caps::empty(),
            path: Vec::new(),
        });
        let third_party = Value::ObjectRef(ProxyDescriptor {
            server_addr: "tcp://10.2.2.2:7".to_string(),
            object_id: 5,
            type_name: "value".to_string(),
            caps: Caps::empty(),
            path: Vec::new(),
        });

        let mut forwards = Vec::new();
        let args = vec![Value::List(vec![local, homeward, third_party])];
        account_outgoing_args(
            &args,
            "tcp://127.0.0.1:9000",
            Some(("inproc://local", &registry)),
            &mut forwards,
        );

        // Local callback: counted in the local registry for the destination.
        assert_eq!(
            registry.lock().contribution(id, "tcp://127.0.0.1:9000"),
            1
        );
        // Homeward descriptor: nothing transferred.
        // Third party: one forward notice.
        assert_eq!(forwards.len(), 1);
        assert_eq!(forwards[0].object_id, 5);
        assert_eq!(forwards[0].holder, "tcp://127.0.0.1:9000");
    }

    #[test]
    fn value_mode_passes_plain_trees() {
        let registry = Mutex::new(ObjectRegistry::new());
        let mut cx = encode_cx(&registry, 16);

        let mut map = BTreeMap::new();
        map.insert("k".to_string(), Value::from("plain data, any size"));
        let tree = Value::Map(map);

        // VALUE ignores the auto threshold; it either copies or fails.
        let encoded =
            encode_outcome(Outcome::Value(tree.clone()), ReturnMode::Value, &mut cx).unwrap();
        assert_eq!(encoded, tree);
    }
}
