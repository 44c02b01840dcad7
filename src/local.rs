//! # Process-Global State
//!
//! Two pieces of state are process-wide by design: the registry of live
//! clients keyed by remote address, and the optional local server handle.
//! Both are created lazily and torn down at process exit (or explicitly via
//! [`close_all`]).
//!
//! The local server is what gives this process's values a home address.
//! Passing a callback or a large object by reference requires one; without
//! it, [`host`] refuses with `NO_LOCAL_SERVER` and values can only travel
//! by copy.

use crate::client::RpcClient;
use crate::codec::ForwardIncref;
use crate::config::{ClientOptions, ServerOptions};
use crate::error::{RpcError, RpcResult};
use crate::objects::RemoteObject;
use crate::proxy::ObjectProxy;
use crate::registry::ObjectRegistry;
use crate::server::RpcServer;
use crate::wire::Notice;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

lazy_static! {
    // Live clients by remote address. Connecting is serialized through an
    // async lock so concurrent lookups of the same address share one
    // session.
    static ref CLIENTS: tokio::sync::Mutex<HashMap<String, Arc<RpcClient>>> =
        tokio::sync::Mutex::new(HashMap::new());

    static ref LOCAL_SERVER: Mutex<Option<Arc<RpcServer>>> = Mutex::new(None);

    // Registries of every server living in this process, keyed by address.
    // Clients use this to incref locally-homed descriptors they send out.
    static ref SERVERS: Mutex<HashMap<String, Arc<Mutex<ObjectRegistry>>>> =
        Mutex::new(HashMap::new());

    // Identity announced by clients of a process that has no local server.
    static ref PROCESS_TOKEN: String = format!("client-{}", Uuid::new_v4());
}

/// Peer name a plain client announces: the local server's address when the
/// process has one, otherwise a stable unique token.
pub fn default_peer_name() -> String {
    match &*LOCAL_SERVER.lock() {
        Some(server) => server.addr().to_string(),
        None => PROCESS_TOKEN.clone(),
    }
}

/// The client for a remote address, connected on first use.
pub async fn client_to(addr: &str) -> RpcResult<Arc<RpcClient>> {
    let mut clients = CLIENTS.lock().await;
    if let Some(existing) = clients.get(addr) {
        return Ok(Arc::clone(existing));
    }

    let client = RpcClient::connect(addr, ClientOptions::default()).await?;
    clients.insert(addr.to_string(), Arc::clone(&client));
    if client.addr() != addr {
        clients.insert(client.addr().to_string(), Arc::clone(&client));
    }
    debug!(addr = %client.addr(), "process client created");
    Ok(client)
}

/// Drop a dead client from the registry so the next lookup reconnects.
pub(crate) fn forget_client(addr: &str) {
    let addr = addr.to_string();
    tokio::spawn(async move {
        CLIENTS.lock().await.remove(&addr);
    });
}

/// Bind a server and install it as this process's local server.
pub async fn serve_local(addr: &str, opts: ServerOptions) -> RpcResult<Arc<RpcServer>> {
    let server = RpcServer::bind(addr, opts).await?;
    set_local_server(&server);
    Ok(server)
}

/// Install an already-bound server as the process local server.
pub fn set_local_server(server: &Arc<RpcServer>) {
    debug!(addr = %server.addr(), "local server installed");
    *LOCAL_SERVER.lock() = Some(Arc::clone(server));
}

/// The process local server, when one is installed.
pub fn local_server() -> Option<Arc<RpcServer>> {
    LOCAL_SERVER.lock().clone()
}

/// Give a local value a home on the local server and return its proxy.
///
/// The proxy travels as an argument like any other value; the remote side
/// receives a reference back into this process. Refuses with
/// `NO_LOCAL_SERVER` when the process has no server to host the value.
pub async fn host(obj: Arc<dyn RemoteObject>) -> RpcResult<ObjectProxy> {
    let server = local_server().ok_or(RpcError::NoLocalServer)?;
    let client = client_to(server.addr()).await?;
    let desc = server.host_object(&obj, client.peer_name());
    Ok(client.claim_proxy(desc, true))
}

/// Announce a forwarded reference to its home server, fire-and-forget.
pub(crate) fn send_incref(forward: ForwardIncref) {
    tokio::spawn(async move {
        match client_to(&forward.home).await {
            Ok(client) => {
                client.send_notice(Notice::Incref {
                    id: forward.object_id,
                    n: 1,
                    holder: forward.holder,
                });
            }
            Err(err) => {
                warn!(home = %forward.home, error = %err, "cannot announce forwarded reference");
            }
        }
    });
}

pub(crate) fn register_server(addr: &str, registry: Arc<Mutex<ObjectRegistry>>) {
    SERVERS.lock().insert(addr.to_string(), registry);
}

pub(crate) fn unregister_server(addr: &str) {
    SERVERS.lock().remove(addr);
    let mut local = LOCAL_SERVER.lock();
    if local.as_ref().map(|s| s.addr()) == Some(addr) {
        *local = None;
    }
}

/// Registry of the in-process server with the given address, when any.
pub(crate) fn registry_of(addr: &str) -> Option<Arc<Mutex<ObjectRegistry>>> {
    SERVERS.lock().get(addr).cloned()
}

/// Close every process-global client and the local server. Meant for
/// orderly shutdown at the end of a process's life.
pub async fn close_all() {
    let clients: Vec<Arc<RpcClient>> = CLIENTS.lock().await.drain().map(|(_, c)| c).collect();
    for client in clients {
        client.close().await;
    }
    let server = LOCAL_SERVER.lock().take();
    if let Some(server) = server {
        server.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_token_is_stable() {
        let a = PROCESS_TOKEN.clone();
        let b = PROCESS_TOKEN.clone();
        assert_eq!(a, b);
        assert!(a.starts_with("client-"));
    }
}
