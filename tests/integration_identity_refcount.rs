//! Proxy identity and reference lifetime: one registry entry per remote
//! object, stable ids across access paths, and counts that drain to zero
//! once the last handle drops and the release batch flushes.

use anyhow::Result;
use objlink::{
    ClientOptions, CmpOp, ReleasePolicy, RpcClient, RpcServer, ServerOptions, ServiceFn,
    Value, ValueCell,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn sample_map() -> Value {
    let mut map = BTreeMap::new();
    map.insert("k".to_string(), Value::Int(7));
    Value::Map(map)
}

/// Importing the same name twice yields the same handle, the same object
/// id, and a single registry entry.
#[tokio::test]
async fn equal_descriptors_share_one_handle() -> Result<()> {
    let server = RpcServer::bind("tcp://127.0.0.1:0", ServerOptions::default()).await?;
    server.publish("data", Arc::new(ValueCell::new(sample_map())));

    let client = RpcClient::connect(server.addr(), ClientOptions::default()).await?;

    let first = client.import("data").await?;
    let second = client.import("data").await?;

    assert_eq!(first, second);
    assert_eq!(first.obj_id().await?, second.obj_id().await?);
    assert_eq!(server.registry_len(), 1);
    // Two imports, one live handle in the cache.
    assert_eq!(client.live_proxies(), 1);

    client.close().await;
    server.close().await;
    Ok(())
}

/// The refcount contribution of a client returns to zero after its last
/// handle drops and the coalesced release batch drains.
#[tokio::test]
async fn refcount_drains_after_drop() -> Result<()> {
    let server = RpcServer::bind("tcp://127.0.0.1:0", ServerOptions::default()).await?;
    server.publish("data", Arc::new(ValueCell::new(sample_map())));

    let client = RpcClient::connect(
        server.addr(),
        ClientOptions {
            release: ReleasePolicy::Coalesced {
                every: Duration::from_millis(20),
                max: 8,
            },
            ..Default::default()
        },
    )
    .await?;

    let data = client.import("data").await?;
    let id = data.descriptor().object_id;

    assert_eq!(server.refcount(id), Some(1));
    assert_eq!(server.contribution(id, client.peer_name()), 1);

    drop(data);
    // Give the release batch a flush window plus delivery time.
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(server.refcount(id), None);
    assert_eq!(server.registry_len(), 0);
    assert_eq!(client.live_proxies(), 0);

    client.close().await;
    server.close().await;
    Ok(())
}

/// Releases coalesce: many dropped handles drain in batches rather than
/// one notice per drop, and the count still reaches zero.
#[tokio::test]
async fn release_batching_coalesces() -> Result<()> {
    let server = RpcServer::bind("tcp://127.0.0.1:0", ServerOptions::default()).await?;
    for n in 0..12 {
        server.publish(
            &format!("cell-{n}"),
            Arc::new(ValueCell::new(Value::Int(n))),
        );
    }

    let client = RpcClient::connect(
        server.addr(),
        ClientOptions {
            release: ReleasePolicy::Coalesced {
                every: Duration::from_secs(3600),
                max: 4,
            },
            ..Default::default()
        },
    )
    .await?;

    let mut handles = Vec::new();
    for n in 0..12 {
        handles.push(client.import(&format!("cell-{n}")).await?);
    }
    assert_eq!(server.registry_len(), 12);

    // Dropping all handles crosses the batch limit three times; with the
    // timer effectively off, only the size trigger can flush.
    drop(handles);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.registry_len(), 0);

    client.close().await;
    server.close().await;
    Ok(())
}

/// Immediate release mode drains without any batching window.
#[tokio::test]
async fn immediate_release_mode() -> Result<()> {
    let server = RpcServer::bind("tcp://127.0.0.1:0", ServerOptions::default()).await?;
    server.publish("data", Arc::new(ValueCell::new(sample_map())));

    let client = RpcClient::connect(
        server.addr(),
        ClientOptions {
            release: ReleasePolicy::Immediate,
            ..Default::default()
        },
    )
    .await?;

    let data = client.import("data").await?;
    let id = data.descriptor().object_id;
    drop(data);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.refcount(id), None);

    client.close().await;
    server.close().await;
    Ok(())
}

/// Disconnecting a client releases its contributions without disturbing
/// other peers' references.
#[tokio::test]
async fn disconnect_releases_contributions() -> Result<()> {
    let server = RpcServer::bind("tcp://127.0.0.1:0", ServerOptions::default()).await?;
    server.publish("data", Arc::new(ValueCell::new(sample_map())));

    let holder = RpcClient::connect(server.addr(), ClientOptions::default()).await?;
    let holder_proxy = holder.import("data").await?;
    let id = holder_proxy.descriptor().object_id;

    let leaver = RpcClient::connect(
        server.addr(),
        ClientOptions {
            peer_name: Some("leaver".to_string()),
            ..Default::default()
        },
    )
    .await?;
    let leaver_proxy = leaver.import("data").await?;
    std::mem::forget(leaver_proxy);

    assert_eq!(server.refcount(id), Some(2));

    // The leaver goes away without releasing anything.
    leaver.close().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(server.refcount(id), Some(1));
    assert_eq!(server.contribution(id, "leaver"), 0);

    holder.close().await;
    server.close().await;
    Ok(())
}

/// Ids name registry entries: asking a path-derived handle for one is
/// refused on both sides of the wire.
#[tokio::test]
async fn obj_id_is_root_only() -> Result<()> {
    use objlink::client::{CallOptions, RequestSpec};
    use objlink::wire::{Opcode, ReturnMode};
    use objlink::{Kwargs, PathSegment, RpcError};

    let server = RpcServer::bind("tcp://127.0.0.1:0", ServerOptions::default()).await?;
    server.publish("data", Arc::new(ValueCell::new(sample_map())));

    let client = RpcClient::connect(server.addr(), ClientOptions::default()).await?;
    let data = client.import("data").await?;

    // The handle refuses locally, before any traffic.
    let before = server.requests_handled();
    match data.at("k").obj_id().await {
        Err(RpcError::UnsupportedOp(_)) => {}
        other => panic!("expected a local refusal, got {other:?}"),
    }
    assert_eq!(server.requests_handled() - before, 0);

    // A hand-built request with a path is refused by the server too.
    let err = client
        .request(
            RequestSpec {
                op: Opcode::GetId,
                target: data.descriptor().object_id,
                path: vec![PathSegment::Item(Value::from("k"))],
                args: Vec::new(),
                kwargs: Kwargs::new(),
                return_mode: ReturnMode::Value,
            },
            CallOptions::default(),
        )
        .await;
    match err {
        Err(RpcError::UnsupportedOp(_)) => {}
        other => panic!("expected a server refusal, got {other:?}"),
    }

    client.close().await;
    server.close().await;
    Ok(())
}

/// Comparison operators evaluate on the server against the hosted value.
#[tokio::test]
async fn remote_comparisons() -> Result<()> {
    let server = RpcServer::bind("tcp://127.0.0.1:0", ServerOptions::default()).await?;
    server.publish("n", Arc::new(ValueCell::new(Value::Int(10))));

    let client = RpcClient::connect(server.addr(), ClientOptions::default()).await?;
    let n = client.import("n").await?;

    assert!(n.compare(CmpOp::Eq, Value::Int(10)).await?);
    assert!(n.compare(CmpOp::Lt, Value::Int(11)).await?);
    assert!(!n.compare(CmpOp::Ge, Value::Int(11)).await?);

    client.close().await;
    server.close().await;
    Ok(())
}

/// A descriptor sent back to its home server resolves to the owned value
/// itself: invoking it goes straight to the object, with no nested wire
/// request.
#[tokio::test]
async fn home_decode_preserves_identity() -> Result<()> {
    use objlink::{CallCx, Caps, Kwargs, Outcome, RemoteObject};

    /// Calls its first argument with its remaining arguments.
    struct Invoke;

    #[async_trait::async_trait]
    impl RemoteObject for Invoke {
        fn type_name(&self) -> &str {
            "invoke"
        }
        fn caps(&self) -> Caps {
            Caps::CALL
        }
        async fn call(
            &self,
            cx: &mut CallCx<'_>,
            mut args: Vec<Value>,
            _kwargs: Kwargs,
        ) -> objlink::objects::OpResult {
            let callee = if args.is_empty() {
                Value::Null
            } else {
                args.remove(0)
            };
            let returned = cx
                .call_value(&callee, args, Kwargs::new())
                .await
                .map_err(objlink::objects::OpError::Raised)?;
            Ok(Outcome::Value(returned.value))
        }
    }

    let server = RpcServer::bind("tcp://127.0.0.1:0", ServerOptions::default()).await?;
    server.publish("invoke", Arc::new(Invoke));

    let hits = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let hits_inner = Arc::clone(&hits);
    server.publish(
        "counter",
        Arc::new(ServiceFn::new("counter", move |_args, _| {
            let n = hits_inner.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(Value::Int(n as i64 + 1))
        })),
    );

    let client = RpcClient::connect(server.addr(), ClientOptions::default()).await?;
    let invoke = client.import("invoke").await?;
    let counter = client.import("counter").await?;

    let before = server.requests_handled();
    let returned = invoke.call(vec![counter.to_value()]).await?;
    assert_eq!(returned.value, Value::Int(1));

    // The real counter ran, through the owned object, not through a proxy:
    // the server handled only the outer request.
    assert_eq!(hits.load(std::sync::atomic::Ordering::Relaxed), 1);
    assert_eq!(server.requests_handled() - before, 1);

    client.close().await;
    server.close().await;
    Ok(())
}
