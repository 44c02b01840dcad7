//! Lazy attribute and item chains: composing a path never touches the
//! network, only the terminal operation does.

use anyhow::Result;
use objlink::{ClientOptions, RpcClient, RpcServer, ServerOptions, Value, ValueCell};
use std::collections::BTreeMap;
use std::sync::Arc;

fn nested_mapping() -> Value {
    let mut inner = BTreeMap::new();
    inner.insert("k2".to_string(), Value::Int(99));
    inner.insert("other".to_string(), Value::from("x"));

    let mut outer = BTreeMap::new();
    outer.insert("k".to_string(), Value::Map(inner));
    for n in 0..50 {
        outer.insert(format!("filler-{n}"), Value::Int(n));
    }
    Value::Map(outer)
}

/// Chained item access costs exactly one round trip, at the terminal
/// access, not one per level.
#[tokio::test]
async fn chained_item_access_is_one_round_trip() -> Result<()> {
    let server = RpcServer::bind("tcp://127.0.0.1:0", ServerOptions::default()).await?;
    server.publish("data", Arc::new(ValueCell::new(nested_mapping())));

    let client = RpcClient::connect(server.addr(), ClientOptions::default()).await?;
    let data = client.import("data").await?;

    let len_before = server.requests_handled();
    assert_eq!(data.len().await?, 51);
    assert_eq!(server.requests_handled() - len_before, 1);

    let before = server.requests_handled();
    let returned = data.at("k").get_item("k2").await?;
    assert_eq!(returned.value, Value::Int(99));
    assert_eq!(server.requests_handled() - before, 1);

    client.close().await;
    server.close().await;
    Ok(())
}

/// Deriving handles composes descriptors locally; `get` is the explicit
/// materialization point.
#[tokio::test]
async fn derived_handles_materialize_on_get() -> Result<()> {
    let server = RpcServer::bind("tcp://127.0.0.1:0", ServerOptions::default()).await?;
    server.publish("data", Arc::new(ValueCell::new(nested_mapping())));

    let client = RpcClient::connect(server.addr(), ClientOptions::default()).await?;
    let data = client.import("data").await?;

    let before = server.requests_handled();
    let deep = data.at("k").at("k2");
    // Composition alone sent nothing.
    assert_eq!(server.requests_handled() - before, 0);
    assert_eq!(deep.descriptor().path.len(), 2);

    let returned = deep.get().await?;
    assert_eq!(returned.value, Value::Int(99));
    assert_eq!(server.requests_handled() - before, 1);

    // Attribute access on a hosted mapping reads the same-named key.
    let via_attr = data.attr("k").get_item("k2").await?;
    assert_eq!(via_attr.value, Value::Int(99));

    client.close().await;
    server.close().await;
    Ok(())
}

/// Looking up a missing member reports a structural error from the server,
/// after the single terminal round trip.
#[tokio::test]
async fn missing_member_reports_lookup_error() -> Result<()> {
    let server = RpcServer::bind("tcp://127.0.0.1:0", ServerOptions::default()).await?;
    server.publish("data", Arc::new(ValueCell::new(nested_mapping())));

    let client = RpcClient::connect(server.addr(), ClientOptions::default()).await?;
    let data = client.import("data").await?;

    let result = data.at("k").get_item("nope").await;
    match result {
        Err(objlink::RpcError::Remote(remote)) => {
            assert_eq!(remote.type_name, "LookupError");
        }
        other => panic!("expected a lookup error, got {other:?}"),
    }

    client.close().await;
    server.close().await;
    Ok(())
}

/// Writes through a root proxy mutate the hosted value in place.
#[tokio::test]
async fn set_and_delete_items() -> Result<()> {
    let server = RpcServer::bind("tcp://127.0.0.1:0", ServerOptions::default()).await?;
    let mut map = BTreeMap::new();
    map.insert("a".to_string(), Value::Int(1));
    server.publish("kv", Arc::new(ValueCell::new(Value::Map(map))));

    let client = RpcClient::connect(server.addr(), ClientOptions::default()).await?;
    let kv = client.import("kv").await?;

    kv.set_item("b", Value::Int(2)).await?;
    assert_eq!(kv.len().await?, 2);
    assert_eq!(kv.get_item("b").await?.value, Value::Int(2));

    kv.del_item("a").await?;
    assert_eq!(kv.len().await?, 1);

    client.close().await;
    server.close().await;
    Ok(())
}
