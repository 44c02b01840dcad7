use anyhow::Result;
use objlink::{
    ClientOptions, RpcClient, RpcError, RpcServer, ServerOptions, ServiceFn, Value,
};
use std::sync::Arc;

/// Verify the basic request/reply cycle end-to-end over TCP: publish a
/// function, import it from a client, call it synchronously.
#[tokio::test]
async fn tcp_call_round_trip() -> Result<()> {
    let server = RpcServer::bind("tcp://127.0.0.1:0", ServerOptions::default()).await?;
    server.publish(
        "calc",
        Arc::new(ServiceFn::new("add", |args, _kwargs| {
            let a = args
                .first()
                .and_then(Value::as_i64)
                .ok_or_else(|| anyhow::anyhow!("missing first addend"))?;
            let b = args
                .get(1)
                .and_then(Value::as_i64)
                .ok_or_else(|| anyhow::anyhow!("missing second addend"))?;
            Ok(Value::Int(a + b))
        })),
    );

    let client = RpcClient::connect(server.addr(), ClientOptions::default()).await?;
    client.ping().await?;

    let add = client.import("calc").await?;
    let returned = add.call(vec![Value::Int(2), Value::Int(3)]).await?;
    assert_eq!(returned.value, Value::Int(5));

    client.close().await;
    server.close().await;
    Ok(())
}

/// The same cycle over the in-process pipe transport.
#[tokio::test]
async fn inproc_call_round_trip() -> Result<()> {
    let server = RpcServer::bind("inproc://round-trip", ServerOptions::default()).await?;
    server.publish(
        "echo",
        Arc::new(ServiceFn::new("echo", |mut args, _kwargs| {
            Ok(args.pop().unwrap_or(Value::Null))
        })),
    );

    let client = RpcClient::connect("inproc://round-trip", ClientOptions::default()).await?;
    let echo = client.import("echo").await?;

    let returned = echo.call(vec![Value::from("hello")]).await?;
    assert_eq!(returned.value, Value::from("hello"));

    client.close().await;
    server.close().await;
    Ok(())
}

/// The CALL builtin invokes a published name directly: no import, no
/// proxy, one round trip.
#[tokio::test]
async fn call_builtin_invokes_published_name() -> Result<()> {
    let server = RpcServer::bind("tcp://127.0.0.1:0", ServerOptions::default()).await?;
    server.publish(
        "calc",
        Arc::new(ServiceFn::new("add", |args, _kwargs| {
            let a = args.first().and_then(Value::as_i64).unwrap_or(0);
            let b = args.get(1).and_then(Value::as_i64).unwrap_or(0);
            Ok(Value::Int(a + b))
        })),
    );

    let client = RpcClient::connect(server.addr(), ClientOptions::default()).await?;

    let before = server.requests_handled();
    let returned = client
        .call_published("calc", vec![Value::Int(2), Value::Int(3)])
        .await?;
    assert_eq!(returned.value, Value::Int(5));
    assert_eq!(server.requests_handled() - before, 1);

    // An unknown name fails the same way a failed import does.
    match client.call_published("missing", Vec::new()).await {
        Err(RpcError::Remote(remote)) => assert_eq!(remote.type_name, "ImportError"),
        other => panic!("expected a remote import error, got {other:?}"),
    }

    client.close().await;
    server.close().await;
    Ok(())
}

/// Importing an unpublished name surfaces a structured remote error, and
/// the session stays healthy afterwards.
#[tokio::test]
async fn import_unknown_name_raises() -> Result<()> {
    let server = RpcServer::bind("tcp://127.0.0.1:0", ServerOptions::default()).await?;
    let client = RpcClient::connect(server.addr(), ClientOptions::default()).await?;

    match client.import("missing").await {
        Err(RpcError::Remote(remote)) => {
            assert_eq!(remote.type_name, "ImportError");
            assert!(remote.message.contains("missing"));
        }
        other => panic!("expected a remote import error, got {other:?}"),
    }

    // Errors are never fatal to the server.
    client.ping().await?;

    client.close().await;
    server.close().await;
    Ok(())
}

/// Remote failures carry the full cause chain back to the caller.
#[tokio::test]
async fn remote_error_chain_crosses_the_wire() -> Result<()> {
    let server = RpcServer::bind("tcp://127.0.0.1:0", ServerOptions::default()).await?;
    server.publish(
        "flaky",
        Arc::new(ServiceFn::new("flaky", |_args, _kwargs| {
            use anyhow::Context;
            Err::<Value, _>(anyhow::anyhow!("disk unavailable"))
                .context("writing checkpoint")
                .context("save failed")
        })),
    );

    let client = RpcClient::connect(server.addr(), ClientOptions::default()).await?;
    let flaky = client.import("flaky").await?;

    match flaky.call(Vec::new()).await {
        Err(RpcError::Remote(remote)) => {
            assert_eq!(remote.message, "save failed");
            assert_eq!(remote.chain.len(), 3);
            assert!(remote.traceback.contains("disk unavailable"));
        }
        other => panic!("expected a remote error, got {other:?}"),
    }

    client.close().await;
    server.close().await;
    Ok(())
}

/// Replies for non-reentrant requests come back in send order, and the
/// server executes them in send order too.
#[tokio::test]
async fn replies_arrive_in_send_order() -> Result<()> {
    use parking_lot::Mutex;

    let server = RpcServer::bind("tcp://127.0.0.1:0", ServerOptions::default()).await?;
    let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_on_server = Arc::clone(&seen);
    server.publish(
        "seq",
        Arc::new(ServiceFn::new("seq", move |args, _kwargs| {
            let n = args.first().and_then(Value::as_i64).unwrap_or(-1);
            seen_on_server.lock().push(n);
            Ok(Value::Int(n))
        })),
    );

    let client = RpcClient::connect(server.addr(), ClientOptions::default()).await?;
    let seq = client.import("seq").await?;

    let futures: Vec<_> = (0..16)
        .map(|n| seq.call_async(vec![Value::Int(n)]).unwrap())
        .collect();

    let mut ids = Vec::new();
    for (n, future) in futures.into_iter().enumerate() {
        ids.push(future.id());
        let returned = future.result(None).await?;
        assert_eq!(returned.value, Value::Int(n as i64));
    }

    // Request ids are unique and monotonic per client.
    for pair in ids.windows(2) {
        assert!(pair[0] < pair[1]);
    }
    // The server saw the calls in submission order.
    assert_eq!(*seen.lock(), (0..16).collect::<Vec<i64>>());

    client.close().await;
    server.close().await;
    Ok(())
}
