//! The seed end-to-end scenarios for the four procedure kinds: one
//! `#[tokio::test]` per scenario, driven entirely over the in-memory
//! transport via the `support` harness.

mod support;

use ferrule::codec::JsonCodec;
use ferrule::config::ClientConfig;
use ferrule::result::{ErrorPayload, RpcResult};
use ferrule::server::ProcedureDef;
use ferrule::transport::in_memory_pair;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::{connected_pair, permissive, procedures, wait_until_connected, SingleUseTransport};

fn fast_client_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.session.heartbeat_interval = Duration::from_millis(50);
    config.session.heartbeats_until_dead = 20;
    config.backoff_base = Duration::from_millis(5);
    config.backoff_max = Duration::from_millis(20);
    config
}

#[tokio::test]
async fn rpc_add_accumulates_across_sequential_calls() {
    let counter = Arc::new(AtomicI64::new(0));
    let counter_for_handler = counter.clone();
    let add = ProcedureDef::rpc(permissive(), permissive(), move |_ctx, req_init| {
        let counter = counter_for_handler.clone();
        async move {
            let n = req_init.get("n").and_then(Value::as_i64).unwrap_or(0);
            let total = counter.fetch_add(n, Ordering::SeqCst) + n;
            RpcResult::Ok(json!({"result": total}))
        }
    });
    let schema = ferrule::server::ServiceSchemaMap::new().service("test", procedures(vec![("add", add)]));

    let (client, _server, _transport) = connected_pair(schema, fast_client_config()).await;

    let first = client.call_rpc("test", "add", json!({"n": 3})).await;
    assert_eq!(first, RpcResult::Ok(json!({"result": 3})));

    let second = client.call_rpc("test", "add", json!({"n": 3})).await;
    assert_eq!(second, RpcResult::Ok(json!({"result": 6})));
}

#[tokio::test]
async fn echo_stream_skips_ignored_messages() {
    let echo = ProcedureDef::stream(permissive(), permissive(), permissive(), |_ctx, _req_init, mut req, res| async move {
        while let Some(item) = req.next().await {
            let Ok(value) = item else { break };
            let msg = value.get("msg").and_then(Value::as_str).unwrap_or_default().to_string();
            let ignore = value.get("ignore").and_then(Value::as_bool).unwrap_or(false);
            if !ignore {
                let _ = res.write(json!({"response": msg}));
            }
        }
        res.close();
    });
    let schema = ferrule::server::ServiceSchemaMap::new().service("test", procedures(vec![("echo", echo)]));

    let (client, _server, _transport) = connected_pair(schema, fast_client_config()).await;

    let mut call = client.call_stream("test", "echo", json!({})).await.unwrap();
    call.req.write(json!({"msg": "abc", "ignore": false})).unwrap();
    call.req.write(json!({"msg": "def", "ignore": true})).unwrap();
    call.req.write(json!({"msg": "ghi", "ignore": false})).unwrap();
    call.req.close();

    assert_eq!(call.res.next().await.unwrap().unwrap(), json!({"response": "abc"}));
    assert_eq!(call.res.next().await.unwrap().unwrap(), json!({"response": "ghi"}));
    assert!(call.res.next().await.is_none());
}

#[tokio::test]
async fn fallible_rpc_surfaces_the_declared_error() {
    let divide = ProcedureDef::rpc(permissive(), permissive(), |_ctx, req_init| async move {
        let a = req_init.get("a").and_then(Value::as_f64).unwrap_or(0.0);
        let b = req_init.get("b").and_then(Value::as_f64).unwrap_or(0.0);
        if b == 0.0 {
            RpcResult::Err(ErrorPayload::new("DIV_BY_ZERO", "Cannot divide by zero"))
        } else {
            RpcResult::Ok(json!({"result": a / b}))
        }
    });
    let schema = ferrule::server::ServiceSchemaMap::new().service("fallible", procedures(vec![("divide", divide)]));

    let (client, _server, _transport) = connected_pair(schema, fast_client_config()).await;

    let result = client.call_rpc("fallible", "divide", json!({"a": 10, "b": 0})).await;
    assert_eq!(
        result,
        RpcResult::Err(ErrorPayload::new("DIV_BY_ZERO", "Cannot divide by zero"))
    );
}

#[tokio::test]
async fn client_declared_response_schema_rejects_a_malformed_result_as_abort() {
    use ferrule::client::ResponseSchemas;
    use ferrule::schema::RequiredKeysSchema;

    // The server's own declared responseData is permissive, so it happily
    // sends a value missing "result" — the client is the one enforcing a
    // stricter contract on what it's willing to accept back.
    let greet = ProcedureDef::rpc(permissive(), permissive(), |_ctx, _req_init| async move {
        RpcResult::Ok(json!({"greeting": "hi"}))
    });
    let schema = ferrule::server::ServiceSchemaMap::new().service("test", procedures(vec![("greet", greet)]));

    let (client, _server, _transport) = connected_pair(schema, fast_client_config()).await;
    client.declare_response_schema(
        "test",
        "greet",
        ResponseSchemas {
            data: Arc::new(RequiredKeysSchema::new(&["result"])),
            error: None,
        },
    );

    let result = client.call_rpc("test", "greet", json!({})).await;
    match result {
        RpcResult::Err(err) => {
            assert_eq!(err.code, "ABORT");
            assert!(err.message.contains("invalid payload"));
        }
        other => panic!("expected an ABORT error, got {other:?}"),
    }
}

#[tokio::test]
async fn client_abort_mid_stream_fires_the_server_signal_and_tombstones() {
    let cancelled = Arc::new(AtomicBool::new(false));
    let cancelled_for_handler = cancelled.clone();
    let cancel_echo = ProcedureDef::stream(
        permissive(),
        permissive(),
        permissive(),
        move |mut ctx, _req_init, _req, res| {
            let cancelled = cancelled_for_handler.clone();
            async move {
                let _ = res.write(json!({"tick": 0}));
                ctx.signal.cancelled().await;
                cancelled.store(true, Ordering::SeqCst);
            }
        },
    );
    let schema =
        ferrule::server::ServiceSchemaMap::new().service("test", procedures(vec![("cancelEcho", cancel_echo)]));

    let (client, server, _transport) = connected_pair(schema, fast_client_config()).await;
    let session_id = client.session_id();

    let mut call = client.call_stream("test", "cancelEcho", json!({})).await.unwrap();
    assert_eq!(call.res.next().await.unwrap().unwrap(), json!({"tick": 0}));

    let before = server.session(session_id).unwrap().stream_count();
    client.cancel(call.stream_id, "client gave up");

    match call.res.next().await.unwrap() {
        Err(ferrule::rw::ReadableError::Application(err)) => {
            assert_eq!(err.code, "ABORT");
            assert!(!err.message.is_empty());
        }
        other => panic!("expected an ABORT error, got {other:?}"),
    }
    assert!(call.res.next().await.is_none());

    // give the server's teardown hook a moment to observe the cancel
    // signal and the session a moment to process the inbound abort frame
    for _ in 0..50 {
        if cancelled.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(cancelled.load(Ordering::SeqCst), "server handler never observed the cancel signal");

    let after = server.session(session_id).unwrap().stream_count();
    assert!(after < before, "aborted stream should be removed from the session's stream map");
}

#[tokio::test]
async fn disconnect_during_rpc_resolves_to_unexpected_disconnect() {
    support::init_tracing();
    let slow = ProcedureDef::rpc(permissive(), permissive(), |_ctx, _req_init| async move {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        RpcResult::Ok(Value::Null)
    });
    let schema = ferrule::server::ServiceSchemaMap::new().service("test", procedures(vec![("slow", slow)]));

    let server = Arc::new(ferrule::server::Server::new(
        "server",
        schema,
        ferrule::config::ServerConfig::default(),
        Arc::new(JsonCodec::default()),
    ));

    let ((client_conn, client_rx), (server_conn, server_rx)) = in_memory_pair();
    let server_conn_for_test = server_conn.clone();
    tokio::spawn({
        let server = server.clone();
        async move {
            server.serve_connection(server_conn, server_rx).await;
        }
    });

    let mut config = fast_client_config();
    config.reconnect_on_connection_drop = false;
    config.session.session_disconnect_grace = Duration::from_millis(100);

    let transport = Arc::new(SingleUseTransport::new(client_conn.clone(), client_rx));
    let client = ferrule::client::Client::new("client", "server", config, Arc::new(JsonCodec::default()), transport);
    client.connect().await.unwrap();

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call_rpc("test", "slow", json!({})).await }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    // Closes the transport from the server's side of the pair, which is
    // what actually delivers a `ConnectionEvent::Closed` to the client's
    // reader (each `Connection::close()` notifies its peer, not itself).
    server_conn_for_test.close();

    let result = call.await.unwrap();
    assert_eq!(
        result,
        RpcResult::Err(ErrorPayload::unexpected_disconnect())
    );
}

#[tokio::test]
async fn message_order_survives_reconnects() {
    let order = Arc::new(Mutex::new(Vec::<i64>::new()));
    let order_for_add = order.clone();
    let add = ProcedureDef::rpc(permissive(), permissive(), move |_ctx, req_init| {
        let order = order_for_add.clone();
        async move {
            let n = req_init.get("n").and_then(Value::as_i64).unwrap_or(-1);
            order.lock().unwrap().push(n);
            RpcResult::Ok(json!({"result": n}))
        }
    });
    let order_for_get_all = order.clone();
    let get_all = ProcedureDef::rpc(permissive(), permissive(), move |_ctx, _req_init| {
        let order = order_for_get_all.clone();
        async move { RpcResult::Ok(json!({"msgs": order.lock().unwrap().clone()})) }
    });
    let schema = ferrule::server::ServiceSchemaMap::new()
        .service("test", procedures(vec![("add", add), ("getAll", get_all)]));

    let (client, _server, transport) = connected_pair(schema, fast_client_config()).await;

    for i in 0..50i64 {
        let result = client.call_rpc("test", "add", json!({"n": i})).await;
        assert_eq!(result, RpcResult::Ok(json!({"result": i})), "call {i} should succeed");

        if i == 10 || i == 42 {
            transport.sever_current();
            wait_until_connected(&client, Duration::from_secs(5)).await;
        }
    }

    let all = client.call_rpc("test", "getAll", json!({})).await;
    let expected: Vec<i64> = (0..50).collect();
    assert_eq!(all, RpcResult::Ok(json!({"msgs": expected})));
}
