//! Client behaviour against a scripted in-memory peer

use proven_jsonrpc_client::*;
use proven_jsonrpc_transport_memory::{MemoryPeer, MemoryTransport};
use serde_json::{Value, json};
use std::time::Duration;

async fn connected() -> (RpcClient, MemoryPeer) {
    connected_with(ClientConfig::default()).await
}

async fn connected_with(config: ClientConfig) -> (RpcClient, MemoryPeer) {
    let (transport, listener) = MemoryTransport::pair();
    let client = RpcClient::builder()
        .transport(transport)
        .config(config)
        .build()
        .unwrap();

    let (connected, peer) = tokio::join!(client.connect(), listener.accept());
    connected.unwrap();

    (client, peer.unwrap())
}

async fn recv_json(peer: &MemoryPeer) -> Value {
    let frame = peer.recv().await.expect("client closed the connection");
    serde_json::from_str(&frame).unwrap()
}

/// Round-trip a call so every frame the peer sent before it has been
/// dispatched.
async fn barrier(client: &RpcClient, peer: &MemoryPeer) {
    let call = client.call::<_, Value>("barrier", ());
    let answer = async {
        let request = recv_json(peer).await;
        peer.send(json!({ "jsonrpc": "2.0", "id": request["id"], "result": null }).to_string())
            .await
            .unwrap();
    };

    let (result, ()) = tokio::join!(call, answer);
    assert_eq!(result.unwrap(), Value::Null);
}

#[tokio::test]
async fn test_auth_sends_login_call() {
    let (client, peer) = connected().await;

    let auth = client.auth::<_, bool>(json!({ "username": "user", "password": "secret" }));
    let answer = async {
        let request = recv_json(&peer).await;
        assert_eq!(
            request,
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "rpc.login",
                "params": { "username": "user", "password": "secret" }
            })
        );

        peer.send(r#"{"jsonrpc":"2.0","id":1,"result":true}"#)
            .await
            .unwrap();
    };

    let (result, ()) = tokio::join!(auth, answer);
    assert!(result.unwrap());
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_subscribe_receive_and_unsubscribe() {
    let (client, peer) = connected().await;

    let auth = client.auth::<_, bool>(json!({ "username": "user" }));
    let answer = async {
        recv_json(&peer).await;
        peer.send(r#"{"jsonrpc":"2.0","id":1,"result":true}"#)
            .await
            .unwrap();
    };
    let (result, ()) = tokio::join!(auth, answer);
    assert!(result.unwrap());

    let subscribe = client.subscribe("execution");
    let answer = async {
        let frame = peer.recv().await.unwrap();
        assert_eq!(
            frame,
            r#"{"jsonrpc":"2.0","id":2,"method":"rpc.on","params":["execution"]}"#
        );
        peer.send(r#"{"jsonrpc":"2.0","id":2,"result":"ok"}"#)
            .await
            .unwrap();
    };
    let (subscription, ()) = tokio::join!(subscribe, answer);
    let mut subscription = subscription.unwrap();

    peer.send(r#"{"jsonrpc":"2.0","method":"execution","params":[{"status":"started"}]}"#)
        .await
        .unwrap();
    peer.send(r#"{"jsonrpc":"2.0","method":"execution","params":[{"status":"done"}]}"#)
        .await
        .unwrap();

    let first = subscription.recv().await.unwrap();
    assert_eq!(first.method, "execution");
    assert_eq!(first.params, json!([{ "status": "started" }]));
    let second = subscription.recv().await.unwrap();
    assert_eq!(second.params, json!([{ "status": "done" }]));

    let unsubscribe = client.unsubscribe("execution");
    let answer = async {
        let request = recv_json(&peer).await;
        assert_eq!(request["id"], 3);
        assert_eq!(request["method"], "rpc.off");
        assert_eq!(request["params"], json!(["execution"]));
        peer.send(r#"{"jsonrpc":"2.0","id":3,"result":"ok"}"#)
            .await
            .unwrap();
    };
    let (result, ()) = tokio::join!(unsubscribe, answer);
    assert_eq!(result.unwrap(), json!("ok"));

    assert!(subscription.recv().await.is_none());
}

#[tokio::test]
async fn test_failed_subscribe_keeps_nothing() {
    let (client, peer) = connected().await;
    let mut local = client.notifications("rule");

    let subscribe = client.subscribe("execution");
    let answer = async {
        recv_json(&peer).await;
        peer.send(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"Event not provided"}}"#,
        )
        .await
        .unwrap();
    };
    let (result, ()) = tokio::join!(subscribe, answer);

    match result {
        Err(Error::Remote(error)) => assert_eq!(error.message, "Event not provided"),
        other => panic!("unexpected result: {other:?}"),
    }

    // Queues registered through `notifications` are untouched
    peer.send(r#"{"jsonrpc":"2.0","method":"rule","params":{"id":7}}"#)
        .await
        .unwrap();
    assert_eq!(local.recv().await.unwrap().params, json!({ "id": 7 }));
}

#[tokio::test]
async fn test_remote_error() {
    let (client, peer) = connected().await;

    let call = client.call::<_, Value>("missing", ["a"]);
    let answer = async {
        recv_json(&peer).await;
        peer.send(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Method not found","data":"missing"}}"#,
        )
        .await
        .unwrap();
    };
    let (result, ()) = tokio::join!(call, answer);

    match result {
        Err(Error::Remote(error)) => {
            assert_eq!(error.code, codes::METHOD_NOT_FOUND);
            assert_eq!(error.message, "Method not found");
            assert_eq!(error.data, Some(json!("missing")));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_out_of_order_responses() {
    let (client, peer) = connected().await;

    let calls: Vec<_> = (0..3u64)
        .map(|n| {
            let client = client.clone();
            tokio::spawn(async move { client.call::<_, u64>("echo", [n]).await })
        })
        .collect();

    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(recv_json(&peer).await);
    }
    assert_eq!(client.pending_calls(), 3);

    for request in requests.iter().rev() {
        peer.send(
            json!({ "jsonrpc": "2.0", "id": request["id"], "result": request["params"][0] })
                .to_string(),
        )
        .await
        .unwrap();
    }

    for (n, call) in (0..3u64).zip(calls) {
        assert_eq!(call.await.unwrap().unwrap(), n);
    }
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_result_type_mismatch() {
    let (client, peer) = connected().await;

    let call = client.call::<_, u64>("name", ());
    let answer = async {
        let request = recv_json(&peer).await;
        assert!(request.get("params").is_none());
        peer.send(r#"{"jsonrpc":"2.0","id":1,"result":"not a number"}"#)
            .await
            .unwrap();
    };
    let (result, ()) = tokio::join!(call, answer);

    assert!(matches!(
        result,
        Err(Error::Codec(CodecError::InvalidResult(_)))
    ));
}

#[tokio::test]
async fn test_invalid_params_are_rejected_locally() {
    let (client, peer) = connected().await;

    let result = client.call::<_, Value>("sum", 42).await;
    assert!(matches!(
        result,
        Err(Error::Codec(CodecError::InvalidParams(_)))
    ));
    assert_eq!(client.pending_calls(), 0);

    // The connection is still usable
    barrier(&client, &peer).await;
}

#[tokio::test(start_paused = true)]
async fn test_timeout_removes_pending_call() {
    let (client, peer) = connected().await;

    let result = client
        .call_with_options::<_, Value>("slow", (), CallOptions::timeout(Duration::from_secs(1)))
        .await;

    assert!(matches!(result, Err(Error::Timeout(d)) if d == Duration::from_secs(1)));
    assert_eq!(client.pending_calls(), 0);

    // The late response finds nothing to complete
    let request = recv_json(&peer).await;
    peer.send(json!({ "jsonrpc": "2.0", "id": request["id"], "result": "late" }).to_string())
        .await
        .unwrap();

    barrier(&client, &peer).await;
    assert_eq!(client.anomalies().unmatched_responses(), 1);
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_configured_call_timeout() {
    let config = ClientConfig {
        call_timeout: Some(Duration::from_millis(250)),
        ..ClientConfig::default()
    };
    let (client, _peer) = connected_with(config).await;

    let result = client.call::<_, Value>("slow", ()).await;

    assert!(matches!(result, Err(Error::Timeout(d)) if d == Duration::from_millis(250)));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_dropped_call_is_cancelled() {
    let (client, peer) = connected().await;

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call::<_, Value>("slow", ()).await })
    };

    recv_json(&peer).await;
    assert_eq!(client.pending_calls(), 1);

    call.abort();
    let _ = call.await;

    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_notify_registers_nothing() {
    let (client, peer) = connected().await;

    client
        .notify("execution.log", json!({ "line": "hello" }))
        .await
        .unwrap();

    let frame = recv_json(&peer).await;
    assert_eq!(
        frame,
        json!({ "jsonrpc": "2.0", "method": "execution.log", "params": { "line": "hello" } })
    );
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_peer_close_fails_pending_calls() {
    let (client, peer) = connected().await;

    let calls: Vec<_> = (0..3)
        .map(|n| {
            let client = client.clone();
            tokio::spawn(async move { client.call::<_, Value>("wait", [n]).await })
        })
        .collect();

    for _ in 0..3 {
        recv_json(&peer).await;
    }

    peer.close();

    for call in calls {
        assert!(matches!(
            call.await.unwrap(),
            Err(Error::ConnectionClosed(CloseReason::PeerClosed))
        ));
    }

    client.closed().await;
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(client.close_reason(), Some(CloseReason::PeerClosed));
    assert_eq!(client.pending_calls(), 0);

    let result = client.call::<_, Value>("after", ()).await;
    assert!(matches!(
        result,
        Err(Error::ConnectionClosed(CloseReason::PeerClosed))
    ));
}

#[tokio::test]
async fn test_transport_error_closes_client() {
    let (client, peer) = connected().await;
    let mut subscription = client.notifications("execution");

    peer.fail(TransportError::Other("connection reset".to_string()));

    client.closed().await;
    assert!(matches!(
        client.close_reason(),
        Some(CloseReason::TransportError(_))
    ));
    assert!(subscription.recv().await.is_none());
}

#[tokio::test]
async fn test_close_fails_pending_calls() {
    let (client, peer) = connected().await;

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call::<_, Value>("wait", ()).await })
    };
    recv_json(&peer).await;

    client.close().await.unwrap();

    assert!(matches!(
        call.await.unwrap(),
        Err(Error::ConnectionClosed(CloseReason::ClientClosed))
    ));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(client.pending_calls(), 0);

    // The peer sees the connection end
    assert!(peer.recv().await.is_none());

    // Idempotent
    client.close().await.unwrap();
    assert_eq!(client.close_reason(), Some(CloseReason::ClientClosed));
}

#[tokio::test]
async fn test_notifications_after_close_end() {
    let (client, _peer) = connected().await;

    client.close().await.unwrap();

    let mut subscription = client.notifications("execution");
    let next = tokio::time::timeout(Duration::from_millis(500), subscription.recv())
        .await
        .expect("stream should end once the client is closed");
    assert!(next.is_none());
}

#[tokio::test]
async fn test_notifications_after_peer_close_end() {
    let (client, peer) = connected().await;

    peer.close();
    client.closed().await;

    let mut subscription = client.notifications("execution");
    assert!(subscription.recv().await.is_none());
}

#[tokio::test]
async fn test_unknown_and_malformed_frames_are_skipped() {
    let (client, peer) = connected().await;

    peer.send(r#"{"jsonrpc":"2.0","id":99,"result":1}"#)
        .await
        .unwrap();
    peer.send("not json").await.unwrap();
    peer.send(r#"{"jsonrpc":"1.0","id":1,"result":1}"#)
        .await
        .unwrap();
    peer.send(r#"{"jsonrpc":"2.0","id":5,"method":"server.request","params":[]}"#)
        .await
        .unwrap();

    barrier(&client, &peer).await;

    let anomalies = client.anomalies();
    assert_eq!(anomalies.unmatched_responses(), 1);
    assert_eq!(anomalies.malformed_frames(), 2);
    assert_eq!(anomalies.unsupported_messages(), 1);
    assert_eq!(anomalies.total(), 4);
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_connection_states() {
    let (transport, listener) = MemoryTransport::pair();
    let client = RpcClient::builder().transport(transport).build().unwrap();
    let mut states = Vec::new();

    states.push(client.state());
    assert!(!client.is_connected());

    let (connected, _peer) = tokio::join!(client.connect(), listener.accept());
    connected.unwrap();
    states.push(client.state());
    assert!(client.is_connected());

    assert!(matches!(
        client.connect().await,
        Err(Error::InvalidState(ConnectionState::Connected))
    ));

    client.close().await.unwrap();
    states.push(client.state());

    assert_eq!(
        states,
        vec![
            ConnectionState::Unconnected,
            ConnectionState::Connected,
            ConnectionState::Closed,
        ]
    );
}

#[tokio::test]
async fn test_connect_failure() {
    let client = RpcClient::builder()
        .transport(MemoryTransport::unreachable())
        .build()
        .unwrap();

    let result = client.connect().await;

    match result {
        Err(Error::Connect { endpoint, .. }) => assert_eq!(endpoint, "memory://local"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(matches!(
        client.close_reason(),
        Some(CloseReason::ConnectFailed(_))
    ));

    let result = client.call::<_, Value>("after", ()).await;
    assert!(matches!(result, Err(Error::ConnectionClosed(_))));
}

#[tokio::test]
async fn test_concurrent_calls_get_unique_ids() {
    let (client, peer) = connected().await;

    let calls: Vec<_> = (0..50)
        .map(|n| {
            let client = client.clone();
            tokio::spawn(async move { client.call::<_, i64>("echo", [n]).await })
        })
        .collect();

    let mut ids = std::collections::HashSet::new();
    for _ in 0..50 {
        let request = recv_json(&peer).await;
        assert!(ids.insert(request["id"].as_u64().unwrap()));
        peer.send(
            json!({ "jsonrpc": "2.0", "id": request["id"], "result": request["params"][0] })
                .to_string(),
        )
        .await
        .unwrap();
    }

    for (n, call) in (0..50).zip(calls) {
        assert_eq!(call.await.unwrap().unwrap(), n);
    }
    assert_eq!(ids.len(), 50);
}
