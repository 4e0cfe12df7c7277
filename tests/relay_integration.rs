//! End-to-end tests against a real server on an ephemeral port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use athena_relay::auth::{DevTokenVerifier, TokenVerifier};
use athena_relay::store::SqliteMessageStore;
use athena_relay::{api, RelayConfig, RelayError, RelayState};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Identity provider that rejects every token.
struct RejectAll;

#[async_trait::async_trait]
impl TokenVerifier for RejectAll {
    async fn verify(&self, _token: &str) -> athena_relay::Result<String> {
        Err(RelayError::Unauthorized("expired".to_string()))
    }
}

async fn spawn_server() -> SocketAddr {
    spawn_server_with(RelayConfig::default(), Arc::new(DevTokenVerifier)).await
}

async fn spawn_server_with(config: RelayConfig, verifier: Arc<dyn TokenVerifier>) -> SocketAddr {
    let store = Arc::new(SqliteMessageStore::open_in_memory().unwrap());
    let state = RelayState::start(config, store, verifier);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api::router(state)).await.unwrap();
    });
    addr
}

async fn online_count(addr: SocketAddr) -> u64 {
    let stats: Value = reqwest::get(format!("http://{}/api/stats", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    stats["online_clients"].as_u64().unwrap()
}

async fn wait_for_online(addr: SocketAddr, expected: u64) {
    for _ in 0..200 {
        if online_count(addr).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} online clients", expected);
}

async fn connect(addr: SocketAddr, user_id: &str) -> Client {
    let (ws, _) = connect_async(format!("ws://{}/ws?token={}", addr, user_id))
        .await
        .unwrap();
    ws
}

async fn send(ws: &mut Client, frame: Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Next text frame as JSON, skipping control frames.
async fn recv(ws: &mut Client) -> Value {
    let next = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    });
    next.await.expect("timed out waiting for a frame")
}

fn offer(to: &str) -> Value {
    json!({
        "type": "call-offer",
        "payload": {
            "call_type": 0,
            "sdp_type": 0,
            "receiver_id": to,
            "sdp_string": "v=0",
            "time": "2024-05-01T10:00:00Z",
        }
    })
}

fn call_end(to: &str) -> Value {
    json!({ "type": "call-end", "payload": { "receiver_id": to } })
}

#[tokio::test]
async fn test_upgrade_without_token_is_rejected() {
    let addr = spawn_server().await;

    let err = connect_async(format!("ws://{}/ws", addr)).await.unwrap_err();
    match err {
        tungstenite::Error::Http(resp) => assert_eq!(resp.status().as_u16(), 401),
        other => panic!("expected HTTP 401, got {:?}", other),
    }
}

#[tokio::test]
async fn test_upgrade_with_rejected_token() {
    let addr = spawn_server_with(RelayConfig::default(), Arc::new(RejectAll)).await;

    let err = connect_async(format!("ws://{}/ws?token=stale", addr))
        .await
        .unwrap_err();
    match err {
        tungstenite::Error::Http(resp) => {
            assert_eq!(resp.status().as_u16(), 401);
            let body: Value = serde_json::from_slice(resp.body().as_deref().unwrap()).unwrap();
            assert_eq!(body["error"], "Invalid or expired token");
        }
        other => panic!("expected HTTP 401, got {:?}", other),
    }
}

#[tokio::test]
async fn test_chat_is_delivered_and_stored() {
    let addr = spawn_server().await;
    let mut alice = connect(addr, "alice").await;
    let mut bob = connect(addr, "bob").await;
    wait_for_online(addr, 2).await;

    send(
        &mut alice,
        json!({
            "type": "chat",
            "payload": { "user_id_1": "bob", "user_id_2": "alice", "content": "hi bob" }
        }),
    )
    .await;

    let frame = recv(&mut bob).await;
    assert_eq!(frame["type"], "chat");
    assert_eq!(frame["payload"]["user_id_1"], "alice");
    assert_eq!(frame["payload"]["user_id_2"], "bob");
    assert_eq!(frame["payload"]["sender_id"], "alice");
    assert_eq!(frame["payload"]["content"], "hi bob");

    let client = reqwest::Client::new();
    let mut history = Value::Null;
    for _ in 0..200 {
        history = client
            .get(format!("http://{}/api/messages/history?friend_id=alice", addr))
            .bearer_auth("bob")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if !history["messages"].as_array().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(history["current_user"], "bob");
    assert_eq!(history["messages"][0]["content"], "hi bob");

    // The sender gets nothing back.
    assert!(
        tokio::time::timeout(Duration::from_millis(100), alice.next())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_busy_then_end_then_retry() {
    let addr = spawn_server().await;
    let mut alice = connect(addr, "alice").await;
    let mut bob = connect(addr, "bob").await;
    let mut carol = connect(addr, "carol").await;
    wait_for_online(addr, 3).await;

    send(&mut alice, offer("bob")).await;
    let frame = recv(&mut bob).await;
    assert_eq!(frame["type"], "call-offer");
    assert_eq!(frame["payload"]["sender_id"], "alice");

    send(&mut carol, offer("bob")).await;
    let frame = recv(&mut carol).await;
    assert_eq!(frame["type"], "call-error");
    assert_eq!(frame["payload"]["reason"], "user_busy");
    assert_eq!(frame["payload"]["receiver_id"], "bob");

    send(&mut alice, call_end("bob")).await;
    let frame = recv(&mut bob).await;
    assert_eq!(frame["type"], "call-end");

    // Both sides are idle again, so carol can get through.
    send(&mut carol, offer("bob")).await;
    let frame = recv(&mut bob).await;
    assert_eq!(frame["type"], "call-offer");
    assert_eq!(frame["payload"]["sender_id"], "carol");
}

#[tokio::test]
async fn test_offer_to_offline_user() {
    let addr = spawn_server().await;
    let mut alice = connect(addr, "alice").await;
    wait_for_online(addr, 1).await;

    send(&mut alice, offer("nobody")).await;
    let frame = recv(&mut alice).await;
    assert_eq!(frame["type"], "call-error");
    assert_eq!(frame["payload"]["reason"], "user_offline");

    // Still connected and usable.
    assert_eq!(online_count(addr).await, 1);
}

#[tokio::test]
async fn test_disconnect_mid_call_notifies_peer() {
    let addr = spawn_server().await;
    let mut alice = connect(addr, "alice").await;
    let mut bob = connect(addr, "bob").await;
    wait_for_online(addr, 2).await;

    send(&mut alice, offer("bob")).await;
    assert_eq!(recv(&mut bob).await["type"], "call-offer");

    alice.close(None).await.unwrap();
    drop(alice);

    let frame = recv(&mut bob).await;
    assert_eq!(frame["type"], "call-end");
    assert_eq!(frame["payload"]["sender_id"], "alice");
    wait_for_online(addr, 1).await;
}

#[tokio::test]
async fn test_malformed_frame_closes_connection() {
    let addr = spawn_server().await;
    let mut alice = connect(addr, "alice").await;
    wait_for_online(addr, 1).await;

    alice
        .send(Message::Text("{not json".to_string()))
        .await
        .unwrap();

    wait_for_online(addr, 0).await;
}

#[tokio::test]
async fn test_second_login_replaces_first() {
    let addr = spawn_server().await;
    let mut first = connect(addr, "alice").await;
    wait_for_online(addr, 1).await;

    let _second = connect(addr, "alice").await;

    // The first connection is closed by the server.
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok());
    assert_eq!(online_count(addr).await, 1);
}

#[tokio::test]
async fn test_evicted_slow_reader_releases_call_partner() {
    let config = RelayConfig {
        queue_capacity: 4,
        ..RelayConfig::default()
    };
    let addr = spawn_server_with(config, Arc::new(DevTokenVerifier)).await;
    let mut alice = connect(addr, "alice").await;
    let mut bob = connect(addr, "bob").await;
    let mut carol = connect(addr, "carol").await;
    wait_for_online(addr, 3).await;

    send(&mut carol, offer("bob")).await;
    assert_eq!(recv(&mut bob).await["type"], "call-offer");

    // Bob stops reading. Flood him until the relay gives up on him.
    let big = "x".repeat(256 * 1024);
    let mut evicted = false;
    for i in 0..400 {
        send(
            &mut alice,
            json!({
                "type": "chat",
                "payload": { "user_id_1": "alice", "user_id_2": "bob", "content": big }
            }),
        )
        .await;
        if i % 10 == 9 && online_count(addr).await == 2 {
            evicted = true;
            break;
        }
    }
    if !evicted {
        wait_for_online(addr, 2).await;
    }

    // Carol is told the call is over and is free again.
    let frame = recv(&mut carol).await;
    assert_eq!(frame["type"], "call-end");
    assert_eq!(frame["payload"]["sender_id"], "bob");

    send(&mut alice, offer("carol")).await;
    let frame = recv(&mut carol).await;
    assert_eq!(frame["type"], "call-offer");
    assert_eq!(frame["payload"]["sender_id"], "alice");

    drop(bob);
}
