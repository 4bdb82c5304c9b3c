use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use rusty_hub::auth::{AuthProvider, Identity, StaticAuthProvider};
use rusty_hub::core::MessageRouter;
use rusty_hub::handlers::routes;
use rusty_hub::HubConfig;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a hub on an ephemeral port with two known tokens
async fn start_server() -> SocketAddr {
    let provider = Arc::new(StaticAuthProvider::new());
    provider
        .insert_token("alice-token", Identity::new("alice", "acme"))
        .await;
    provider
        .insert_token("bob-token", Identity::new("bob", "acme"))
        .await;
    let auth: Arc<dyn AuthProvider> = provider;

    let config = HubConfig::default();
    let router = MessageRouter::builder(config.clone())
        .authorizer(auth.clone())
        .build()
        .await
        .unwrap();
    let (addr, server) =
        warp::serve(routes(router, auth, &config)).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    addr
}

async fn connect(addr: SocketAddr, token: &str) -> Client {
    let url = format!("ws://{}/ws?token={}", addr, token);
    let (client, _response) = connect_async(url.as_str()).await.expect("handshake");
    client
}

async fn send(client: &mut Client, frame: Value) {
    client.send(Message::Text(frame.to_string())).await.unwrap();
}

async fn next_of_type(client: &mut Client, kind: &str) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap_or_else(|_| panic!("no {} frame arrived", kind))
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = message {
            let frame: Value = serde_json::from_str(&text).unwrap();
            if frame["type"] == kind {
                return frame;
            }
        }
    }
}

#[tokio::test]
async fn test_health_and_stats_endpoints() {
    let addr = start_server().await;

    let health = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(health, "OK");

    let stats: Value = reqwest::get(format!("http://{}/stats", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["connections_active"], 0);
    assert!(stats["messages_routed"].is_u64());
}

#[tokio::test]
async fn test_two_clients_exchange_messages() {
    let addr = start_server().await;
    let mut alice = connect(addr, "alice-token").await;
    let mut bob = connect(addr, "bob-token").await;

    send(&mut alice, json!({ "type": "join", "room_id": "lobby" })).await;
    let joined = next_of_type(&mut alice, "joined").await;
    assert_eq!(joined["room_id"], "lobby");
    assert_eq!(joined["payload"]["last_seq"], 0);

    send(&mut bob, json!({ "type": "join", "room_id": "lobby" })).await;
    next_of_type(&mut bob, "joined").await;
    let member = next_of_type(&mut alice, "member_joined").await;
    assert_eq!(member["payload"]["user_id"], "bob");

    let frame = json!({
        "type": "message",
        "room_id": "lobby",
        "content": "hi bob",
        "client_msg_id": "c-1",
    });
    send(&mut alice, frame).await;
    let message = next_of_type(&mut bob, "message").await;
    assert_eq!(message["seq"], 1);
    assert_eq!(message["author_id"], "alice");
    assert_eq!(message["payload"]["content"], "hi bob");

    let ack = next_of_type(&mut alice, "ack").await;
    assert_eq!(ack["client_msg_id"], "c-1");
    assert_eq!(ack["seq"], 1);

    send(&mut bob, json!({ "type": "ping" })).await;
    next_of_type(&mut bob, "pong").await;
}

#[tokio::test]
async fn test_unknown_token_is_refused() {
    let addr = start_server().await;
    let mut intruder = connect(addr, "stolen").await;

    let error = next_of_type(&mut intruder, "error").await;
    assert_eq!(error["payload"]["code"], "UNAUTHORIZED");

    // The server closes the socket after refusing
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match intruder.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}

#[tokio::test]
async fn test_leaving_client_is_announced() {
    let addr = start_server().await;
    let mut alice = connect(addr, "alice-token").await;
    let mut bob = connect(addr, "bob-token").await;

    send(&mut alice, json!({ "type": "join", "room_id": "lobby" })).await;
    next_of_type(&mut alice, "joined").await;
    send(&mut bob, json!({ "type": "join", "room_id": "lobby" })).await;
    next_of_type(&mut bob, "joined").await;

    bob.close(None).await.unwrap();
    let left = next_of_type(&mut alice, "member_left").await;
    assert_eq!(left["payload"]["user_id"], "bob");
    assert_eq!(left["payload"]["reason"], "disconnected");
}
