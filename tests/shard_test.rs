use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use rusty_hub::auth::Identity;
use rusty_hub::core::connection::ConnectionHandle;
use rusty_hub::core::message_types::{ClientFrame, RoutedEvent, SequencedEvent};
use rusty_hub::core::shard::ShardEnvelope;
use rusty_hub::core::{
    ConnectionId, InMemoryBus, MessageRouter, RoomId, RoomKey, ShardBus, ShardId, SharedRouter,
};
use rusty_hub::HubConfig;

async fn shard(bus: &Arc<InMemoryBus>, shard_id: u32) -> SharedRouter {
    let config = HubConfig {
        shard_id,
        shard_count: 2,
        presence_grace: Duration::from_millis(50),
        ..HubConfig::default()
    };
    MessageRouter::builder(config)
        .bus(bus.clone())
        .build()
        .await
        .unwrap()
}

async fn next_of_type(handle: &mut ConnectionHandle, kind: &str) -> Value {
    loop {
        let text = tokio::time::timeout(Duration::from_secs(5), handle.receiver.recv())
            .await
            .unwrap_or_else(|_| panic!("no {} frame arrived", kind))
            .expect("connection closed");
        let frame: Value = serde_json::from_str(&text).unwrap();
        if frame["type"] == kind {
            return frame;
        }
    }
}

/// Poll until a shard's copy of the room has seen `seq`
async fn wait_for_sequence(router: &SharedRouter, key: &RoomKey, seq: u64) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while router.rooms().last_sequence(key).await.unwrap_or(0) < seq {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "{} never reached seq {}", key, seq);
}

/// A room id the ring assigns to shard 1
fn room_owned_by_second_shard(router: &SharedRouter) -> RoomId {
    (0..)
        .map(|i| RoomId::from(format!("room-{}", i)))
        .find(|room| router.shards().owner_of(room) == ShardId(1))
        .unwrap()
}

struct Cluster {
    bus: Arc<InMemoryBus>,
    r0: SharedRouter,
    r1: SharedRouter,
    room: RoomId,
}

async fn cluster() -> Cluster {
    let bus = Arc::new(InMemoryBus::new());
    let r0 = shard(&bus, 0).await;
    let r1 = shard(&bus, 1).await;
    let room = room_owned_by_second_shard(&r0);
    assert_eq!(r1.shards().owner_of(&room), ShardId(1));
    Cluster { bus, r0, r1, room }
}

#[tokio::test]
async fn test_event_is_sequenced_by_owner_and_reaches_every_shard() {
    let Cluster { r0, r1, room, .. } = cluster().await;

    let (a, mut a_handle) = r0.register(Identity::new("alice", "acme")).await.unwrap();
    let (c, mut c_handle) = r0.register(Identity::new("carol", "acme")).await.unwrap();
    let (b, mut b_handle) = r1.register(Identity::new("bob", "acme")).await.unwrap();
    r0.join(&a.id, &room).await.unwrap();
    r0.join(&c.id, &room).await.unwrap();
    r1.join(&b.id, &room).await.unwrap();

    let frame = ClientFrame::new("message", room.as_str(), json!({ "content": "hello" }))
        .with_client_msg_id("m1");
    assert_eq!(r0.route(&a.id, &room, frame).await.unwrap(), None);

    let on_owner = next_of_type(&mut b_handle, "message").await;
    assert_eq!(on_owner["seq"], 1);
    assert_eq!(on_owner["author_id"], "alice");

    let remote = next_of_type(&mut c_handle, "message").await;
    assert_eq!(remote["seq"], 1);
    assert_eq!(remote["payload"]["content"], "hello");

    let ack = next_of_type(&mut a_handle, "ack").await;
    assert_eq!(ack["seq"], 1);
    assert_eq!(ack["client_msg_id"], "m1");

    let key = RoomKey::new("acme", room.clone());
    assert_eq!(r1.rooms().last_sequence(&key).await.unwrap(), 1);
    assert_eq!(r0.stats().snapshot().shard_forwards, 1);
}

#[tokio::test]
async fn test_redelivered_event_is_dropped() {
    let Cluster { bus, r0, r1, room } = cluster().await;

    let (a, _a_handle) = r0.register(Identity::new("alice", "acme")).await.unwrap();
    let (c, mut c_handle) = r0.register(Identity::new("carol", "acme")).await.unwrap();
    let (b, _b_handle) = r1.register(Identity::new("bob", "acme")).await.unwrap();
    r0.join(&a.id, &room).await.unwrap();
    r0.join(&c.id, &room).await.unwrap();
    r1.join(&b.id, &room).await.unwrap();

    let frame = ClientFrame::new("message", room.as_str(), json!({ "content": "first" }));
    r0.route(&a.id, &room, frame).await.unwrap();
    assert_eq!(next_of_type(&mut c_handle, "message").await["seq"], 1);

    // The bus hands the same delivery to shard 0 a second time
    let duplicate = SequencedEvent {
        event: RoutedEvent {
            kind: "message".to_string(),
            room_id: room.clone(),
            tenant_id: "acme".into(),
            author_id: "alice".into(),
            payload: json!({ "content": "first" }),
            client_msg_id: None,
            origin_connection: ConnectionId::new(),
            origin_shard: ShardId(0),
        },
        seq: 1,
        server_timestamp: chrono::Utc::now(),
    };
    let bytes = ShardEnvelope::Deliver { event: duplicate }.encode().unwrap();
    bus.publish(ShardId(0), bytes).await.unwrap();

    let frame = ClientFrame::new("message", room.as_str(), json!({ "content": "second" }));
    r0.route(&a.id, &room, frame).await.unwrap();

    let next = next_of_type(&mut c_handle, "message").await;
    assert_eq!(next["seq"], 2);
    assert_eq!(next["payload"]["content"], "second");
}

#[tokio::test]
async fn test_late_joiner_on_non_owner_sees_owner_sequence() {
    let Cluster { r0, r1, room, .. } = cluster().await;
    let key = RoomKey::new("acme", room.clone());

    let (b, _b_handle) = r1.register(Identity::new("bob", "acme")).await.unwrap();
    r1.join(&b.id, &room).await.unwrap();
    for i in 0..5 {
        let content = json!({ "content": format!("update {}", i) });
        let frame = ClientFrame::new("message", room.as_str(), content);
        assert_eq!(r1.route(&b.id, &room, frame).await.unwrap(), Some(i + 1));
    }
    // Shard 0 has no member in the room yet, but it tracks the deliveries
    wait_for_sequence(&r0, &key, 5).await;

    let (a, mut a_handle) = r0.register(Identity::new("alice", "acme")).await.unwrap();
    r0.join(&a.id, &room).await.unwrap();
    let joined = next_of_type(&mut a_handle, "joined").await;
    assert_eq!(joined["payload"]["last_seq"], 5);

    let frame = ClientFrame::new("message", room.as_str(), json!({ "content": "next" }));
    r1.route(&b.id, &room, frame).await.unwrap();
    let next = next_of_type(&mut a_handle, "message").await;
    assert_eq!(next["seq"], 6);
}

#[tokio::test]
async fn test_presence_crosses_shards() {
    let Cluster { r0, r1, room, .. } = cluster().await;

    let (a, a_handle) = r0.register(Identity::new("alice", "acme")).await.unwrap();
    let (c, mut c_handle) = r0.register(Identity::new("carol", "acme")).await.unwrap();
    let (b, mut b_handle) = r1.register(Identity::new("bob", "acme")).await.unwrap();
    r0.join(&a.id, &room).await.unwrap();
    r0.join(&c.id, &room).await.unwrap();
    r1.join(&b.id, &room).await.unwrap();

    drop(a_handle);
    assert!(r0.remove(&a.id).await);

    let local = next_of_type(&mut c_handle, "presence").await;
    assert_eq!(local["payload"]["user_id"], "alice");
    assert_eq!(local["payload"]["status"], "offline");

    let remote = loop {
        let frame = next_of_type(&mut b_handle, "presence").await;
        if frame["payload"]["user_id"] == "alice" {
            break frame;
        }
    };
    assert_eq!(remote["room_id"], room.as_str());
    assert_eq!(remote["payload"]["status"], "offline");
}
