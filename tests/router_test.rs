use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use rusty_hub::auth::Identity;
use rusty_hub::core::connection::{Connection, ConnectionHandle};
use rusty_hub::core::message_types::ClientFrame;
use rusty_hub::core::{
    IdleReaper, MemberRole, MessageRouter, RoomId, RoomKey, RoomSpec, SharedRouter,
};
use rusty_hub::storage::InMemoryMessageStore;
use rusty_hub::{HubConfig, HubError};

async fn hub() -> SharedRouter {
    MessageRouter::builder(HubConfig::default()).build().await.unwrap()
}

async fn connect(router: &SharedRouter, user: &str) -> (Arc<Connection>, ConnectionHandle) {
    router.register(Identity::new(user, "acme")).await.unwrap()
}

/// Wait for the next frame of the given type, skipping others
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

/// Every test connection belongs to tenant "acme"
fn acme(room: &str) -> RoomKey {
    RoomKey::new("acme", room)
}

fn drain(handle: &mut ConnectionHandle) {
    while handle.receiver.try_recv().is_ok() {}
}

fn message(room: &str, content: &str) -> ClientFrame {
    ClientFrame::new("message", room, json!({ "content": content }))
}

#[tokio::test]
async fn test_message_reaches_other_member_without_echo() {
    let router = hub().await;
    let general = RoomId::from("general");
    let (a, mut a_handle) = connect(&router, "alice").await;
    let (b, mut b_handle) = connect(&router, "bob").await;
    router.join(&a.id, &general).await.unwrap();
    router.join(&b.id, &general).await.unwrap();
    drain(&mut a_handle);
    drain(&mut b_handle);

    router
        .handle_text(&a.id, r#"{"type":"message","room_id":"general","content":"hi"}"#)
        .await;

    let received = next_of_type(&mut b_handle, "message").await;
    assert_eq!(received["room_id"], "general");
    assert_eq!(received["seq"], 1);
    assert_eq!(received["author_id"], "alice");
    assert_eq!(received["payload"]["content"], "hi");
    assert!(received["server_timestamp"].is_string());
    assert!(a_handle.receiver.try_recv().is_err());
}

#[tokio::test]
async fn test_echo_to_sender_when_enabled() {
    let config = HubConfig {
        echo_to_sender: true,
        ..HubConfig::default()
    };
    let router = MessageRouter::builder(config).build().await.unwrap();
    let (a, mut a_handle) = connect(&router, "alice").await;
    router.join(&a.id, &"general".into()).await.unwrap();

    router.route(&a.id, &"general".into(), message("general", "hi")).await.unwrap();
    assert_eq!(next_of_type(&mut a_handle, "message").await["seq"], 1);
}

#[tokio::test]
async fn test_sequence_numbers_have_no_gaps() {
    let mut config = HubConfig::default();
    config.moderation.spam_burst_threshold = 1000;
    let router = MessageRouter::builder(config).build().await.unwrap();
    let general = RoomId::from("general");
    let (a, _a_handle) = connect(&router, "alice").await;
    let (b, mut b_handle) = connect(&router, "bob").await;
    router.join(&a.id, &general).await.unwrap();
    router.join(&b.id, &general).await.unwrap();
    drain(&mut b_handle);

    for i in 0..20 {
        let seq = router
            .route(&a.id, &general, message("general", &format!("message {}", i)))
            .await
            .unwrap();
        assert_eq!(seq, Some(i + 1));
    }
    // Rejected events do not consume numbers
    assert!(router.route(&b.id, &"other".into(), message("other", "x")).await.is_err());

    let mut expected = 1;
    while let Ok(text) = b_handle.receiver.try_recv() {
        let frame: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame["seq"], expected);
        expected += 1;
    }
    assert_eq!(expected, 21);
    assert_eq!(router.rooms().last_sequence(&acme("general")).await.unwrap(), 20);
}

#[tokio::test]
async fn test_blocked_message_never_sequenced() {
    let mut config = HubConfig::default();
    config.moderation.blocklist = vec!["forbidden".to_string()];
    let router = MessageRouter::builder(config).build().await.unwrap();
    let general = RoomId::from("general");
    let (a, mut a_handle) = connect(&router, "alice").await;
    let (b, mut b_handle) = connect(&router, "bob").await;
    router.join(&a.id, &general).await.unwrap();
    router.join(&b.id, &general).await.unwrap();
    drain(&mut a_handle);
    drain(&mut b_handle);

    let text = r#"{"type":"message","room_id":"general","content":"a forbidden word"}"#;
    router.handle_text(&a.id, text).await;

    let error = next_of_type(&mut a_handle, "error").await;
    assert_eq!(error["payload"]["code"], "CONTENT_BLOCKED");
    assert_eq!(router.rooms().last_sequence(&acme("general")).await.unwrap(), 0);
    assert!(b_handle.receiver.try_recv().is_err());
    assert_eq!(router.stats().snapshot().rejected_content, 1);
}

#[tokio::test]
async fn test_failed_target_is_isolated_and_removed() {
    let router = hub().await;
    let general = RoomId::from("general");
    let (sender, _s) = connect(&router, "sender").await;
    router.join(&sender.id, &general).await.unwrap();

    let mut healthy = Vec::new();
    for user in ["b", "c", "d"] {
        let (connection, handle) = connect(&router, user).await;
        router.join(&connection.id, &general).await.unwrap();
        healthy.push(handle);
    }
    let (broken, broken_handle) = connect(&router, "broken").await;
    router.join(&broken.id, &general).await.unwrap();
    drop(broken_handle);

    router.route(&sender.id, &general, message("general", "hello")).await.unwrap();

    for handle in healthy.iter_mut() {
        assert_eq!(next_of_type(handle, "message").await["payload"]["content"], "hello");
    }
    let targets = router.rooms().connections_for(&acme("general")).await.unwrap();
    assert!(!targets.contains(&broken.id));
    assert!(!router.connections().contains(&broken.id).await);
}

#[tokio::test]
async fn test_slow_consumer_is_dropped() {
    let config = HubConfig {
        outbound_queue_capacity: 2,
        ..HubConfig::default()
    };
    let router = MessageRouter::builder(config).build().await.unwrap();
    let general = RoomId::from("general");
    let (a, mut a_handle) = connect(&router, "alice").await;
    let (slow, mut slow_handle) = connect(&router, "slow").await;
    router.join(&a.id, &general).await.unwrap();
    router.join(&slow.id, &general).await.unwrap();
    drain(&mut a_handle);
    drain(&mut slow_handle);

    for i in 0..3 {
        router
            .route(&a.id, &general, message("general", &format!("burst {}", i)))
            .await
            .unwrap();
    }
    assert!(!router.connections().contains(&slow.id).await);
    assert_eq!(router.stats().snapshot().slow_consumer_evictions, 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_rejects_31st_message() {
    let mut config = HubConfig::default();
    // Keep the spam heuristics out of the way
    config.moderation.spam_burst_threshold = 1000;
    let router = MessageRouter::builder(config).build().await.unwrap();
    let general = RoomId::from("general");
    let (a, _handle) = connect(&router, "alice").await;
    router.join(&a.id, &general).await.unwrap();

    for i in 0..30 {
        router
            .route(&a.id, &general, message("general", &format!("msg {}", i)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;
    }
    let result = router.route(&a.id, &general, message("general", "one too many")).await;
    assert!(matches!(result, Err(HubError::RateLimited(_))));
    assert_eq!(router.rooms().last_sequence(&acme("general")).await.unwrap(), 30);
}

#[tokio::test]
async fn test_private_and_broadcast_policies() {
    let router = hub().await;
    router
        .create_room(RoomSpec::private("secret", "acme").with_grant("alice", MemberRole::Member))
        .await
        .unwrap();
    router
        .create_room(
            RoomSpec::broadcast("news", "acme").with_grant("editor", MemberRole::Moderator),
        )
        .await
        .unwrap();

    let (alice, _a) = connect(&router, "alice").await;
    let (bob, _b) = connect(&router, "bob").await;
    let (editor, _e) = connect(&router, "editor").await;

    assert!(router.join(&alice.id, &"secret".into()).await.is_ok());
    assert!(matches!(
        router.join(&bob.id, &"secret".into()).await,
        Err(HubError::PermissionDenied(_))
    ));

    let news = RoomId::from("news");
    router.join(&bob.id, &news).await.unwrap();
    router.join(&editor.id, &news).await.unwrap();
    assert!(matches!(
        router.route(&bob.id, &news, message("news", "hello")).await,
        Err(HubError::PermissionDenied(_))
    ));
    let seq = router.route(&editor.id, &news, message("news", "breaking")).await.unwrap();
    assert_eq!(seq, Some(1));
}

#[tokio::test]
async fn test_room_delete_waits_for_last_reference() {
    let router = hub().await;
    let (a, _handle) = connect(&router, "alice").await;
    let general = RoomId::from("general");
    router.join(&a.id, &general).await.unwrap();

    assert!(matches!(router.delete_room(&acme("general")).await, Err(HubError::RoomInUse(_))));
    router.remove(&a.id).await;
    router.delete_room(&acme("general")).await.unwrap();
}

#[tokio::test]
async fn test_content_messages_reach_history_sink() {
    let store = Arc::new(InMemoryMessageStore::new());
    let router = MessageRouter::builder(HubConfig::default())
        .sink(store.clone())
        .build()
        .await
        .unwrap();
    let general = RoomId::from("general");
    let (a, _handle) = connect(&router, "alice").await;
    router.join(&a.id, &general).await.unwrap();

    router.route(&a.id, &general, message("general", "keep me")).await.unwrap();
    router
        .route(&a.id, &general, ClientFrame::new("typing", "general", json!({})))
        .await
        .unwrap();

    for _ in 0..50 {
        if store.count(&acme("general")).await > 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    let stored = store.recent_messages(&acme("general"), 10).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].seq, 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_without_leave_is_reaped_and_announced() {
    let config = HubConfig::default();
    let router = MessageRouter::builder(config.clone()).build().await.unwrap();
    let reaper = IdleReaper::new(router.clone(), &config);
    let general = RoomId::from("general");
    let (a, a_handle) = connect(&router, "alice").await;
    let (b, mut b_handle) = connect(&router, "bob").await;
    router.join(&a.id, &general).await.unwrap();
    router.join(&b.id, &general).await.unwrap();
    drain(&mut b_handle);

    // Transport goes away without a leave frame
    drop(a_handle);
    tokio::time::advance(config.reaper_interval).await;
    b.touch();
    reaper.sweep_once(tokio::time::Instant::now()).await;

    assert!(!router.rooms().members(&acme("general")).await.unwrap().contains(&"alice".into()));
    let left = next_of_type(&mut b_handle, "member_left").await;
    assert_eq!(left["payload"]["user_id"], "alice");

    let presence = next_of_type(&mut b_handle, "presence").await;
    assert_eq!(presence["room_id"], "general");
    assert_eq!(presence["payload"]["user_id"], "alice");
    assert_eq!(presence["payload"]["status"], "offline");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_membership_views_agree_under_concurrency() {
    let config = HubConfig {
        max_connections_per_user: 50,
        outbound_queue_capacity: 10_000,
        ..HubConfig::default()
    };
    let router = MessageRouter::builder(config).build().await.unwrap();
    let rooms: Vec<RoomId> = (0..4).map(|i| RoomId::from(format!("room-{}", i))).collect();

    let mut tasks = Vec::new();
    for worker in 0..16 {
        let router = router.clone();
        let rooms = rooms.clone();
        tasks.push(tokio::spawn(async move {
            let (connection, handle) = router
                .register(Identity::new(format!("user-{}", worker % 5), "acme"))
                .await
                .unwrap();
            for step in 0..40 {
                let room = &rooms[(worker + step) % rooms.len()];
                if step % 3 == 0 {
                    router.leave(&connection.id, room).await.unwrap();
                } else {
                    router.join(&connection.id, room).await.unwrap();
                }
            }
            if worker % 4 == 0 {
                router.remove(&connection.id).await;
            }
            (connection, handle)
        }));
    }
    let mut connections = Vec::new();
    for task in tasks {
        connections.push(task.await.unwrap());
    }

    for room in &rooms {
        let mut from_room = router.rooms().connections_for(&acme(room.as_str())).await.unwrap();
        let mut from_connections: Vec<_> = connections
            .iter()
            .map(|(connection, _)| connection)
            .filter(|connection| connection.is_in_room(room))
            .map(|connection| connection.id)
            .collect();
        from_room.sort_by_key(|id| id.to_string());
        from_connections.sort_by_key(|id| id.to_string());
        assert_eq!(from_room, from_connections, "views of {} diverged", room);

        let mut members: Vec<String> = router
            .rooms()
            .members(&acme(room.as_str()))
            .await
            .unwrap()
            .iter()
            .map(|user| user.to_string())
            .collect();
        let mut expected: Vec<String> = connections
            .iter()
            .map(|(connection, _)| connection)
            .filter(|connection| connection.is_in_room(room))
            .map(|connection| connection.user_id().to_string())
            .collect();
        members.sort();
        expected.sort();
        expected.dedup();
        assert_eq!(members, expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_room_full_first_writer_wins() {
    let router = hub().await;
    router
        .create_room(RoomSpec::public("duo", "acme").with_max_members(1))
        .await
        .unwrap();
    let (a, _a) = connect(&router, "alice").await;
    let (b, _b) = connect(&router, "bob").await;

    let duo_a: RoomId = "duo".into();
    let duo_b: RoomId = "duo".into();
    let (first, second) = tokio::join!(
        router.join(&a.id, &duo_a),
        router.join(&b.id, &duo_b)
    );
    let results = [first.is_ok(), second.is_ok()];
    assert_eq!(results.iter().filter(|ok| **ok).count(), 1);
    assert!(matches!(
        if first.is_err() { first } else { second },
        Err(HubError::RoomFull(_))
    ));
    assert_eq!(router.rooms().members(&acme("duo")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_two_tenants_join_the_same_room_name() {
    let router = hub().await;
    let general = RoomId::from("general");
    let (alice, mut alice_handle) = connect(&router, "alice").await;
    let (bob, mut bob_handle) = connect(&router, "bob").await;
    let (gina, mut gina_handle) = router.register(Identity::new("gina", "globex")).await.unwrap();

    router.join(&alice.id, &general).await.unwrap();
    router.join(&gina.id, &general).await.unwrap();
    router.join(&bob.id, &general).await.unwrap();

    // Bob's arrival is news to acme only
    assert_eq!(next_of_type(&mut alice_handle, "member_joined").await["payload"]["user_id"], "bob");
    let joined = next_of_type(&mut gina_handle, "joined").await;
    assert_eq!(joined["payload"]["members"], json!(["gina"]));
    drain(&mut alice_handle);
    drain(&mut bob_handle);
    drain(&mut gina_handle);

    router.route(&alice.id, &general, message("general", "acme news")).await.unwrap();
    let received = next_of_type(&mut bob_handle, "message").await;
    assert_eq!(received["payload"]["content"], "acme news");
    assert!(gina_handle.receiver.try_recv().is_err());

    assert_eq!(router.rooms().list(&"globex".into()).await, vec![general.clone()]);
    assert_eq!(router.rooms().last_sequence(&acme("general")).await.unwrap(), 1);
    let globex = RoomKey::new("globex", "general");
    assert_eq!(router.rooms().last_sequence(&globex).await.unwrap(), 0);
}
