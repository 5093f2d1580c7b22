//! End-to-end scenarios across hub, presence and sessions.

use roomcast_core::room::{self, PRESENCE};
use roomcast_core::{
    ChannelReader, CloseReason, ConnectParams, Connection, Hub, Message, Outbound,
    OverflowPolicy, PresenceConfig, PresenceTracker, QueuedConnection, SessionConfig,
    SessionManager,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Message> {
    let mut messages = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let Outbound::Frame(bytes) = frame {
            messages.push(serde_json::from_slice(&bytes).unwrap());
        }
    }
    messages
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached");
}

fn presence_params(user: &str) -> ConnectParams {
    ConnectParams {
        room: Some(PRESENCE.to_string()),
        user: Some(user.to_string()),
    }
}

#[tokio::test]
async fn test_post_room_fanout_and_leave() {
    let hub = Hub::new();
    let (a, mut a_rx) = QueuedConnection::new(16, OverflowPolicy::DropNewest);
    let (b, mut b_rx) = QueuedConnection::new(16, OverflowPolicy::DropNewest);
    let post = room::post(42);

    hub.join(&post, a.clone());
    hub.join(&post, b.clone());

    let report = hub
        .publish(&post, "comment_created", Some("u1"), &json!({"id": 7}))
        .unwrap();
    assert_eq!(report.delivered, 2);

    for rx in [&mut a_rx, &mut b_rx] {
        let received = drain(rx);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind, "comment_created");
        assert_eq!(received[0].room, "post:42");
        assert_eq!(received[0].from.as_deref(), Some("u1"));
        assert_eq!(received[0].payload.as_ref().unwrap()["id"], 7);
    }

    hub.leave(&post, a.id());
    hub.publish(&post, "like_updated", Some("u2"), &json!({"count": 3}))
        .unwrap();

    assert!(drain(&mut a_rx).is_empty());
    let received = drain(&mut b_rx);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].kind, "like_updated");
}

#[tokio::test]
async fn test_presence_edges_across_two_sockets() {
    let hub = Arc::new(Hub::new());
    let presence = Arc::new(PresenceTracker::new());
    let sessions = SessionManager::new(hub.clone(), presence.clone(), SessionConfig::default());

    let (watcher, mut events) = QueuedConnection::new(64, OverflowPolicy::DropNewest);
    hub.join(PRESENCE, watcher.clone());

    let spawn = |user: &str| {
        let handshake = sessions.handshake(presence_params(user)).unwrap();
        let (conn, outbound) = QueuedConnection::new(64, OverflowPolicy::DropNewest);
        let (frames, reader) = ChannelReader::pair();
        let sessions = sessions.clone();
        let task = tokio::spawn(async move { sessions.run(handshake, conn, reader).await });
        (frames, outbound, task)
    };

    let (frames_a, _out_a, task_a) = spawn("u1");
    eventually(|| presence.connection_count("u1") == 1).await;
    let (frames_b, _out_b, task_b) = spawn("u1");
    eventually(|| presence.connection_count("u1") == 2).await;

    let online = drain(&mut events);
    assert_eq!(online.len(), 1);
    assert_eq!(online[0].kind, "online");
    assert_eq!(online[0].payload, Some(json!({"userId": "u1"})));

    drop(frames_a);
    assert_eq!(task_a.await.unwrap(), CloseReason::ClientClosed);
    assert!(drain(&mut events).is_empty());
    assert!(presence.is_online("u1"));

    drop(frames_b);
    assert_eq!(task_b.await.unwrap(), CloseReason::ClientClosed);
    let offline = drain(&mut events);
    assert_eq!(offline.len(), 1);
    assert_eq!(offline[0].kind, "offline");
    assert!(!presence.is_online("u1"));

    hub.leave(PRESENCE, watcher.id());
    assert_eq!(hub.stats().room_count, 0);
}

#[tokio::test]
async fn test_other_rooms_never_touch_presence() {
    let hub = Arc::new(Hub::new());
    let presence = Arc::new(PresenceTracker::new());
    let sessions = SessionManager::new(hub.clone(), presence.clone(), SessionConfig::default());

    let handshake = sessions
        .handshake(ConnectParams {
            room: Some(room::direct("u2", "u1")),
            user: Some("u1".into()),
        })
        .unwrap();
    let (conn, _outbound) = QueuedConnection::new(8, OverflowPolicy::DropNewest);
    let (frames, reader) = ChannelReader::pair();
    let task = {
        let sessions = sessions.clone();
        tokio::spawn(async move { sessions.run(handshake, conn, reader).await })
    };

    eventually(|| hub.room_exists("dm:u1:u2")).await;
    assert_eq!(presence.tracked_count(), 0);

    drop(frames);
    task.await.unwrap();
    assert!(!hub.room_exists("dm:u1:u2"));
}

#[tokio::test(start_paused = true)]
async fn test_sweep_announces_offline_once() {
    let hub = Arc::new(Hub::new());
    let presence = Arc::new(PresenceTracker::with_config(PresenceConfig::default()));
    let sessions = SessionManager::new(
        hub.clone(),
        presence.clone(),
        SessionConfig {
            // Longer than the TTL so the sweep gets there first.
            read_timeout: Duration::from_secs(300),
            ping_interval: Duration::from_secs(600),
        },
    );

    let (watcher, mut events) = QueuedConnection::new(64, OverflowPolicy::DropNewest);
    hub.join(PRESENCE, watcher.clone());

    let handshake = sessions.handshake(presence_params("u1")).unwrap();
    let (conn, _outbound) = QueuedConnection::new(64, OverflowPolicy::DropNewest);
    let (frames, reader) = ChannelReader::pair();
    let task = {
        let sessions = sessions.clone();
        tokio::spawn(async move { sessions.run(handshake, conn, reader).await })
    };

    let sweeper = presence.spawn_sweeper(hub.clone());
    tokio::time::sleep(Duration::from_secs(90)).await;

    assert!(!presence.is_online("u1"));
    let kinds: Vec<String> = drain(&mut events).into_iter().map(|m| m.kind).collect();
    assert_eq!(kinds, vec!["online", "offline"]);

    // The zombie socket closing late must not announce a second offline.
    drop(frames);
    task.await.unwrap();
    assert!(drain(&mut events).is_empty());

    sweeper.shutdown().await;
}
