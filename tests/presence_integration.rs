//! Presence fan-out tests: tracker transitions flowing through the
//! ephemeral feed channel, and the guarantee that liveness never touches
//! the durable player record.

use std::sync::Arc;
use std::time::Duration;

use parlor::{
    ActorToken, Audience, ChangeFeed, Notice, Player, Presence, PresenceConfig, PresenceTracker,
    RecordWrite, RoomId, SessionStore, StoreConfig,
};

fn short_tracker() -> PresenceTracker {
    PresenceTracker::new(PresenceConfig {
        offline_timeout: Duration::from_millis(50),
        drop_after: Duration::from_millis(500),
    })
}

async fn publish_transitions(feed: &ChangeFeed, tracker: &PresenceTracker) {
    for t in tracker.sweep().await {
        feed.publish_ephemeral(
            t.room_id,
            Notice::PresenceChanged {
                token: t.actor,
                presence: t.presence,
            },
            Audience::Everyone,
        )
        .await;
    }
}

#[tokio::test]
async fn test_offline_transition_reaches_subscribers() {
    let tracker = short_tracker();
    let feed = ChangeFeed::new(16);
    let room = RoomId::generate();
    let silent = ActorToken::generate();
    let watcher = ActorToken::generate();

    let mut sub = feed.subscribe(room, watcher).await;
    tracker.heartbeat(room, silent).await;

    tokio::time::sleep(Duration::from_millis(80)).await;
    publish_transitions(&feed, &tracker).await;

    let event = sub.recv().await.unwrap();
    assert!(!event.durable, "presence must travel the ephemeral channel");
    match event.notice.clone() {
        Notice::PresenceChanged { token, presence } => {
            assert_eq!(token, silent);
            assert_eq!(presence, Presence::Offline);
        }
        other => panic!("expected PresenceChanged, got {other:?}"),
    }
}

#[tokio::test]
async fn test_revival_announces_online() {
    let tracker = short_tracker();
    let feed = ChangeFeed::new(16);
    let room = RoomId::generate();
    let actor = ActorToken::generate();

    tracker.heartbeat(room, actor).await;
    tokio::time::sleep(Duration::from_millis(80)).await;
    tracker.sweep().await;

    let mut sub = feed.subscribe(room, ActorToken::generate()).await;
    if let Some(t) = tracker.heartbeat(room, actor).await {
        feed.publish_ephemeral(
            t.room_id,
            Notice::PresenceChanged {
                token: t.actor,
                presence: t.presence,
            },
            Audience::Everyone,
        )
        .await;
    }

    let event = sub.recv().await.unwrap();
    assert!(matches!(
        event.notice,
        Notice::PresenceChanged {
            presence: Presence::Online,
            ..
        }
    ));
}

#[tokio::test]
async fn test_steady_heartbeats_publish_nothing() {
    let tracker = short_tracker();
    let feed = ChangeFeed::new(16);
    let room = RoomId::generate();
    let actor = ActorToken::generate();

    // First heartbeat transitions to Online
    assert!(tracker.heartbeat(room, actor).await.is_some());

    // Steady heartbeats inside the timeout never transition
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(tracker.heartbeat(room, actor).await.is_none());
        publish_transitions(&feed, &tracker).await;
    }
    assert_eq!(feed.stats().await.events_published, 0);
}

#[tokio::test]
async fn test_presence_never_writes_the_store() {
    let store = Arc::new(SessionStore::open(StoreConfig::in_memory()).unwrap());
    let tracker = short_tracker();
    let room_id = RoomId::generate();
    let actor = ActorToken::generate();

    let player = Player::new(actor, room_id, "Flaky", false);
    store
        .commit(vec![RecordWrite::PutPlayer {
            expect: None,
            player: player.clone(),
        }])
        .unwrap();

    // A full offline/online cycle in the tracker
    tracker.heartbeat(room_id, actor).await;
    tokio::time::sleep(Duration::from_millis(80)).await;
    tracker.sweep().await;
    tracker.heartbeat(room_id, actor).await;

    // The durable record is untouched: same version, same contents
    let stored = store.get_player(actor).unwrap();
    assert_eq!(stored.version, player.version);
    assert_eq!(stored, player);
}
