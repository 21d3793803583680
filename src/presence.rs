//! Heartbeat-driven liveness tracking.
//!
//! Presence is ephemeral: it lives in tracker memory, fans out over the
//! change feed's ephemeral channel, and never touches the session store.
//! A player is Online while heartbeats keep arriving, flips Offline once
//! the timeout elapses, and flips back on the next heartbeat (reconnect).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::record::{ActorToken, RoomId};

/// Liveness state of a (room, player) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Presence {
    Online,
    Offline,
}

/// A state change worth fanning out to room members.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresenceTransition {
    pub room_id: RoomId,
    pub actor: ActorToken,
    pub presence: Presence,
}

/// Tracker configuration.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// No heartbeat for this long ⇒ Offline. Should be at least twice the
    /// client heartbeat interval.
    pub offline_timeout: Duration,
    /// Offline records older than this are dropped entirely.
    pub drop_after: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            offline_timeout: Duration::from_secs(75),
            drop_after: Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Clone)]
struct LivenessRecord {
    last_heartbeat: Instant,
    presence: Presence,
}

/// Per-room registry of reachable players.
pub struct PresenceTracker {
    rooms: RwLock<HashMap<RoomId, HashMap<ActorToken, LivenessRecord>>>,
    config: PresenceConfig,
}

impl PresenceTracker {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(PresenceConfig::default())
    }

    /// Record a heartbeat. Returns a transition when the player was
    /// previously unknown or Offline.
    pub async fn heartbeat(
        &self,
        room_id: RoomId,
        actor: ActorToken,
    ) -> Option<PresenceTransition> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id).or_default();
        let now = Instant::now();

        match room.get_mut(&actor) {
            Some(record) => {
                let was = record.presence;
                record.last_heartbeat = now;
                record.presence = Presence::Online;
                if was == Presence::Offline {
                    Some(PresenceTransition {
                        room_id,
                        actor,
                        presence: Presence::Online,
                    })
                } else {
                    None
                }
            }
            None => {
                room.insert(
                    actor,
                    LivenessRecord {
                        last_heartbeat: now,
                        presence: Presence::Online,
                    },
                );
                Some(PresenceTransition {
                    room_id,
                    actor,
                    presence: Presence::Online,
                })
            }
        }
    }

    /// Stop tracking a player (clean leave). Silent: a vanished record is
    /// not a transition, peers learn about explicit leaves from the feed.
    pub async fn forget(&self, room_id: RoomId, actor: ActorToken) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(&room_id) {
            room.remove(&actor);
            if room.is_empty() {
                rooms.remove(&room_id);
            }
        }
    }

    /// Drop all records for a room (room closed).
    pub async fn forget_room(&self, room_id: RoomId) {
        self.rooms.write().await.remove(&room_id);
    }

    /// Time out stale records. Returns the Online→Offline transitions to
    /// fan out; records offline past the drop window are removed.
    pub async fn sweep(&self) -> Vec<PresenceTransition> {
        let mut rooms = self.rooms.write().await;
        let now = Instant::now();
        let mut transitions = Vec::new();

        for (room_id, room) in rooms.iter_mut() {
            for (actor, record) in room.iter_mut() {
                if record.presence == Presence::Online
                    && now.duration_since(record.last_heartbeat) > self.config.offline_timeout
                {
                    record.presence = Presence::Offline;
                    transitions.push(PresenceTransition {
                        room_id: *room_id,
                        actor: *actor,
                        presence: Presence::Offline,
                    });
                }
            }
            room.retain(|_, record| {
                record.presence == Presence::Online
                    || now.duration_since(record.last_heartbeat) <= self.config.drop_after
            });
        }
        rooms.retain(|_, room| !room.is_empty());

        if !transitions.is_empty() {
            log::debug!("Presence sweep: {} players went offline", transitions.len());
        }
        transitions
    }

    /// Current presence of every tracked player in a room.
    pub async fn snapshot(&self, room_id: RoomId) -> Vec<(ActorToken, Presence)> {
        let rooms = self.rooms.read().await;
        rooms
            .get(&room_id)
            .map(|room| {
                room.iter()
                    .map(|(actor, record)| (*actor, record.presence))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn presence_of(&self, room_id: RoomId, actor: ActorToken) -> Option<Presence> {
        let rooms = self.rooms.read().await;
        rooms
            .get(&room_id)
            .and_then(|room| room.get(&actor))
            .map(|record| record.presence)
    }

    pub async fn tracked_rooms(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub fn offline_timeout(&self) -> Duration {
        self.config.offline_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_config() -> PresenceConfig {
        PresenceConfig {
            offline_timeout: Duration::from_millis(50),
            drop_after: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_first_heartbeat_is_online_transition() {
        let tracker = PresenceTracker::with_defaults();
        let room = RoomId::generate();
        let actor = ActorToken::generate();

        let t = tracker.heartbeat(room, actor).await.unwrap();
        assert_eq!(t.presence, Presence::Online);

        // Second heartbeat while online — no transition
        assert!(tracker.heartbeat(room, actor).await.is_none());
        assert_eq!(
            tracker.presence_of(room, actor).await,
            Some(Presence::Online)
        );
    }

    #[tokio::test]
    async fn test_sweep_marks_offline_after_timeout() {
        let tracker = PresenceTracker::new(short_config());
        let room = RoomId::generate();
        let actor = ActorToken::generate();
        tracker.heartbeat(room, actor).await;

        // Before the timeout: nothing
        assert!(tracker.sweep().await.is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let transitions = tracker.sweep().await;
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].presence, Presence::Offline);
        assert_eq!(transitions[0].actor, actor);

        // Sweep is not repeated for an already-offline record
        assert!(tracker.sweep().await.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_revives_offline_player() {
        let tracker = PresenceTracker::new(short_config());
        let room = RoomId::generate();
        let actor = ActorToken::generate();
        tracker.heartbeat(room, actor).await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        tracker.sweep().await;
        assert_eq!(
            tracker.presence_of(room, actor).await,
            Some(Presence::Offline)
        );

        let t = tracker.heartbeat(room, actor).await.unwrap();
        assert_eq!(t.presence, Presence::Online);
    }

    #[tokio::test]
    async fn test_offline_records_dropped_after_window() {
        let tracker = PresenceTracker::new(short_config());
        let room = RoomId::generate();
        let actor = ActorToken::generate();
        tracker.heartbeat(room, actor).await;

        tokio::time::sleep(Duration::from_millis(250)).await;
        tracker.sweep().await; // marks offline, then drops past the window
        tracker.sweep().await;
        assert_eq!(tracker.presence_of(room, actor).await, None);
        assert_eq!(tracker.tracked_rooms().await, 0);
    }

    #[tokio::test]
    async fn test_forget_is_silent() {
        let tracker = PresenceTracker::with_defaults();
        let room = RoomId::generate();
        let actor = ActorToken::generate();
        tracker.heartbeat(room, actor).await;

        tracker.forget(room, actor).await;
        assert_eq!(tracker.presence_of(room, actor).await, None);
        assert!(tracker.sweep().await.is_empty());
    }

    #[tokio::test]
    async fn test_rooms_isolated() {
        let tracker = PresenceTracker::with_defaults();
        let room_a = RoomId::generate();
        let room_b = RoomId::generate();
        let actor = ActorToken::generate();

        tracker.heartbeat(room_a, actor).await;
        assert_eq!(tracker.snapshot(room_a).await.len(), 1);
        assert!(tracker.snapshot(room_b).await.is_empty());
    }
}
