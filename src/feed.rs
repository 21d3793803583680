//! Per-room fan-out of change notifications and ephemeral broadcasts.
//!
//! Each room gets one tokio broadcast channel; every subscribed connection
//! holds an independent receiver. Events are `Arc`-wrapped so fan-out to N
//! subscribers costs one allocation. Delivery is at-least-once and carries
//! no cross-field ordering guarantee — per-field ordering is the
//! resolver's job.
//!
//! Privacy is enforced at fan-out time, not just at write time: every
//! event carries an [`Audience`], and a subscription silently skips events
//! its actor is not in. A private-collection payload scoped `Only(owner)`
//! can therefore never reach another connection, regardless of
//! interleaving.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::protocol::Notice;
use crate::record::{ActorToken, RoomId};

/// Who may observe an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Everyone,
    /// Exactly one actor (private-collection payloads).
    Only(ActorToken),
    /// Everyone but one actor (count-only copies of a scoped event).
    Except(ActorToken),
}

impl Audience {
    pub fn includes(&self, actor: ActorToken) -> bool {
        match self {
            Audience::Everyone => true,
            Audience::Only(t) => *t == actor,
            Audience::Except(t) => *t != actor,
        }
    }
}

/// A fanned-out event.
#[derive(Debug, Clone)]
pub struct FeedEvent {
    pub room_id: RoomId,
    pub audience: Audience,
    /// True for committed-write notifications, false for ephemeral
    /// broadcasts (never persisted, never replayed to late joiners).
    pub durable: bool,
    pub notice: Notice,
}

/// Lock-free stats, read via snapshot.
struct AtomicFeedStats {
    events_published: AtomicU64,
    events_filtered: AtomicU64,
}

/// Snapshot of feed health.
#[derive(Debug, Clone, Default)]
pub struct FeedStats {
    pub events_published: u64,
    pub events_filtered: u64,
    pub active_rooms: usize,
}

struct RoomChannel {
    sender: broadcast::Sender<Arc<FeedEvent>>,
}

/// The publish/subscribe fabric.
pub struct ChangeFeed {
    rooms: RwLock<HashMap<RoomId, RoomChannel>>,
    capacity: usize,
    stats: Arc<AtomicFeedStats>,
}

impl ChangeFeed {
    /// `capacity` is the per-receiver buffer; lagging subscribers observe
    /// `Lagged` and are expected to resync.
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            stats: Arc::new(AtomicFeedStats {
                events_published: AtomicU64::new(0),
                events_filtered: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe a connection, identified by its actor, to a room.
    pub async fn subscribe(&self, room_id: RoomId, actor: ActorToken) -> FeedSubscription {
        let rx = {
            // Fast path: channel exists.
            {
                let rooms = self.rooms.read().await;
                if let Some(channel) = rooms.get(&room_id) {
                    Some(channel.sender.subscribe())
                } else {
                    None
                }
            }
        };
        let rx = match rx {
            Some(rx) => rx,
            None => {
                let mut rooms = self.rooms.write().await;
                // Double-check after taking the write lock.
                let channel = rooms.entry(room_id).or_insert_with(|| {
                    let (sender, _) = broadcast::channel(self.capacity);
                    RoomChannel { sender }
                });
                channel.sender.subscribe()
            }
        };

        FeedSubscription {
            actor,
            rx,
            stats: self.stats.clone(),
        }
    }

    /// Publish a committed-write notification. Returns the receiver count.
    pub async fn publish_change(
        &self,
        room_id: RoomId,
        notice: Notice,
        audience: Audience,
    ) -> usize {
        self.publish(room_id, notice, audience, true).await
    }

    /// Publish a transient broadcast (presence flips, room closure).
    pub async fn publish_ephemeral(
        &self,
        room_id: RoomId,
        notice: Notice,
        audience: Audience,
    ) -> usize {
        self.publish(room_id, notice, audience, false).await
    }

    async fn publish(
        &self,
        room_id: RoomId,
        notice: Notice,
        audience: Audience,
        durable: bool,
    ) -> usize {
        let event = Arc::new(FeedEvent {
            room_id,
            audience,
            durable,
            notice,
        });

        let count = {
            let rooms = self.rooms.read().await;
            match rooms.get(&room_id) {
                Some(channel) => channel.sender.send(event).unwrap_or(0),
                // Nobody subscribed yet — nothing to deliver.
                None => 0,
            }
        };
        self.stats.events_published.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Drop a room's channel once nothing listens to it.
    pub async fn drop_if_idle(&self, room_id: RoomId) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(channel) = rooms.get(&room_id) {
            if channel.sender.receiver_count() == 0 {
                rooms.remove(&room_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn stats(&self) -> FeedStats {
        FeedStats {
            events_published: self.stats.events_published.load(Ordering::Relaxed),
            events_filtered: self.stats.events_filtered.load(Ordering::Relaxed),
            active_rooms: self.rooms.read().await.len(),
        }
    }
}

/// Receive errors surfaced to connection tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedRecvError {
    /// The subscriber fell behind and missed `n` events; it should resync.
    Lagged(u64),
    /// The room channel is gone.
    Closed,
}

impl std::fmt::Display for FeedRecvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedRecvError::Lagged(n) => write!(f, "Subscriber lagged by {n} events"),
            FeedRecvError::Closed => write!(f, "Feed channel closed"),
        }
    }
}

impl std::error::Error for FeedRecvError {}

/// One connection's view of a room's feed.
pub struct FeedSubscription {
    actor: ActorToken,
    rx: broadcast::Receiver<Arc<FeedEvent>>,
    stats: Arc<AtomicFeedStats>,
}

impl FeedSubscription {
    /// Next event visible to this subscriber's actor. Events outside the
    /// audience are skipped here, before they ever reach the transport.
    pub async fn recv(&mut self) -> Result<Arc<FeedEvent>, FeedRecvError> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if event.audience.includes(self.actor) {
                        return Ok(event);
                    }
                    self.stats.events_filtered.fetch_add(1, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(FeedRecvError::Lagged(n))
                }
                Err(broadcast::error::RecvError::Closed) => return Err(FeedRecvError::Closed),
            }
        }
    }

    pub fn actor(&self) -> ActorToken {
        self.actor
    }
}
