//! WebSocket sync server: one connection per player, one feed per room.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── RoomRegistry ── SessionStore (RocksDB / memory)
//! Client B ──┘        │
//!                 PrivacyGate
//!                      │
//!                  ChangeFeed ── audience-scoped fan-out
//!                      │
//!            ┌─────────┼─────────┐
//!            ▼         ▼         ▼
//!        Client A  Client B  Client C
//! ```
//!
//! Each connection runs a `select!` loop over its WebSocket stream and its
//! room's feed subscription. Intents go through the registry; committed
//! changes come back through the feed, already filtered to this actor's
//! audience. A dropped connection never flips presence by itself — the
//! background sweeper does that after the offline timeout, so a fast
//! reconnect is invisible to other players.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::feed::{Audience, ChangeFeed, FeedRecvError, FeedSubscription};
use crate::presence::{PresenceConfig, PresenceTracker, PresenceTransition};
use crate::privacy::PrivacyGate;
use crate::protocol::{
    ActionPayload, ErrorKind, Frame, HelloPayload, MsgType, Notice, SnapshotPayload,
};
use crate::record::{ActorToken, RoomId};
use crate::registry::{RoomLimits, RoomRegistry};
use crate::store::{SessionStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Feed channel capacity per room
    pub feed_capacity: usize,
    /// Expected client heartbeat cadence in seconds
    pub heartbeat_interval_secs: u64,
    /// Silence before a player is marked offline
    pub offline_timeout_secs: u64,
    /// Idle window before a session expires entirely
    pub expiry_window_secs: u64,
    /// Cadence of the expired-session sweep
    pub expiry_sweep_interval_secs: u64,
    /// Room capacity bounds and collection cap
    pub limits: RoomLimits,
    /// Persistence path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            feed_capacity: 256,
            heartbeat_interval_secs: 30,
            offline_timeout_secs: 75,
            expiry_window_secs: 86_400,
            expiry_sweep_interval_secs: 600,
            limits: RoomLimits::default(),
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// Everything a connection task needs, cheap to clone.
#[derive(Clone)]
struct ServerShared {
    registry: Arc<RoomRegistry>,
    feed: Arc<ChangeFeed>,
    tracker: Arc<PresenceTracker>,
    stats: Arc<RwLock<ServerStats>>,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    shared: ServerShared,
}

impl SyncServer {
    /// Create a server with the given configuration, opening the session
    /// store (persistent if `storage_path` is set).
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store_config = match &config.storage_path {
            Some(path) => StoreConfig::persistent(path.clone()),
            None => StoreConfig::in_memory(),
        };
        let store = Arc::new(SessionStore::open(store_config)?);
        let gate = Arc::new(PrivacyGate::new(store.clone(), config.expiry_window_secs));
        let feed = Arc::new(ChangeFeed::new(config.feed_capacity));
        let registry = Arc::new(RoomRegistry::new(
            store,
            gate,
            feed.clone(),
            config.limits.clone(),
        ));
        let tracker = Arc::new(PresenceTracker::new(PresenceConfig {
            offline_timeout: Duration::from_secs(config.offline_timeout_secs),
            ..PresenceConfig::default()
        }));

        Ok(Self {
            config,
            shared: ServerShared {
                registry,
                feed,
                tracker,
                stats: Arc::new(RwLock::new(ServerStats::default())),
            },
        })
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Result<Self, StoreError> {
        Self::new(ServerConfig::default())
    }

    /// Persistent server at the given path.
    pub fn with_storage(
        bind_addr: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    /// Bind and serve until the task is dropped.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.run_on(listener).await
    }

    /// Serve on an already-bound listener (lets tests bind port 0 and read
    /// the real address back).
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        self.spawn_presence_sweeper();
        self.spawn_expiry_sweeper();

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Flip silent players offline on a timer and announce the flips.
    /// Crucially, a closed socket alone never triggers this.
    fn spawn_presence_sweeper(&self) {
        let shared = self.shared.clone();
        let period = Duration::from_secs((self.config.offline_timeout_secs / 3).max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let transitions = shared.tracker.sweep().await;
                for t in transitions {
                    publish_presence(&shared.feed, &t).await;
                }
            }
        });
    }

    /// Drop sessions idle past the expiry window.
    fn spawn_expiry_sweeper(&self) {
        let shared = self.shared.clone();
        let period = Duration::from_secs(self.config.expiry_sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match shared.registry.expire_players().await {
                    Ok(0) => {}
                    Ok(n) => log::info!("Expired {n} idle sessions"),
                    Err(e) => log::error!("Expiry sweep failed: {e}"),
                }
            }
        });
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.shared.stats.read().await.clone();
        stats.active_rooms = self.shared.feed.room_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.shared.registry
    }

    pub fn tracker(&self) -> &Arc<PresenceTracker> {
        &self.shared.tracker
    }
}

async fn publish_presence(feed: &ChangeFeed, transition: &PresenceTransition) {
    feed.publish_ephemeral(
        transition.room_id,
        Notice::PresenceChanged {
            token: transition.actor,
            presence: transition.presence,
        },
        Audience::Everyone,
    )
    .await;
}

type WsSink = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>;

async fn send_frame(
    sender: &mut WsSink,
    frame: &Frame,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let bytes = frame.encode()?;
    sender.send(Message::Binary(bytes.into())).await?;
    Ok(())
}

async fn send_error(
    sender: &mut WsSink,
    room_id: RoomId,
    seq: u64,
    kind: &ErrorKind,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    log::debug!("Rejecting action seq {seq}: {kind}");
    send_frame(sender, &Frame::error(room_id, seq, kind)?).await
}

/// Session state for one bound connection.
#[derive(Debug)]
struct Session {
    actor: ActorToken,
    room_id: RoomId,
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: ServerShared,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    log::info!("WebSocket connection established from {addr}");
    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut session: Option<Session> = None;
    let mut subscription: Option<FeedSubscription> = None;

    // The loop runs inside a block so a failed send still falls through
    // to the cleanup below instead of returning early.
    let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = shared.stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            let frame = match Frame::decode(&bytes) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Undecodable frame from {addr}: {e}");
                                    continue;
                                }
                            };

                            match frame.msg_type {
                                MsgType::Hello => {
                                    match handshake(&shared, &frame).await {
                                        Ok((new_session, snapshot)) => {
                                            // Subscribe before Welcome so no
                                            // change can slip between snapshot
                                            // and subscription.
                                            subscription = Some(
                                                shared
                                                    .feed
                                                    .subscribe(
                                                        new_session.room_id,
                                                        new_session.actor,
                                                    )
                                                    .await,
                                            );
                                            let welcome =
                                                Frame::welcome(new_session.room_id, &snapshot)?;
                                            send_frame(&mut ws_sender, &welcome).await?;

                                            if let Some(t) = shared
                                                .tracker
                                                .heartbeat(new_session.room_id, new_session.actor)
                                                .await
                                            {
                                                publish_presence(&shared.feed, &t).await;
                                            }
                                            session = Some(new_session);
                                        }
                                        Err(kind) => {
                                            send_error(
                                                &mut ws_sender,
                                                frame.room_id,
                                                frame.seq,
                                                &kind,
                                            )
                                            .await?;
                                            if !kind.is_transient() {
                                                break;
                                            }
                                        }
                                    }
                                }

                                MsgType::Action => {
                                    let Some(ref sess) = session else {
                                        send_error(
                                            &mut ws_sender,
                                            frame.room_id,
                                            frame.seq,
                                            &ErrorKind::Protocol("action before hello".into()),
                                        )
                                        .await?;
                                        continue;
                                    };

                                    let action = match frame.action_payload() {
                                        Ok(a) => a,
                                        Err(e) => {
                                            send_error(
                                                &mut ws_sender,
                                                sess.room_id,
                                                frame.seq,
                                                &e.into(),
                                            )
                                            .await?;
                                            continue;
                                        }
                                    };
                                    let leaving = matches!(
                                        action,
                                        ActionPayload::LeaveRoom
                                    );

                                    match dispatch_action(&shared.registry, sess, action).await {
                                        Ok(()) if leaving => {
                                            shared.tracker.forget(sess.room_id, sess.actor).await;
                                            send_frame(
                                                &mut ws_sender,
                                                &Frame::bye(sess.actor, sess.room_id),
                                            )
                                            .await?;
                                            break;
                                        }
                                        Ok(()) => {
                                            // Authored activity counts as liveness.
                                            if let Some(t) = shared
                                                .tracker
                                                .heartbeat(sess.room_id, sess.actor)
                                                .await
                                            {
                                                publish_presence(&shared.feed, &t).await;
                                            }
                                        }
                                        Err(kind) => {
                                            send_error(
                                                &mut ws_sender,
                                                sess.room_id,
                                                frame.seq,
                                                &kind,
                                            )
                                            .await?;
                                        }
                                    }
                                }

                                MsgType::Heartbeat => {
                                    if let Some(ref sess) = session {
                                        if let Some(t) = shared
                                            .tracker
                                            .heartbeat(sess.room_id, sess.actor)
                                            .await
                                        {
                                            publish_presence(&shared.feed, &t).await;
                                        }
                                        send_frame(
                                            &mut ws_sender,
                                            &Frame::heartbeat_ack(sess.actor, sess.room_id),
                                        )
                                        .await?;
                                    }
                                }

                                MsgType::Resync => {
                                    if let Some(ref sess) = session {
                                        match assemble_snapshot(&shared, sess.actor, sess.room_id)
                                            .await
                                        {
                                            Ok(snapshot) => {
                                                send_frame(
                                                    &mut ws_sender,
                                                    &Frame::snapshot(sess.room_id, &snapshot)?,
                                                )
                                                .await?;
                                            }
                                            Err(kind) => {
                                                send_error(
                                                    &mut ws_sender,
                                                    sess.room_id,
                                                    frame.seq,
                                                    &kind,
                                                )
                                                .await?;
                                            }
                                        }
                                    }
                                }

                                MsgType::Bye => {
                                    log::debug!("Clean detach from {addr}");
                                    break;
                                }

                                other => {
                                    log::debug!("Unhandled frame type {other:?} from {addr}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                event = async {
                    match subscription {
                        Some(ref mut sub) => sub.recv().await,
                        // Not bound to a room yet
                        None => std::future::pending().await,
                    }
                } => {
                    let sess = session.as_ref().ok_or(ErrorKind::ConnectionLost)?;
                    match event {
                        Ok(event) => {
                            let frame = if event.durable {
                                Frame::change(sess.actor, sess.room_id, &event.notice)?
                            } else {
                                Frame::ephemeral(sess.actor, sess.room_id, &event.notice)?
                            };
                            let closing = matches!(event.notice, Notice::RoomClosed);
                            send_frame(&mut ws_sender, &frame).await?;
                            if closing {
                                break;
                            }
                        }
                        Err(FeedRecvError::Lagged(n)) => {
                            // Fell behind the feed; push a fresh snapshot
                            // instead of replaying the gap.
                            log::warn!("Actor {} lagged by {n} events, resyncing", sess.actor);
                            if let Ok(snapshot) =
                                assemble_snapshot(&shared, sess.actor, sess.room_id).await
                            {
                                send_frame(
                                    &mut ws_sender,
                                    &Frame::snapshot(sess.room_id, &snapshot)?,
                                )
                                .await?;
                            }
                        }
                        Err(FeedRecvError::Closed) => break,
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    // A vanished socket is not a departure: presence is left to the
    // sweeper so a quick reconnect stays invisible.
    if let Some(sess) = session {
        shared.feed.drop_if_idle(sess.room_id).await;
        log::info!("Actor {} detached from room {}", sess.actor, sess.room_id);
    }
    {
        let mut s = shared.stats.write().await;
        s.active_connections -= 1;
    }

    result
}

/// Bind the connection to a room: create, join, or re-attach.
async fn handshake(
    shared: &ServerShared,
    frame: &Frame,
) -> Result<(Session, SnapshotPayload), ErrorKind> {
    let actor = frame.actor;
    let hello = frame.hello_payload().map_err(ErrorKind::from)?;

    let room_id = match hello {
        HelloPayload::Create {
            display_name,
            max_players,
        } => {
            let room = shared
                .registry
                .create_room(actor, &display_name, max_players)
                .await?;
            room.room_id
        }
        HelloPayload::Join {
            room_id,
            display_name,
        } => {
            shared
                .registry
                .join_room(room_id, actor, &display_name)
                .await?;
            room_id
        }
        // Attach succeeds iff the snapshot below authorizes the actor.
        HelloPayload::Attach { room_id } => room_id,
    };

    let snapshot = assemble_snapshot(shared, actor, room_id).await?;
    Ok((Session { actor, room_id }, snapshot))
}

async fn assemble_snapshot(
    shared: &ServerShared,
    actor: ActorToken,
    room_id: RoomId,
) -> Result<SnapshotPayload, ErrorKind> {
    let (room, you, others) = shared.registry.snapshot(actor, room_id)?;
    let presence = shared.tracker.snapshot(room_id).await;
    Ok(SnapshotPayload {
        room,
        you,
        others,
        presence,
    })
}

async fn dispatch_action(
    registry: &RoomRegistry,
    sess: &Session,
    action: ActionPayload,
) -> Result<(), ErrorKind> {
    match action {
        ActionPayload::PlaceItem {
            item_id,
            position,
            orientation,
            timestamp_ms,
        } => {
            registry
                .place_item(sess.actor, sess.room_id, item_id, position, orientation, timestamp_ms)
                .await
        }
        ActionPayload::MoveItem {
            item_id,
            position,
            orientation,
            timestamp_ms,
        } => {
            registry
                .move_item(sess.actor, sess.room_id, item_id, position, orientation, timestamp_ms)
                .await
        }
        ActionPayload::ReturnItem {
            item_id,
            timestamp_ms,
        } => {
            registry
                .return_item(sess.actor, sess.room_id, item_id, timestamp_ms)
                .await
        }
        ActionPayload::DiscardItem {
            item_id,
            timestamp_ms,
        } => {
            registry
                .discard_item(sess.actor, sess.room_id, item_id, timestamp_ms)
                .await
        }
        ActionPayload::AddItems {
            items,
            timestamp_ms,
        } => {
            registry
                .add_items(sess.actor, sess.room_id, items, timestamp_ms)
                .await
        }
        ActionPayload::LeaveRoom => registry.leave_room(sess.room_id, sess.actor).await,
        ActionPayload::CloseRoom => registry.close_room(sess.room_id, sess.actor).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.feed_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.offline_timeout_secs, 75);
        assert_eq!(config.expiry_window_secs, 86_400);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults().unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let server = SyncServer::with_storage("127.0.0.1:0", dir.path().join("db")).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults().unwrap();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_frames, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_handshake_create_binds_session() {
        let server = SyncServer::with_defaults().unwrap();
        let actor = ActorToken::generate();
        let hello = HelloPayload::Create {
            display_name: "Host".into(),
            max_players: 4,
        };
        let frame = Frame::hello(actor, &hello).unwrap();

        let (session, snapshot) = handshake(&server.shared, &frame).await.unwrap();
        assert_eq!(session.actor, actor);
        assert_eq!(snapshot.room.creator, actor);
        assert_eq!(snapshot.you.token, actor);
        assert!(snapshot.others.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_attach_requires_membership() {
        let server = SyncServer::with_defaults().unwrap();
        let stranger = ActorToken::generate();
        let frame = Frame::hello(
            stranger,
            &HelloPayload::Attach {
                room_id: RoomId::generate(),
            },
        )
        .unwrap();

        let err = handshake(&server.shared, &frame).await.unwrap_err();
        assert_eq!(err, ErrorKind::AccessDenied);
    }
}
