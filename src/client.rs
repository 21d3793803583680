//! WebSocket sync client with optimistic local state and auto-reconnect.
//!
//! Provides:
//! - Connection lifecycle (create/join/attach, heartbeats, reconnect)
//! - Optimistic local application of the player's own actions
//! - A pending queue for actions authored while disconnected
//!
//! The client keeps a [`LocalCache`] mirror of the room. Its own actions
//! are applied locally before the server confirms them; because every item
//! mutation carries the writer's stamp, the server's echo re-applies as a
//! no-op and a lost race is corrected by the winning change when it
//! arrives. Reconnection re-attaches with the same actor token, diffs the
//! fresh snapshot against the cache, and replays the pending queue with
//! the original stamps.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::presence::Presence;
use crate::protocol::{
    ActionPayload, ErrorKind, Frame, HelloPayload, MsgType, Notice, SnapshotPayload,
};
use crate::record::{
    epoch_millis, ActorToken, ItemId, ItemSpec, Orientation, PlacedItem, PlayerView, Position,
    Room, RoomId,
};
use crate::resolver::WriteStamp;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal: the server rejected the session or reconnection gave up.
    /// Recovery requires a fresh token and a fresh join.
    Expired,
}

/// Reconnect backoff schedule; the last entry repeats.
const BACKOFF_SECS: [u64; 5] = [1, 2, 5, 10, 30];

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Heartbeat cadence while connected
    pub heartbeat_interval: Duration,
    /// Max actions queued while disconnected
    pub pending_capacity: usize,
    /// Reconnect attempts before giving up as Expired
    pub max_reconnect_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            pending_capacity: 1024,
            max_reconnect_attempts: 10,
        }
    }
}

/// Events emitted to the consuming layer.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    /// Connection lost; reconnection starts automatically
    Disconnected,
    Reconnecting {
        attempt: u32,
    },
    /// Terminal; no further events follow
    Expired,
    ItemAdded(PlacedItem),
    ItemMoved {
        item_id: ItemId,
        position: Position,
        orientation: Orientation,
    },
    ItemRemoved(ItemId),
    /// Another player's collection changed (count only), or our own
    /// (contents already reflected in the cache)
    CollectionChanged {
        owner: ActorToken,
        count: u32,
    },
    PlayerJoined(PlayerView),
    PlayerLeft(ActorToken),
    PresenceChanged {
        token: ActorToken,
        presence: Presence,
    },
    RoomClosed,
    /// The server rejected the action sent with this seq
    Rejected {
        seq: u64,
        kind: ErrorKind,
    },
    /// Snapshot reconciliation finished (reconnect or lag recovery); any
    /// differences were already surfaced as the preceding delta events
    Resynced,
}

/// Actions authored while disconnected, kept in order for replay.
///
/// Each entry keeps its original seq and timestamp, so a replayed action
/// resolves against concurrent writes exactly as if it had been delivered
/// when authored.
pub struct PendingQueue {
    queue: VecDeque<(u64, ActionPayload)>,
    max_size: usize,
}

impl PendingQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(256)),
            max_size,
        }
    }

    /// Queue an action for later replay. Returns false when full.
    pub fn enqueue(&mut self, seq: u64, action: ActionPayload) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back((seq, action));
        true
    }

    /// Drain all queued actions in authoring order.
    pub fn drain(&mut self) -> Vec<(u64, ActionPayload)> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Local mirror of the room, updated by notices and snapshots.
#[derive(Debug, Default)]
pub struct LocalCache {
    pub room: Option<Room>,
    pub you: Option<PlayerView>,
    pub others: HashMap<ActorToken, PlayerView>,
    pub presence: HashMap<ActorToken, Presence>,
}

impl LocalCache {
    /// Install a fresh snapshot and return the differences against the
    /// previous contents, as events. On the very first snapshot there is
    /// nothing to diff against and no events are produced; consumers read
    /// the initial state from the cache after `Connected`.
    fn apply_snapshot(&mut self, snapshot: SnapshotPayload) -> Vec<ClientEvent> {
        let old_room = self.room.take();
        let old_you = self.you.take();
        let old_others = std::mem::take(&mut self.others);
        let old_presence = std::mem::take(&mut self.presence);

        self.room = Some(snapshot.room);
        self.you = Some(snapshot.you);
        self.others = snapshot
            .others
            .into_iter()
            .map(|p| (p.token, p))
            .collect();
        self.presence = snapshot.presence.into_iter().collect();

        let Some(old_room) = old_room else {
            return Vec::new();
        };
        let new_room = self.room.as_ref().unwrap();
        let mut events = Vec::new();

        for (token, view) in &self.others {
            match old_others.get(token) {
                None => events.push(ClientEvent::PlayerJoined(view.clone())),
                Some(old) if old.collection_count != view.collection_count => {
                    events.push(ClientEvent::CollectionChanged {
                        owner: *token,
                        count: view.collection_count,
                    });
                }
                Some(_) => {}
            }
        }
        for token in old_others.keys() {
            if !self.others.contains_key(token) {
                events.push(ClientEvent::PlayerLeft(*token));
            }
        }
        if let (Some(old_you), Some(you)) = (old_you, self.you.as_ref()) {
            if old_you.collection_count != you.collection_count {
                events.push(ClientEvent::CollectionChanged {
                    owner: you.token,
                    count: you.collection_count,
                });
            }
        }

        for item in &new_room.surface {
            match old_room.find_item(item.item_id) {
                None => events.push(ClientEvent::ItemAdded(item.clone())),
                Some(old)
                    if old.position.stamp() != item.position.stamp()
                        || old.orientation.stamp() != item.orientation.stamp() =>
                {
                    events.push(ClientEvent::ItemMoved {
                        item_id: item.item_id,
                        position: *item.position.get(),
                        orientation: *item.orientation.get(),
                    });
                }
                Some(_) => {}
            }
        }
        for item in &old_room.surface {
            if new_room.find_item(item.item_id).is_none() {
                events.push(ClientEvent::ItemRemoved(item.item_id));
            }
        }

        for (token, presence) in &self.presence {
            if old_presence.get(token) != Some(presence) {
                events.push(ClientEvent::PresenceChanged {
                    token: *token,
                    presence: *presence,
                });
            }
        }

        if new_room.closed && !old_room.closed {
            events.push(ClientEvent::RoomClosed);
        }
        events
    }

    /// Fold one notice into the cache. Returns the event to surface, or
    /// `None` when the notice changed nothing (our own echo, a lost race).
    fn apply_notice(&mut self, notice: Notice) -> Option<ClientEvent> {
        match notice {
            Notice::ItemAdded { item } => {
                let room = self.room.as_mut()?;
                if room.find_item(item.item_id).is_some() {
                    // Echo of our own optimistic placement
                    return None;
                }
                room.surface.push(item.clone());
                Some(ClientEvent::ItemAdded(item))
            }
            Notice::ItemMoved {
                item_id,
                position,
                orientation,
            } => {
                let room = self.room.as_mut()?;
                let item = room.find_item_mut(item_id)?;
                let moved = item.position.apply(*position.get(), position.stamp());
                let turned = item
                    .orientation
                    .apply(*orientation.get(), orientation.stamp());
                if !moved && !turned {
                    return None;
                }
                Some(ClientEvent::ItemMoved {
                    item_id,
                    position: *item.position.get(),
                    orientation: *item.orientation.get(),
                })
            }
            Notice::ItemRemoved { item_id } => {
                let room = self.room.as_mut()?;
                room.take_item(item_id)?;
                Some(ClientEvent::ItemRemoved(item_id))
            }
            Notice::CollectionChanged {
                owner,
                count,
                items,
            } => {
                if let Some(you) = self.you.as_mut() {
                    if you.token == owner {
                        you.collection_count = count;
                        if let Some(items) = items {
                            you.collection = Some(items);
                        }
                        return Some(ClientEvent::CollectionChanged { owner, count });
                    }
                }
                if let Some(other) = self.others.get_mut(&owner) {
                    other.collection_count = count;
                }
                Some(ClientEvent::CollectionChanged { owner, count })
            }
            Notice::PlayerJoined { player } => {
                if Some(player.token) == self.you.as_ref().map(|y| y.token) {
                    return None;
                }
                self.others.insert(player.token, player.clone());
                Some(ClientEvent::PlayerJoined(player))
            }
            Notice::PlayerLeft { token } => {
                self.others.remove(&token)?;
                self.presence.remove(&token);
                Some(ClientEvent::PlayerLeft(token))
            }
            Notice::PresenceChanged { token, presence } => {
                let previous = self.presence.insert(token, presence);
                if previous == Some(presence) {
                    return None;
                }
                if let Some(other) = self.others.get_mut(&token) {
                    other.online = presence == Presence::Online;
                }
                Some(ClientEvent::PresenceChanged { token, presence })
            }
            Notice::RoomClosed => {
                if let Some(room) = self.room.as_mut() {
                    room.closed = true;
                }
                Some(ClientEvent::RoomClosed)
            }
        }
    }

    /// Apply one of our own actions before the server confirms it.
    fn apply_local(&mut self, actor: ActorToken, action: &ActionPayload) {
        match action {
            ActionPayload::PlaceItem {
                item_id,
                position,
                orientation,
                timestamp_ms,
            } => {
                let Some(spec) = self.take_from_own_collection(*item_id) else {
                    return;
                };
                if let Some(room) = self.room.as_mut() {
                    let stamp = WriteStamp::new(*timestamp_ms, actor);
                    room.surface
                        .push(PlacedItem::new(spec, actor, *position, *orientation, stamp));
                }
            }
            ActionPayload::MoveItem {
                item_id,
                position,
                orientation,
                timestamp_ms,
            } => {
                let stamp = WriteStamp::new(*timestamp_ms, actor);
                if let Some(item) = self
                    .room
                    .as_mut()
                    .and_then(|r| r.find_item_mut(*item_id))
                {
                    item.position.apply(*position, stamp);
                    item.orientation.apply(*orientation, stamp);
                }
            }
            ActionPayload::ReturnItem { item_id, .. } => {
                let taken = self.room.as_mut().and_then(|r| r.take_item(*item_id));
                if let (Some(taken), Some(you)) = (taken, self.you.as_mut()) {
                    if let Some(collection) = you.collection.as_mut() {
                        collection.push(taken.spec);
                        you.collection_count = collection.len() as u32;
                    }
                }
            }
            ActionPayload::DiscardItem { item_id, .. } => {
                if let Some(room) = self.room.as_mut() {
                    room.take_item(*item_id);
                }
            }
            ActionPayload::AddItems { items, .. } => {
                if let Some(you) = self.you.as_mut() {
                    if let Some(collection) = you.collection.as_mut() {
                        collection.extend(items.iter().cloned());
                        you.collection_count = collection.len() as u32;
                    }
                }
            }
            ActionPayload::LeaveRoom | ActionPayload::CloseRoom => {}
        }
    }

    fn take_from_own_collection(&mut self, item_id: ItemId) -> Option<ItemSpec> {
        let you = self.you.as_mut()?;
        let collection = you.collection.as_mut()?;
        let idx = collection.iter().position(|i| i.item_id == item_id)?;
        let spec = collection.remove(idx);
        you.collection_count = collection.len() as u32;
        Some(spec)
    }
}

/// Shared handles cloned into the background tasks.
#[derive(Clone)]
struct ClientShared {
    actor: ActorToken,
    server_url: String,
    config: ClientConfig,
    state: Arc<RwLock<ConnectionState>>,
    room_id: Arc<RwLock<RoomId>>,
    cache: Arc<RwLock<LocalCache>>,
    pending: Arc<Mutex<PendingQueue>>,
    outgoing_tx: Arc<RwLock<Option<mpsc::Sender<Frame>>>>,
    event_tx: mpsc::Sender<ClientEvent>,
    shutdown: Arc<AtomicBool>,
}

/// The sync client.
pub struct SyncClient {
    shared: ClientShared,
    seq: AtomicU64,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
}

impl SyncClient {
    /// Create a detached client for the given actor token.
    pub fn new(actor: ActorToken, server_url: impl Into<String>, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let pending_capacity = config.pending_capacity;
        Self {
            shared: ClientShared {
                actor,
                server_url: server_url.into(),
                config,
                state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
                room_id: Arc::new(RwLock::new(RoomId::nil())),
                cache: Arc::new(RwLock::new(LocalCache::default())),
                pending: Arc::new(Mutex::new(PendingQueue::new(pending_capacity))),
                outgoing_tx: Arc::new(RwLock::new(None)),
                event_tx,
                shutdown: Arc::new(AtomicBool::new(false)),
            },
            seq: AtomicU64::new(0),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect and create a room, becoming its creator.
    pub async fn create_room(
        &self,
        display_name: impl Into<String>,
        max_players: u8,
    ) -> Result<RoomId, ErrorKind> {
        self.shared
            .establish(HelloPayload::Create {
                display_name: display_name.into(),
                max_players,
            })
            .await?;
        Ok(*self.shared.room_id.read().await)
    }

    /// Connect and join an existing room.
    pub async fn join_room(
        &self,
        room_id: RoomId,
        display_name: impl Into<String>,
    ) -> Result<(), ErrorKind> {
        self.shared
            .establish(HelloPayload::Join {
                room_id,
                display_name: display_name.into(),
            })
            .await
    }

    /// Re-attach to a room this token already belongs to.
    pub async fn attach(&self, room_id: RoomId) -> Result<(), ErrorKind> {
        self.shared.establish(HelloPayload::Attach { room_id }).await
    }

    /// Submit an action: applied to the local cache immediately, sent if
    /// connected, queued for replay otherwise.
    pub async fn submit(&self, action: ActionPayload) -> Result<u64, ErrorKind> {
        let state = *self.shared.state.read().await;
        if state == ConnectionState::Expired {
            return Err(ErrorKind::SessionExpired);
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut cache = self.shared.cache.write().await;
            cache.apply_local(self.shared.actor, &action);
        }

        let tx = self.shared.outgoing_tx.read().await.clone();
        match (state, tx) {
            (ConnectionState::Connected, Some(tx)) => {
                let room_id = *self.shared.room_id.read().await;
                let frame = Frame::action(self.shared.actor, room_id, seq, &action)
                    .map_err(ErrorKind::from)?;
                if tx.send(frame).await.is_err() {
                    let mut pending = self.shared.pending.lock().await;
                    if !pending.enqueue(seq, action) {
                        return Err(ErrorKind::ConnectionLost);
                    }
                }
            }
            _ => {
                let mut pending = self.shared.pending.lock().await;
                if !pending.enqueue(seq, action) {
                    return Err(ErrorKind::ConnectionLost);
                }
            }
        }
        Ok(seq)
    }

    pub async fn place_item(
        &self,
        item_id: ItemId,
        position: Position,
        orientation: Orientation,
    ) -> Result<u64, ErrorKind> {
        self.submit(ActionPayload::PlaceItem {
            item_id,
            position,
            orientation,
            timestamp_ms: epoch_millis(),
        })
        .await
    }

    pub async fn move_item(
        &self,
        item_id: ItemId,
        position: Position,
        orientation: Orientation,
    ) -> Result<u64, ErrorKind> {
        self.submit(ActionPayload::MoveItem {
            item_id,
            position,
            orientation,
            timestamp_ms: epoch_millis(),
        })
        .await
    }

    pub async fn return_item(&self, item_id: ItemId) -> Result<u64, ErrorKind> {
        self.submit(ActionPayload::ReturnItem {
            item_id,
            timestamp_ms: epoch_millis(),
        })
        .await
    }

    pub async fn discard_item(&self, item_id: ItemId) -> Result<u64, ErrorKind> {
        self.submit(ActionPayload::DiscardItem {
            item_id,
            timestamp_ms: epoch_millis(),
        })
        .await
    }

    pub async fn add_items(&self, items: Vec<ItemSpec>) -> Result<u64, ErrorKind> {
        self.submit(ActionPayload::AddItems {
            items,
            timestamp_ms: epoch_millis(),
        })
        .await
    }

    /// Request a fresh snapshot from the server.
    pub async fn resync(&self) -> Result<(), ErrorKind> {
        let tx = self
            .shared
            .outgoing_tx
            .read()
            .await
            .clone()
            .ok_or(ErrorKind::ConnectionLost)?;
        let room_id = *self.shared.room_id.read().await;
        tx.send(Frame::resync(self.shared.actor, room_id, 0))
            .await
            .map_err(|_| ErrorKind::ConnectionLost)
    }

    /// Leave the room and disconnect cleanly.
    pub async fn leave(&self) -> Result<(), ErrorKind> {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(tx) = self.shared.outgoing_tx.read().await.clone() {
            let room_id = *self.shared.room_id.read().await;
            let frame = Frame::action(self.shared.actor, room_id, seq, &ActionPayload::LeaveRoom)
                .map_err(ErrorKind::from)?;
            let _ = tx.send(frame).await;
        }
        *self.shared.state.write().await = ConnectionState::Disconnected;
        Ok(())
    }

    /// Detach without leaving: the session survives on the server until
    /// the expiry window elapses.
    pub async fn disconnect(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(tx) = self.shared.outgoing_tx.write().await.take() {
            let room_id = *self.shared.room_id.read().await;
            let _ = tx.send(Frame::bye(self.shared.actor, room_id)).await;
        }
        *self.shared.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    pub fn actor(&self) -> ActorToken {
        self.shared.actor
    }

    pub async fn room_id(&self) -> RoomId {
        *self.shared.room_id.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.shared.server_url
    }

    pub async fn pending_len(&self) -> usize {
        self.shared.pending.lock().await.len()
    }

    /// Read access to the local mirror.
    pub async fn with_cache<T>(&self, f: impl FnOnce(&LocalCache) -> T) -> T {
        let cache = self.shared.cache.read().await;
        f(&cache)
    }
}

impl ClientShared {
    /// Dial, handshake, and hand the connection to the background tasks.
    async fn establish(&self, hello: HelloPayload) -> Result<(), ErrorKind> {
        {
            let mut state = self.state.write().await;
            if *state == ConnectionState::Expired {
                return Err(ErrorKind::SessionExpired);
            }
            if *state != ConnectionState::Reconnecting {
                *state = ConnectionState::Connecting;
            }
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.server_url)
            .await
            .map_err(|e| {
                log::debug!("Dial failed: {e}");
                ErrorKind::ConnectionLost
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let hello_frame = Frame::hello(self.actor, &hello).map_err(ErrorKind::from)?;
        let encoded = hello_frame.encode().map_err(ErrorKind::from)?;
        ws_writer
            .send(Message::Binary(encoded.into()))
            .await
            .map_err(|_| ErrorKind::ConnectionLost)?;

        // The first server frame decides the session: Welcome or Error.
        let welcome = loop {
            match ws_reader.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    let frame = Frame::decode(&bytes).map_err(ErrorKind::from)?;
                    match frame.msg_type {
                        MsgType::Welcome => break frame,
                        MsgType::Error => {
                            let kind = frame.error_kind().map_err(ErrorKind::from)?;
                            if kind == ErrorKind::SessionExpired {
                                self.enter_expired().await;
                            }
                            return Err(kind);
                        }
                        other => {
                            log::debug!("Ignoring {other:?} before welcome");
                        }
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return Err(ErrorKind::ConnectionLost),
            }
        };

        let room_id = welcome.room_id;
        let snapshot = welcome.snapshot_payload().map_err(ErrorKind::from)?;
        *self.room_id.write().await = room_id;
        let deltas = self.cache.write().await.apply_snapshot(snapshot);

        // Writer task owns the sink; everything else goes through the
        // channel so sends never interleave mid-frame.
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(256);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let encoded = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::warn!("Dropping unencodable frame: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                    break;
                }
            }
        });
        *self.outgoing_tx.write().await = Some(out_tx.clone());

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;
        for event in deltas {
            let _ = self.event_tx.send(event).await;
        }
        log::info!("Connected to room {room_id} as {}", self.actor);

        self.replay_pending(&out_tx, room_id).await;
        self.spawn_heartbeat(out_tx, room_id);
        self.spawn_reader(ws_reader);
        Ok(())
    }

    /// Replay actions queued while disconnected, oldest first.
    async fn replay_pending(&self, tx: &mpsc::Sender<Frame>, room_id: RoomId) {
        let queued = self.pending.lock().await.drain();
        if queued.is_empty() {
            return;
        }
        log::info!("Replaying {} queued actions", queued.len());
        for (seq, action) in queued {
            match Frame::action(self.actor, room_id, seq, &action) {
                Ok(frame) => {
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => log::warn!("Dropping unencodable queued action: {e}"),
            }
        }
    }

    fn spawn_heartbeat(&self, tx: mpsc::Sender<Frame>, room_id: RoomId) {
        let actor = self.actor;
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                if tx.send(Frame::heartbeat(actor, room_id)).await.is_err() {
                    break;
                }
            }
        });
    }

    fn spawn_reader(
        &self,
        mut ws_reader: futures_util::stream::SplitStream<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
        >,
    ) {
        let shared = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let frame = match Frame::decode(&bytes) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Undecodable server frame: {e}");
                                continue;
                            }
                        };
                        if shared.handle_frame(frame).await {
                            return; // terminal, no reconnect
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            if shared.shutdown.load(Ordering::SeqCst) {
                return;
            }
            *shared.state.write().await = ConnectionState::Disconnected;
            *shared.outgoing_tx.write().await = None;
            let _ = shared.event_tx.send(ClientEvent::Disconnected).await;
            shared.run_reconnect().await;
        });
    }

    /// Process one server frame. Returns true when the session is over.
    async fn handle_frame(&self, frame: Frame) -> bool {
        match frame.msg_type {
            MsgType::Change | MsgType::Ephemeral => {
                let notice = match frame.notice() {
                    Ok(n) => n,
                    Err(e) => {
                        log::warn!("Bad notice payload: {e}");
                        return false;
                    }
                };
                let closing = matches!(notice, Notice::RoomClosed);
                let event = self.cache.write().await.apply_notice(notice);
                if let Some(event) = event {
                    let _ = self.event_tx.send(event).await;
                }
                if closing {
                    self.shutdown.store(true, Ordering::SeqCst);
                    *self.state.write().await = ConnectionState::Disconnected;
                    return true;
                }
            }
            MsgType::Snapshot => match frame.snapshot_payload() {
                Ok(snapshot) => {
                    let deltas = self.cache.write().await.apply_snapshot(snapshot);
                    for event in deltas {
                        let _ = self.event_tx.send(event).await;
                    }
                    let _ = self.event_tx.send(ClientEvent::Resynced).await;
                }
                Err(e) => log::warn!("Bad snapshot payload: {e}"),
            },
            MsgType::Error => {
                let kind = match frame.error_kind() {
                    Ok(k) => k,
                    Err(e) => {
                        log::warn!("Bad error payload: {e}");
                        return false;
                    }
                };
                if kind == ErrorKind::SessionExpired {
                    self.enter_expired().await;
                    return true;
                }
                let _ = self
                    .event_tx
                    .send(ClientEvent::Rejected {
                        seq: frame.seq,
                        kind,
                    })
                    .await;
                // The rejected action was already applied optimistically;
                // roll the cache back from a fresh snapshot.
                self.request_resync().await;
            }
            MsgType::HeartbeatAck => {}
            other => log::debug!("Unhandled server frame {other:?}"),
        }
        false
    }

    /// Re-attach with backoff until connected, expired, or out of attempts.
    async fn run_reconnect(&self) {
        let room_id = *self.room_id.read().await;
        for attempt in 1..=self.config.max_reconnect_attempts {
            let delay = BACKOFF_SECS[(attempt as usize - 1).min(BACKOFF_SECS.len() - 1)];
            tokio::time::sleep(Duration::from_secs(delay)).await;
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            *self.state.write().await = ConnectionState::Reconnecting;
            let _ = self
                .event_tx
                .send(ClientEvent::Reconnecting { attempt })
                .await;
            log::info!("Reconnect attempt {attempt} to room {room_id}");

            match self.establish(HelloPayload::Attach { room_id }).await {
                Ok(()) => return,
                Err(ErrorKind::SessionExpired) => return,
                Err(e) => log::debug!("Reconnect attempt {attempt} failed: {e}"),
            }
        }
        log::warn!("Giving up reconnecting to room {room_id}");
        self.enter_expired().await;
    }

    /// Ask the server for a fresh snapshot; a no-op while disconnected
    /// (the next `Welcome` carries one anyway).
    async fn request_resync(&self) {
        let tx = self.outgoing_tx.read().await.clone();
        if let Some(tx) = tx {
            let room_id = *self.room_id.read().await;
            let _ = tx.send(Frame::resync(self.actor, room_id, 0)).await;
        }
    }

    async fn enter_expired(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        *self.state.write().await = ConnectionState::Expired;
        *self.outgoing_tx.write().await = None;
        let _ = self.event_tx.send(ClientEvent::Expired).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::Lww;

    fn client() -> SyncClient {
        SyncClient::new(
            ActorToken::generate(),
            "ws://127.0.0.1:9090",
            ClientConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let c = client();
        assert_eq!(c.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(c.pending_len().await, 0);
        assert_eq!(c.room_id().await, RoomId::nil());
    }

    #[tokio::test]
    async fn test_take_event_rx_once() {
        let mut c = client();
        assert!(c.take_event_rx().is_some());
        assert!(c.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_submit_offline_queues() {
        let c = client();
        let seq1 = c
            .move_item(
                ItemId::generate(),
                Position::new(1.0, 1.0),
                Orientation::default(),
            )
            .await
            .unwrap();
        let seq2 = c.discard_item(ItemId::generate()).await.unwrap();

        assert!(seq2 > seq1);
        assert_eq!(c.pending_len().await, 2);
    }

    #[test]
    fn test_pending_queue_capacity() {
        let mut queue = PendingQueue::new(2);
        assert!(queue.enqueue(1, ActionPayload::LeaveRoom));
        assert!(queue.enqueue(2, ActionPayload::LeaveRoom));
        assert!(!queue.enqueue(3, ActionPayload::LeaveRoom));
        assert_eq!(queue.len(), 2);

        let drained = queue.drain();
        assert_eq!(drained[0].0, 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_cache_item_notice_echo_is_noop() {
        let actor = ActorToken::generate();
        let mut cache = LocalCache::default();
        let mut room = Room::new(actor, 4);
        room.player_count = 1;
        cache.room = Some(room);

        let spec = ItemSpec::new("pawn");
        let item_id = spec.item_id;
        let action = ActionPayload::PlaceItem {
            item_id,
            position: Position::new(1.0, 2.0),
            orientation: Orientation::default(),
            timestamp_ms: 100,
        };
        cache.you = Some(PlayerView {
            token: actor,
            display_name: "Me".into(),
            is_creator: true,
            online: true,
            collection_count: 1,
            collection: Some(vec![spec.clone()]),
        });

        cache.apply_local(actor, &action);
        assert!(cache.room.as_ref().unwrap().find_item(item_id).is_some());
        assert_eq!(cache.you.as_ref().unwrap().collection_count, 0);

        // Server echo of the same placement must not duplicate the item
        let stamp = WriteStamp::new(100, actor);
        let echo = Notice::ItemAdded {
            item: PlacedItem::new(spec, actor, Position::new(1.0, 2.0), Orientation::default(), stamp),
        };
        assert!(cache.apply_notice(echo).is_none());
        assert_eq!(cache.room.as_ref().unwrap().surface.len(), 1);
    }

    #[tokio::test]
    async fn test_cache_stale_move_loses() {
        let actor = ActorToken::generate();
        let rival = ActorToken::generate();
        let mut cache = LocalCache::default();
        let mut room = Room::new(actor, 4);
        let spec = ItemSpec::new("rook");
        let item_id = spec.item_id;
        room.surface.push(PlacedItem::new(
            spec,
            actor,
            Position::new(0.0, 0.0),
            Orientation::default(),
            WriteStamp::new(50, actor),
        ));
        cache.room = Some(room);

        // Rival's newer move wins
        let newer = Notice::ItemMoved {
            item_id,
            position: Lww::new(Position::new(9.0, 9.0), WriteStamp::new(200, rival)),
            orientation: Lww::new(Orientation::default(), WriteStamp::new(200, rival)),
        };
        assert!(cache.apply_notice(newer).is_some());

        // Our older stamp arrives late and changes nothing
        let stale = Notice::ItemMoved {
            item_id,
            position: Lww::new(Position::new(1.0, 1.0), WriteStamp::new(100, actor)),
            orientation: Lww::new(Orientation::default(), WriteStamp::new(100, actor)),
        };
        assert!(cache.apply_notice(stale).is_none());

        let item = cache.room.as_ref().unwrap().find_item(item_id).unwrap();
        assert_eq!(item.position.get().x, 9.0);
    }

    #[tokio::test]
    async fn test_cache_presence_dedup() {
        let mut cache = LocalCache::default();
        let token = ActorToken::generate();
        let notice = Notice::PresenceChanged {
            token,
            presence: Presence::Offline,
        };
        assert!(cache.apply_notice(notice.clone()).is_some());
        assert!(cache.apply_notice(notice).is_none());
    }

    #[test]
    fn test_snapshot_diff_emits_only_deltas() {
        let actor = ActorToken::generate();
        let newcomer = ActorToken::generate();
        let mut cache = LocalCache::default();

        let you = PlayerView {
            token: actor,
            display_name: "Me".into(),
            is_creator: true,
            online: true,
            collection_count: 0,
            collection: Some(Vec::new()),
        };
        let mut room = Room::new(actor, 4);
        room.player_count = 1;
        let moved_spec = ItemSpec::new("token");
        let moved_id = moved_spec.item_id;
        let gone_spec = ItemSpec::new("counter");
        let gone_id = gone_spec.item_id;
        room.surface.push(PlacedItem::new(
            moved_spec,
            actor,
            Position::new(0.0, 0.0),
            Orientation::default(),
            WriteStamp::new(10, actor),
        ));
        room.surface.push(PlacedItem::new(
            gone_spec,
            actor,
            Position::new(5.0, 5.0),
            Orientation::default(),
            WriteStamp::new(10, actor),
        ));

        // First snapshot: nothing to diff against
        let first = SnapshotPayload {
            room: room.clone(),
            you: you.clone(),
            others: Vec::new(),
            presence: vec![(actor, Presence::Online)],
        };
        assert!(cache.apply_snapshot(first).is_empty());

        // Second snapshot: the item moved, the other item vanished, and a
        // new player appeared while we were away
        let mut later = room.clone();
        later.player_count = 2;
        later.take_item(gone_id);
        later
            .find_item_mut(moved_id)
            .unwrap()
            .position
            .apply(Position::new(7.0, 7.0), WriteStamp::new(20, newcomer));
        let second = SnapshotPayload {
            room: later,
            you,
            others: vec![PlayerView {
                token: newcomer,
                display_name: "Late".into(),
                is_creator: false,
                online: true,
                collection_count: 0,
                collection: None,
            }],
            presence: vec![(actor, Presence::Online), (newcomer, Presence::Online)],
        };
        let deltas = cache.apply_snapshot(second);

        assert_eq!(deltas.len(), 4);
        assert!(deltas
            .iter()
            .any(|e| matches!(e, ClientEvent::PlayerJoined(v) if v.token == newcomer)));
        assert!(deltas.iter().any(
            |e| matches!(e, ClientEvent::ItemMoved { item_id, position, .. }
                if *item_id == moved_id && position.x == 7.0)
        ));
        assert!(deltas
            .iter()
            .any(|e| matches!(e, ClientEvent::ItemRemoved(id) if *id == gone_id)));
        assert!(deltas.iter().any(
            |e| matches!(e, ClientEvent::PresenceChanged { token, presence: Presence::Online }
                if *token == newcomer)
        ));
    }

    #[tokio::test]
    async fn test_expired_blocks_submit() {
        let c = client();
        c.shared.enter_expired().await;
        let err = c.discard_item(ItemId::generate()).await.unwrap_err();
        assert_eq!(err, ErrorKind::SessionExpired);
    }
}
