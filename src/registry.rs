//! Room and player lifecycle plus the surface/collection operations.
//!
//! Every mutation here is a read-modify-commit loop over the store's
//! versioned records: read the current versions, apply the change, commit
//! with the expected versions, retry on `VersionConflict`. Retries are
//! bounded; exhaustion surfaces the conflict, which callers treat as
//! transient. Cross-record moves (hand ↔ surface) go through a single
//! commit so a crash can never leave an item in both places.
//!
//! After a successful commit the change is published on the feed with a
//! privacy-scoped audience; publication happens outside the retry loop.

use std::sync::Arc;

use crate::feed::{Audience, ChangeFeed};
use crate::privacy::{Operation, PrivacyGate, RecordKind};
use crate::protocol::{ErrorKind, Notice};
use crate::record::{
    epoch_secs, ActorToken, ItemId, ItemSpec, Orientation, PlacedItem, Player, PlayerView,
    Position, Room, RoomId, RoomSummary,
};
use crate::resolver::WriteStamp;
use crate::store::{RecordWrite, SessionStore, StoreError};

/// Externally injectable room constants.
#[derive(Debug, Clone)]
pub struct RoomLimits {
    pub min_players: u8,
    pub max_players_bound: u8,
    /// Private-collection size cap.
    pub collection_cap: usize,
}

impl Default for RoomLimits {
    fn default() -> Self {
        Self {
            min_players: 2,
            max_players_bound: 8,
            collection_cap: 20,
        }
    }
}

/// Bounded retries before a version conflict surfaces.
const CAS_RETRIES: usize = 16;

/// The engine facade: lifecycle + intents, over store + gate + feed.
pub struct RoomRegistry {
    store: Arc<SessionStore>,
    gate: Arc<PrivacyGate>,
    feed: Arc<ChangeFeed>,
    limits: RoomLimits,
}

impl RoomRegistry {
    pub fn new(
        store: Arc<SessionStore>,
        gate: Arc<PrivacyGate>,
        feed: Arc<ChangeFeed>,
        limits: RoomLimits,
    ) -> Self {
        Self {
            store,
            gate,
            feed,
            limits,
        }
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Create a room and its creator's player row in one commit.
    ///
    /// The creator counts toward capacity immediately, keeping the
    /// `player_count == non-expired rows` invariant from the first write.
    pub async fn create_room(
        &self,
        creator: ActorToken,
        display_name: &str,
        max_players: u8,
    ) -> Result<Room, ErrorKind> {
        if max_players < self.limits.min_players || max_players > self.limits.max_players_bound {
            return Err(ErrorKind::Protocol(format!(
                "max_players must be {}..={}",
                self.limits.min_players, self.limits.max_players_bound
            )));
        }
        self.reject_bound_token(creator)?;

        let mut room = Room::new(creator, max_players);
        room.player_count = 1;
        let player = Player::new(creator, room.room_id, display_name, true);

        self.store
            .commit(vec![
                RecordWrite::PutRoom {
                    expect: None,
                    room: room.clone(),
                },
                RecordWrite::PutPlayer {
                    expect: None,
                    player,
                },
            ])
            .map_err(map_store_err)?;

        log::info!("Room {} created by {creator} (cap {max_players})", room.room_id);
        Ok(room)
    }

    /// Join an existing room. Re-joining with a token that already holds a
    /// non-expired row in this room is idempotent.
    pub async fn join_room(
        &self,
        room_id: RoomId,
        token: ActorToken,
        display_name: &str,
    ) -> Result<PlayerView, ErrorKind> {
        if let Some(existing) = self.store.find_player(token).map_err(map_store_err)? {
            if existing.is_expired(epoch_secs(), self.gate.expiry_window_secs()) {
                return Err(ErrorKind::SessionExpired);
            }
            if existing.room_id == room_id {
                return Ok(self.gate.view_player(token, &existing));
            }
            return Err(ErrorKind::Protocol("token bound to another room".into()));
        }

        let player = Player::new(token, room_id, display_name, false);

        for _ in 0..CAS_RETRIES {
            let mut room = self.store.get_room(room_id).map_err(map_store_err)?;
            if room.closed {
                return Err(ErrorKind::RoomClosed);
            }
            if !room.has_capacity() {
                // A seat may be held by an expired row the sweep has not
                // collected yet; recount live players before giving up.
                let live = self.reconcile_player_count(room_id).await?;
                if live >= room.max_players {
                    return Err(ErrorKind::RoomFull);
                }
                continue;
            }

            let expect = Some(room.version);
            room.player_count += 1;
            room.version += 1;

            match self.store.commit(vec![
                RecordWrite::PutRoom { expect, room },
                RecordWrite::PutPlayer {
                    expect: None,
                    player: player.clone(),
                },
            ]) {
                Ok(()) => {
                    let announced = self.gate.view_player(ActorToken::nil(), &player);
                    self.feed
                        .publish_change(
                            room_id,
                            Notice::PlayerJoined { player: announced },
                            Audience::Everyone,
                        )
                        .await;
                    log::info!("Player {token} joined room {room_id}");
                    return Ok(self.gate.view_player(token, &player));
                }
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(map_store_err(e)),
            }
        }
        Err(ErrorKind::VersionConflict)
    }

    /// Remove a player. Leaving twice (or leaving an unknown room) is a
    /// no-op, not an error.
    pub async fn leave_room(&self, room_id: RoomId, token: ActorToken) -> Result<(), ErrorKind> {
        let player = match self.store.find_player(token).map_err(map_store_err)? {
            Some(p) if p.room_id == room_id => p,
            _ => return Ok(()),
        };

        for _ in 0..CAS_RETRIES {
            let room = self.store.find_room(room_id).map_err(map_store_err)?;
            let mut writes = vec![RecordWrite::DeletePlayer { token }];
            if let Some(mut room) = room {
                let expect = Some(room.version);
                room.player_count = room.player_count.saturating_sub(1);
                room.version += 1;
                writes.push(RecordWrite::PutRoom { expect, room });
            }

            match self.store.commit(writes) {
                Ok(()) => {
                    self.feed
                        .publish_change(room_id, Notice::PlayerLeft { token }, Audience::Everyone)
                        .await;
                    log::info!("Player {} left room {room_id}", player.token);
                    return Ok(());
                }
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(map_store_err(e)),
            }
        }
        Err(ErrorKind::VersionConflict)
    }

    /// Close a room. Creator-only; idempotent; `closed` never reverts.
    pub async fn close_room(&self, room_id: RoomId, actor: ActorToken) -> Result<(), ErrorKind> {
        for _ in 0..CAS_RETRIES {
            let mut room = self.store.get_room(room_id).map_err(map_store_err)?;
            if room.creator != actor {
                return Err(ErrorKind::NotAuthorized);
            }
            if room.closed {
                return Ok(());
            }

            let expect = Some(room.version);
            room.closed = true;
            room.version += 1;

            match self.store.commit(vec![RecordWrite::PutRoom { expect, room }]) {
                Ok(()) => {
                    self.feed
                        .publish_ephemeral(room_id, Notice::RoomClosed, Audience::Everyone)
                        .await;
                    log::info!("Room {room_id} closed by creator");
                    return Ok(());
                }
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(map_store_err(e)),
            }
        }
        Err(ErrorKind::VersionConflict)
    }

    /// Lobby listing: rooms that are open and have a free seat.
    pub fn list_open_rooms(&self) -> Result<Vec<RoomSummary>, ErrorKind> {
        let rooms = self.store.list_rooms().map_err(map_store_err)?;
        Ok(rooms
            .iter()
            .filter(|r| !r.closed && r.has_capacity())
            .map(RoomSummary::from)
            .collect())
    }

    // ─── Surface intents ──────────────────────────────────────────────

    /// Move an item from the actor's private collection onto the surface.
    /// One commit across both rows — the item is never in both places.
    pub async fn place_item(
        &self,
        actor: ActorToken,
        room_id: RoomId,
        item_id: ItemId,
        position: Position,
        orientation: Orientation,
        timestamp_ms: u64,
    ) -> Result<(), ErrorKind> {
        self.gate.authorize(
            actor,
            room_id,
            RecordKind::PrivateCollection,
            Some(actor),
            Operation::Write,
        )?;
        let stamp = WriteStamp::new(timestamp_ms, actor);

        let outcome = self
            .cas_loop(|| {
                let mut player = self.gate.require_member(actor, room_id)?;
                let spec = player
                    .take_from_collection(item_id)
                    .ok_or(ErrorKind::ItemNotFound)?;

                let mut room = self.store.get_room(room_id).map_err(map_store_err)?;
                if room.closed {
                    return Err(ErrorKind::RoomClosed);
                }

                let placed = PlacedItem::new(spec, actor, position, orientation, stamp);
                let room_expect = Some(room.version);
                let player_expect = Some(player.version);
                room.surface.push(placed.clone());
                room.version += 1;
                player.collection_stamp = stamp;
                player.touch();
                player.version += 1;

                let count = player.collection.len() as u32;
                let items = player.collection.clone();
                self.try_commit(vec![
                    RecordWrite::PutRoom {
                        expect: room_expect,
                        room,
                    },
                    RecordWrite::PutPlayer {
                        expect: player_expect,
                        player,
                    },
                ])
                .map(|committed| committed.then_some((placed, count, items)))
            })
            .await?;

        let (placed, count, items) = outcome;
        self.feed
            .publish_change(room_id, Notice::ItemAdded { item: placed }, Audience::Everyone)
            .await;
        self.publish_collection_change(room_id, actor, count, items)
            .await;
        Ok(())
    }

    /// Reposition / reorient a placed item. A stale stamp loses silently —
    /// the authoritative value is re-announced either way.
    pub async fn move_item(
        &self,
        actor: ActorToken,
        room_id: RoomId,
        item_id: ItemId,
        position: Position,
        orientation: Orientation,
        timestamp_ms: u64,
    ) -> Result<(), ErrorKind> {
        self.gate
            .authorize(actor, room_id, RecordKind::SharedSurface, None, Operation::Write)?;
        let stamp = WriteStamp::new(timestamp_ms, actor);

        let notice = self
            .cas_loop(|| {
                let mut room = self.store.get_room(room_id).map_err(map_store_err)?;
                if room.closed {
                    return Err(ErrorKind::RoomClosed);
                }
                let expect = Some(room.version);
                let item = room.find_item_mut(item_id).ok_or(ErrorKind::ItemNotFound)?;

                let moved = item.position.apply(position, stamp);
                let turned = item.orientation.apply(orientation, stamp);
                let notice = Notice::ItemMoved {
                    item_id,
                    position: item.position.clone(),
                    orientation: item.orientation.clone(),
                };
                if !moved && !turned {
                    // Lost the race on both fields; nothing to write.
                    return Ok(Some(notice));
                }

                room.version += 1;
                self.try_commit(vec![RecordWrite::PutRoom { expect, room }])
                    .map(|committed| committed.then_some(notice))
            })
            .await?;

        self.feed
            .publish_change(room_id, notice, Audience::Everyone)
            .await;
        Ok(())
    }

    /// Move an item from the surface back into the actor's collection.
    pub async fn return_item(
        &self,
        actor: ActorToken,
        room_id: RoomId,
        item_id: ItemId,
        timestamp_ms: u64,
    ) -> Result<(), ErrorKind> {
        self.gate.authorize(
            actor,
            room_id,
            RecordKind::PrivateCollection,
            Some(actor),
            Operation::Write,
        )?;
        let stamp = WriteStamp::new(timestamp_ms, actor);

        let (count, items) = self
            .cas_loop(|| {
                let mut player = self.gate.require_member(actor, room_id)?;
                if player.collection.len() >= self.limits.collection_cap {
                    return Err(ErrorKind::CollectionFull);
                }

                let mut room = self.store.get_room(room_id).map_err(map_store_err)?;
                if room.closed {
                    return Err(ErrorKind::RoomClosed);
                }
                let room_expect = Some(room.version);
                let taken = room.take_item(item_id).ok_or(ErrorKind::ItemNotFound)?;
                room.version += 1;

                let player_expect = Some(player.version);
                player.collection.push(taken.spec);
                player.collection_stamp = stamp;
                player.touch();
                player.version += 1;

                let count = player.collection.len() as u32;
                let items = player.collection.clone();
                self.try_commit(vec![
                    RecordWrite::PutRoom {
                        expect: room_expect,
                        room,
                    },
                    RecordWrite::PutPlayer {
                        expect: player_expect,
                        player,
                    },
                ])
                .map(|committed| committed.then_some((count, items)))
            })
            .await?;

        self.feed
            .publish_change(room_id, Notice::ItemRemoved { item_id }, Audience::Everyone)
            .await;
        self.publish_collection_change(room_id, actor, count, items)
            .await;
        Ok(())
    }

    /// Remove an item from the surface entirely.
    pub async fn discard_item(
        &self,
        actor: ActorToken,
        room_id: RoomId,
        item_id: ItemId,
        _timestamp_ms: u64,
    ) -> Result<(), ErrorKind> {
        self.gate
            .authorize(actor, room_id, RecordKind::SharedSurface, None, Operation::Write)?;

        self.cas_loop(|| {
            let mut room = self.store.get_room(room_id).map_err(map_store_err)?;
            if room.closed {
                return Err(ErrorKind::RoomClosed);
            }
            let expect = Some(room.version);
            room.take_item(item_id).ok_or(ErrorKind::ItemNotFound)?;
            room.version += 1;
            self.try_commit(vec![RecordWrite::PutRoom { expect, room }])
                .map(|committed| committed.then_some(()))
        })
        .await?;

        self.feed
            .publish_change(room_id, Notice::ItemRemoved { item_id }, Audience::Everyone)
            .await;
        Ok(())
    }

    /// Import items into the actor's own collection.
    pub async fn add_items(
        &self,
        actor: ActorToken,
        room_id: RoomId,
        items: Vec<ItemSpec>,
        timestamp_ms: u64,
    ) -> Result<(), ErrorKind> {
        self.gate.validate_items(&items)?;
        self.gate.authorize(
            actor,
            room_id,
            RecordKind::PrivateCollection,
            Some(actor),
            Operation::Write,
        )?;
        let stamp = WriteStamp::new(timestamp_ms, actor);

        let (count, contents) = self
            .cas_loop(|| {
                let mut player = self.gate.require_member(actor, room_id)?;
                if player.collection.len() + items.len() > self.limits.collection_cap {
                    return Err(ErrorKind::CollectionFull);
                }

                let expect = Some(player.version);
                player.collection.extend(items.iter().cloned());
                player.collection_stamp = stamp;
                player.touch();
                player.version += 1;

                let count = player.collection.len() as u32;
                let contents = player.collection.clone();
                self.try_commit(vec![RecordWrite::PutPlayer { expect, player }])
                    .map(|committed| committed.then_some((count, contents)))
            })
            .await?;

        self.publish_collection_change(room_id, actor, count, contents)
            .await;
        Ok(())
    }

    // ─── Snapshots & maintenance ──────────────────────────────────────

    /// Privacy-scoped full state for one member: the room, their own row
    /// with contents, and count-only views of everyone else.
    pub fn snapshot(
        &self,
        actor: ActorToken,
        room_id: RoomId,
    ) -> Result<(Room, PlayerView, Vec<PlayerView>), ErrorKind> {
        let player = self.gate.require_member(actor, room_id)?;
        let room = self.store.get_room(room_id).map_err(map_store_err)?;
        let now = epoch_secs();
        let window = self.gate.expiry_window_secs();

        let others = self
            .store
            .players_in_room(room_id)
            .map_err(map_store_err)?
            .into_iter()
            .filter(|p| p.token != actor && !p.is_expired(now, window))
            .map(|p| self.gate.view_player(actor, &p))
            .collect();

        Ok((room, self.gate.view_player(actor, &player), others))
    }

    /// Recompute `player_count` from non-expired rows. Returns the count.
    pub async fn reconcile_player_count(&self, room_id: RoomId) -> Result<u8, ErrorKind> {
        let now = epoch_secs();
        let window = self.gate.expiry_window_secs();

        for _ in 0..CAS_RETRIES {
            let mut room = self.store.get_room(room_id).map_err(map_store_err)?;
            let live = self
                .store
                .players_in_room(room_id)
                .map_err(map_store_err)?
                .iter()
                .filter(|p| !p.is_expired(now, window))
                .count() as u8;

            if room.player_count == live {
                return Ok(live);
            }

            let expect = Some(room.version);
            room.player_count = live;
            room.version += 1;
            match self.store.commit(vec![RecordWrite::PutRoom { expect, room }]) {
                Ok(()) => return Ok(live),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(map_store_err(e)),
            }
        }
        Err(ErrorKind::VersionConflict)
    }

    /// Drop expired player rows and reconcile counts. Returns how many
    /// rows were removed.
    pub async fn expire_players(&self) -> Result<usize, ErrorKind> {
        let now = epoch_secs();
        let window = self.gate.expiry_window_secs();
        let rooms = self.store.list_rooms().map_err(map_store_err)?;
        let mut removed = 0;

        for room in rooms {
            let expired: Vec<Player> = self
                .store
                .players_in_room(room.room_id)
                .map_err(map_store_err)?
                .into_iter()
                .filter(|p| p.is_expired(now, window))
                .collect();
            if expired.is_empty() {
                continue;
            }

            for player in &expired {
                self.store
                    .commit(vec![RecordWrite::DeletePlayer {
                        token: player.token,
                    }])
                    .map_err(map_store_err)?;
                self.feed
                    .publish_change(
                        room.room_id,
                        Notice::PlayerLeft {
                            token: player.token,
                        },
                        Audience::Everyone,
                    )
                    .await;
                removed += 1;
            }
            self.reconcile_player_count(room.room_id).await?;
            log::info!(
                "Expired {} idle players from room {}",
                expired.len(),
                room.room_id
            );
        }
        Ok(removed)
    }

    pub fn limits(&self) -> &RoomLimits {
        &self.limits
    }

    // ─── Internals ────────────────────────────────────────────────────

    /// Run one read-modify-commit attempt to success or a terminal error.
    /// The closure returns `Ok(None)` to signal a version conflict worth
    /// retrying, `Ok(Some(v))` on commit.
    async fn cas_loop<T>(
        &self,
        mut attempt: impl FnMut() -> Result<Option<T>, ErrorKind>,
    ) -> Result<T, ErrorKind> {
        for _ in 0..CAS_RETRIES {
            match attempt()? {
                Some(value) => return Ok(value),
                None => continue,
            }
        }
        Err(ErrorKind::VersionConflict)
    }

    /// Commit, mapping a version conflict to `Ok(false)` for the loop.
    fn try_commit(&self, writes: Vec<RecordWrite>) -> Result<bool, ErrorKind> {
        match self.store.commit(writes) {
            Ok(()) => Ok(true),
            Err(StoreError::VersionConflict { .. }) => Ok(false),
            Err(e) => Err(map_store_err(e)),
        }
    }

    /// Two-audience publication of a collection change: full contents to
    /// the owner alone, the count to everyone else.
    async fn publish_collection_change(
        &self,
        room_id: RoomId,
        owner: ActorToken,
        count: u32,
        items: Vec<ItemSpec>,
    ) -> (usize, usize) {
        let to_owner = self
            .feed
            .publish_change(
                room_id,
                Notice::CollectionChanged {
                    owner,
                    count,
                    items: Some(items),
                },
                Audience::Only(owner),
            )
            .await;
        let to_rest = self
            .feed
            .publish_change(
                room_id,
                Notice::CollectionChanged {
                    owner,
                    count,
                    items: None,
                },
                Audience::Except(owner),
            )
            .await;
        (to_owner, to_rest)
    }

    fn reject_bound_token(&self, token: ActorToken) -> Result<(), ErrorKind> {
        match self.store.find_player(token).map_err(map_store_err)? {
            None => Ok(()),
            Some(existing) => {
                if existing.is_expired(epoch_secs(), self.gate.expiry_window_secs()) {
                    Err(ErrorKind::SessionExpired)
                } else {
                    Err(ErrorKind::Protocol("token already bound to a room".into()))
                }
            }
        }
    }
}

fn map_store_err(e: StoreError) -> ErrorKind {
    match e {
        StoreError::RoomNotFound(_) => ErrorKind::RoomNotFound,
        StoreError::PlayerNotFound(_) => ErrorKind::AccessDenied,
        StoreError::VersionConflict { .. } => ErrorKind::VersionConflict,
        other => ErrorKind::Internal(other.to_string()),
    }
}
