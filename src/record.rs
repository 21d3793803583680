//! Durable data model: rooms, players, and the items they hold.
//!
//! `Room` and `Player` are the only shared mutable records in the engine.
//! Both carry a version counter checked by [`crate::store::SessionStore`]
//! on every commit (optimistic concurrency). Mutable item fields carry
//! [`Lww`] registers so concurrent edits resolve deterministically.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;
use uuid::Uuid;

use crate::resolver::{Lww, WriteStamp};

/// Opaque, client-generated session identity.
///
/// Passed explicitly through every call that acts on behalf of a player;
/// never stored in ambient/global state. There is no server-side identity
/// proofing — holding the token *is* the identity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ActorToken(pub Uuid);

impl ActorToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Byte representation used for deterministic tie-breaking.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for ActorToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Room identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RoomId(pub Uuid);

impl RoomId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Item identifier, stable across hand and surface.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ItemId(pub Uuid);

impl ItemId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Primitive metadata value.
///
/// Item metadata in the source data is schemaless; here it is a tagged
/// union of primitives, validated at the [`crate::privacy::PrivacyGate`]
/// boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetaValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// An item as held in a private collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSpec {
    pub item_id: ItemId,
    pub name: String,
    pub metadata: BTreeMap<String, MetaValue>,
}

impl ItemSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            item_id: ItemId::generate(),
            name: name.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: MetaValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// 2D position on the shared surface.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Orientation of a placed item.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    /// Rotation in degrees, clockwise.
    pub degrees: f32,
    pub face_up: bool,
}

impl Default for Orientation {
    fn default() -> Self {
        Self {
            degrees: 0.0,
            face_up: true,
        }
    }
}

/// An item on the shared surface, visible to every room member.
///
/// Position and orientation are independent LWW registers: simultaneous
/// edits to different fields both survive, racing edits to the same field
/// get exactly one deterministic winner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedItem {
    pub item_id: ItemId,
    pub placed_by: ActorToken,
    pub spec: ItemSpec,
    pub position: Lww<Position>,
    pub orientation: Lww<Orientation>,
}

impl PlacedItem {
    pub fn new(
        spec: ItemSpec,
        placed_by: ActorToken,
        position: Position,
        orientation: Orientation,
        stamp: WriteStamp,
    ) -> Self {
        Self {
            item_id: spec.item_id,
            placed_by,
            spec,
            position: Lww::new(position, stamp),
            orientation: Lww::new(orientation, stamp),
        }
    }
}

/// A shared game room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub room_id: RoomId,
    pub creator: ActorToken,
    /// Bounded capacity, 2..=8.
    pub max_players: u8,
    /// One-way flag: once true it never reverts.
    pub closed: bool,
    /// Cached count of non-expired players; reconciled by the expiry sweep.
    pub player_count: u8,
    /// Ordered shared surface.
    pub surface: Vec<PlacedItem>,
    /// Optimistic-concurrency version, checked on every commit.
    pub version: u64,
    /// Seconds since epoch.
    pub created_at: u64,
}

impl Room {
    pub fn new(creator: ActorToken, max_players: u8) -> Self {
        Self {
            room_id: RoomId::generate(),
            creator,
            max_players,
            closed: false,
            player_count: 0,
            surface: Vec::new(),
            version: 0,
            created_at: epoch_secs(),
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.player_count < self.max_players
    }

    pub fn find_item(&self, item_id: ItemId) -> Option<&PlacedItem> {
        self.surface.iter().find(|i| i.item_id == item_id)
    }

    pub fn find_item_mut(&mut self, item_id: ItemId) -> Option<&mut PlacedItem> {
        self.surface.iter_mut().find(|i| i.item_id == item_id)
    }

    /// Remove an item from the surface, returning it if present.
    pub fn take_item(&mut self, item_id: ItemId) -> Option<PlacedItem> {
        let idx = self.surface.iter().position(|i| i.item_id == item_id)?;
        Some(self.surface.remove(idx))
    }
}

/// A player row: one per (room, token).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub token: ActorToken,
    pub room_id: RoomId,
    pub display_name: String,
    /// Exactly one true per room, set at creation.
    pub is_creator: bool,
    /// Private collection — never visible to other actors beyond its count.
    pub collection: Vec<ItemSpec>,
    /// LWW stamp covering the collection contents as one field.
    pub collection_stamp: WriteStamp,
    pub online: bool,
    /// Seconds since epoch; refreshed on join and on authored mutations.
    pub last_seen: u64,
    pub version: u64,
}

impl Player {
    pub fn new(
        token: ActorToken,
        room_id: RoomId,
        display_name: impl Into<String>,
        is_creator: bool,
    ) -> Self {
        let now = epoch_secs();
        Self {
            token,
            room_id,
            display_name: display_name.into(),
            is_creator,
            collection: Vec::new(),
            collection_stamp: WriteStamp::new(0, token),
            online: true,
            last_seen: now,
            version: 0,
        }
    }

    /// Whether this row has sat idle past the expiry window.
    ///
    /// Expired rows are excluded from player counts and are never revived;
    /// a later join allocates a fresh token.
    pub fn is_expired(&self, now_secs: u64, window_secs: u64) -> bool {
        now_secs.saturating_sub(self.last_seen) > window_secs
    }

    /// Refresh `last_seen` to now.
    pub fn touch(&mut self) {
        self.last_seen = epoch_secs();
    }

    pub fn find_in_collection(&self, item_id: ItemId) -> Option<&ItemSpec> {
        self.collection.iter().find(|i| i.item_id == item_id)
    }

    /// Remove an item from the collection, returning it if present.
    pub fn take_from_collection(&mut self, item_id: ItemId) -> Option<ItemSpec> {
        let idx = self.collection.iter().position(|i| i.item_id == item_id)?;
        Some(self.collection.remove(idx))
    }
}

/// Redacted projection of a [`Player`] handed out by the privacy gate.
///
/// `collection` is `Some` only when the viewer is the owner; everyone else
/// sees the count alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerView {
    pub token: ActorToken,
    pub display_name: String,
    pub is_creator: bool,
    pub online: bool,
    pub collection_count: u32,
    pub collection: Option<Vec<ItemSpec>>,
}

/// Lobby-facing room listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub player_count: u8,
    pub max_players: u8,
}

impl From<&Room> for RoomSummary {
    fn from(room: &Room) -> Self {
        Self {
            room_id: room.room_id,
            player_count: room.player_count,
            max_players: room.max_players,
        }
    }
}

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Milliseconds since the Unix epoch, used for write stamps.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
