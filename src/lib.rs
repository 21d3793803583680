//! # parlor — shared game-room synchronization engine
//!
//! Keeps a small group of players (2–8) in a room looking at the same
//! state: a shared surface everyone can touch, and a private collection
//! per player that nobody else may read beyond its item count.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per actor) │     Binary Proto    │ (authority) │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ LocalCache  │                     │ RoomRegistry│
//! │ (mirror)    │                     └──────┬──────┘
//! └─────────────┘                  ┌─────────┼─────────┐
//!                                  ▼         ▼         ▼
//!                            PrivacyGate SessionStore ChangeFeed
//!                                        (RocksDB)   (fan-out)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire protocol (bincode-encoded frames)
//! - [`record`] — rooms, players, items, and their versioned records
//! - [`resolver`] — last-write-wins stamps and registers
//! - [`store`] — versioned session store (RocksDB or in-memory)
//! - [`privacy`] — membership and collection-ownership enforcement
//! - [`registry`] — room lifecycle and surface/collection operations
//! - [`feed`] — audience-scoped per-room change fan-out
//! - [`presence`] — heartbeat-driven online/offline tracking
//! - [`server`] — WebSocket sync server
//! - [`client`] — reconnecting client with optimistic local state

pub mod client;
pub mod feed;
pub mod presence;
pub mod privacy;
pub mod protocol;
pub mod record;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod store;

// Re-exports for convenience
pub use client::{ClientConfig, ClientEvent, ConnectionState, LocalCache, PendingQueue, SyncClient};
pub use feed::{Audience, ChangeFeed, FeedEvent, FeedRecvError, FeedStats, FeedSubscription};
pub use presence::{Presence, PresenceConfig, PresenceTracker, PresenceTransition};
pub use privacy::{Operation, PrivacyGate, RecordKind};
pub use protocol::{
    ActionPayload, ErrorKind, Frame, HelloPayload, MsgType, Notice, ProtocolError, SnapshotPayload,
};
pub use record::{
    ActorToken, ItemId, ItemSpec, MetaValue, Orientation, PlacedItem, Player, PlayerView, Position,
    Room, RoomId, RoomSummary,
};
pub use registry::{RoomLimits, RoomRegistry};
pub use resolver::{Lww, WriteStamp};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use store::{RecordWrite, SessionStore, StoreConfig, StoreError};
