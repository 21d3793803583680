//! Binary wire protocol between sync clients and the sync server.
//!
//! Every frame is a bincode-encoded envelope:
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ actor     │ room_id  │ seq      │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ 8 bytes  │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//! The payload is itself bincode: a typed enum chosen by `msg_type`.
//! `seq` is the sender's per-connection sequence number, echoed back on
//! `Error` frames so rejections can be matched to the action they reject.

use serde::{Deserialize, Serialize};

use crate::presence::Presence;
use crate::record::{
    ActorToken, ItemId, ItemSpec, Orientation, PlacedItem, PlayerView, Position, Room, RoomId,
};
use crate::resolver::Lww;

/// Frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MsgType {
    /// First client frame: create, join, or re-attach to a room
    Hello = 1,
    /// Server reply to Hello, carries a full snapshot
    Welcome = 2,
    /// A state-changing intent
    Action = 3,
    /// Committed-write notification fanned out to subscribers
    Change = 4,
    /// Transient broadcast, never persisted or replayed
    Ephemeral = 5,
    /// Client requests a fresh snapshot
    Resync = 6,
    /// Server snapshot reply
    Snapshot = 7,
    /// Liveness signal
    Heartbeat = 8,
    /// Heartbeat acknowledgement
    HeartbeatAck = 9,
    /// Operation rejected; payload carries the specific kind
    Error = 10,
    /// Clean detach
    Bye = 11,
}

/// Top-level wire frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub msg_type: MsgType,
    pub actor: ActorToken,
    pub room_id: RoomId,
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn hello(actor: ActorToken, hello: &HelloPayload) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MsgType::Hello,
            actor,
            room_id: hello.room_id().unwrap_or_else(RoomId::nil),
            seq: 0,
            payload: encode_payload(hello)?,
        })
    }

    pub fn welcome(room_id: RoomId, snapshot: &SnapshotPayload) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MsgType::Welcome,
            actor: ActorToken::nil(),
            room_id,
            seq: 0,
            payload: encode_payload(snapshot)?,
        })
    }

    pub fn action(
        actor: ActorToken,
        room_id: RoomId,
        seq: u64,
        action: &ActionPayload,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MsgType::Action,
            actor,
            room_id,
            seq,
            payload: encode_payload(action)?,
        })
    }

    pub fn change(actor: ActorToken, room_id: RoomId, notice: &Notice) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MsgType::Change,
            actor,
            room_id,
            seq: 0,
            payload: encode_payload(notice)?,
        })
    }

    pub fn ephemeral(
        actor: ActorToken,
        room_id: RoomId,
        notice: &Notice,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MsgType::Ephemeral,
            actor,
            room_id,
            seq: 0,
            payload: encode_payload(notice)?,
        })
    }

    pub fn resync(actor: ActorToken, room_id: RoomId, seq: u64) -> Self {
        Self {
            msg_type: MsgType::Resync,
            actor,
            room_id,
            seq,
            payload: Vec::new(),
        }
    }

    pub fn snapshot(room_id: RoomId, snapshot: &SnapshotPayload) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MsgType::Snapshot,
            actor: ActorToken::nil(),
            room_id,
            seq: 0,
            payload: encode_payload(snapshot)?,
        })
    }

    pub fn heartbeat(actor: ActorToken, room_id: RoomId) -> Self {
        Self {
            msg_type: MsgType::Heartbeat,
            actor,
            room_id,
            seq: 0,
            payload: Vec::new(),
        }
    }

    pub fn heartbeat_ack(actor: ActorToken, room_id: RoomId) -> Self {
        Self {
            msg_type: MsgType::HeartbeatAck,
            actor,
            room_id,
            seq: 0,
            payload: Vec::new(),
        }
    }

    pub fn error(room_id: RoomId, seq: u64, kind: &ErrorKind) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MsgType::Error,
            actor: ActorToken::nil(),
            room_id,
            seq,
            payload: encode_payload(kind)?,
        })
    }

    pub fn bye(actor: ActorToken, room_id: RoomId) -> Self {
        Self {
            msg_type: MsgType::Bye,
            actor,
            room_id,
            seq: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }

    /// Parse a Hello payload.
    pub fn hello_payload(&self) -> Result<HelloPayload, ProtocolError> {
        if self.msg_type != MsgType::Hello {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    /// Parse an Action payload.
    pub fn action_payload(&self) -> Result<ActionPayload, ProtocolError> {
        if self.msg_type != MsgType::Action {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    /// Parse a Change or Ephemeral notice.
    pub fn notice(&self) -> Result<Notice, ProtocolError> {
        if self.msg_type != MsgType::Change && self.msg_type != MsgType::Ephemeral {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    /// Parse a Welcome or Snapshot payload.
    pub fn snapshot_payload(&self) -> Result<SnapshotPayload, ProtocolError> {
        if self.msg_type != MsgType::Welcome && self.msg_type != MsgType::Snapshot {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    /// Parse an Error payload.
    pub fn error_kind(&self) -> Result<ErrorKind, ProtocolError> {
        if self.msg_type != MsgType::Error {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_payload<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// First-frame intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HelloPayload {
    /// Create a room and become its creator.
    Create {
        display_name: String,
        max_players: u8,
    },
    /// Join an existing room as a new player.
    Join {
        room_id: RoomId,
        display_name: String,
    },
    /// Resume an existing session after a reconnect.
    Attach { room_id: RoomId },
}

impl HelloPayload {
    fn room_id(&self) -> Option<RoomId> {
        match self {
            HelloPayload::Create { .. } => None,
            HelloPayload::Join { room_id, .. } | HelloPayload::Attach { room_id } => Some(*room_id),
        }
    }
}

/// State-changing intents from the consuming layer.
///
/// Item mutations carry the writer's wall-clock `timestamp_ms`; the server
/// stamps the write with (timestamp, actor) for conflict resolution, so a
/// mutation queued offline keeps its original stamp when replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionPayload {
    /// Move an item from the actor's private collection onto the surface.
    PlaceItem {
        item_id: ItemId,
        position: Position,
        orientation: Orientation,
        timestamp_ms: u64,
    },
    /// Reposition / reorient an item already on the surface.
    MoveItem {
        item_id: ItemId,
        position: Position,
        orientation: Orientation,
        timestamp_ms: u64,
    },
    /// Move an item from the surface back into the actor's collection.
    ReturnItem { item_id: ItemId, timestamp_ms: u64 },
    /// Remove an item from the surface entirely.
    DiscardItem { item_id: ItemId, timestamp_ms: u64 },
    /// Import items into the actor's own collection.
    AddItems {
        items: Vec<ItemSpec>,
        timestamp_ms: u64,
    },
    LeaveRoom,
    CloseRoom,
}

/// Fan-out payloads delivered to subscribed connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notice {
    ItemAdded {
        item: PlacedItem,
    },
    ItemMoved {
        item_id: ItemId,
        position: Lww<Position>,
        orientation: Lww<Orientation>,
    },
    ItemRemoved {
        item_id: ItemId,
    },
    /// A private collection changed. `items` is populated only on the copy
    /// scoped to the owner; everyone else receives the count alone.
    CollectionChanged {
        owner: ActorToken,
        count: u32,
        items: Option<Vec<ItemSpec>>,
    },
    PlayerJoined {
        player: PlayerView,
    },
    PlayerLeft {
        token: ActorToken,
    },
    PresenceChanged {
        token: ActorToken,
        presence: Presence,
    },
    RoomClosed,
}

/// Full resynchronization payload, assembled through the privacy gate:
/// `you` carries the private collection, `others` are count-only views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub room: Room,
    pub you: PlayerView,
    pub others: Vec<PlayerView>,
    pub presence: Vec<(ActorToken, Presence)>,
}

/// Operation failure taxonomy, carried over the wire on Error frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ErrorKind {
    RoomNotFound,
    RoomFull,
    RoomClosed,
    /// Non-creator attempted a creator-only action.
    NotAuthorized,
    /// Privacy violation. Deliberately carries no detail about what was
    /// protected.
    AccessDenied,
    CollectionFull,
    ItemNotFound,
    SessionExpired,
    /// Transient: retried internally, surfaced only on exhaustion.
    VersionConflict,
    /// Transient: drives the client reconnect state machine.
    ConnectionLost,
    Protocol(String),
    Internal(String),
}

impl ErrorKind {
    /// Transient kinds are recovered locally (retry / reconnect) and only
    /// surface once retries are exhausted.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::VersionConflict | ErrorKind::ConnectionLost)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::RoomNotFound => write!(f, "Room not found"),
            ErrorKind::RoomFull => write!(f, "Room is full"),
            ErrorKind::RoomClosed => write!(f, "Room is closed"),
            ErrorKind::NotAuthorized => write!(f, "Not authorized"),
            ErrorKind::AccessDenied => write!(f, "Access denied"),
            ErrorKind::CollectionFull => write!(f, "Private collection is full"),
            ErrorKind::ItemNotFound => write!(f, "Item not found"),
            ErrorKind::SessionExpired => write!(f, "Session expired, rejoin required"),
            ErrorKind::VersionConflict => write!(f, "Concurrent write conflict"),
            ErrorKind::ConnectionLost => write!(f, "Connection lost"),
            ErrorKind::Protocol(e) => write!(f, "Protocol violation: {e}"),
            ErrorKind::Internal(e) => write!(f, "Internal error: {e}"),
        }
    }
}

impl std::error::Error for ErrorKind {}

/// Protocol-level (framing) errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<ProtocolError> for ErrorKind {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::ConnectionClosed | ProtocolError::Timeout => ErrorKind::ConnectionLost,
            other => ErrorKind::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ItemSpec;
    use crate::resolver::WriteStamp;

    #[test]
    fn test_hello_roundtrip() {
        let actor = ActorToken::generate();
        let hello = HelloPayload::Create {
            display_name: "Ida".into(),
            max_players: 4,
        };
        let frame = Frame::hello(actor, &hello).unwrap();
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MsgType::Hello);
        assert_eq!(decoded.actor, actor);
        assert_eq!(decoded.hello_payload().unwrap(), hello);
    }

    #[test]
    fn test_join_hello_carries_room_id() {
        let room_id = RoomId::generate();
        let hello = HelloPayload::Join {
            room_id,
            display_name: "Sam".into(),
        };
        let frame = Frame::hello(ActorToken::generate(), &hello).unwrap();
        assert_eq!(frame.room_id, room_id);
    }

    #[test]
    fn test_action_roundtrip() {
        let actor = ActorToken::generate();
        let room = RoomId::generate();
        let action = ActionPayload::MoveItem {
            item_id: ItemId::generate(),
            position: Position::new(4.0, 2.0),
            orientation: Orientation::default(),
            timestamp_ms: 1234,
        };

        let frame = Frame::action(actor, room, 7, &action).unwrap();
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();

        assert_eq!(decoded.seq, 7);
        assert_eq!(decoded.action_payload().unwrap(), action);
    }

    #[test]
    fn test_change_notice_roundtrip() {
        let room = RoomId::generate();
        let actor = ActorToken::generate();
        let spec = ItemSpec::new("ace");
        let stamp = WriteStamp::new(5, actor);
        let notice = Notice::ItemAdded {
            item: PlacedItem::new(
                spec,
                actor,
                Position::new(1.0, 2.0),
                Orientation::default(),
                stamp,
            ),
        };

        let frame = Frame::change(actor, room, &notice).unwrap();
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MsgType::Change);
        assert_eq!(decoded.notice().unwrap(), notice);
    }

    #[test]
    fn test_error_frame_echoes_seq() {
        let room = RoomId::generate();
        let frame = Frame::error(room, 42, &ErrorKind::RoomFull).unwrap();
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();

        assert_eq!(decoded.seq, 42);
        assert_eq!(decoded.error_kind().unwrap(), ErrorKind::RoomFull);
    }

    #[test]
    fn test_heartbeat_frames_have_empty_payload() {
        let actor = ActorToken::generate();
        let room = RoomId::generate();
        let hb = Frame::heartbeat(actor, room);
        let ack = Frame::heartbeat_ack(actor, room);
        assert!(hb.payload.is_empty());
        assert!(ack.payload.is_empty());
        assert_eq!(hb.msg_type, MsgType::Heartbeat);
        assert_eq!(ack.msg_type, MsgType::HeartbeatAck);
    }

    #[test]
    fn test_payload_parser_rejects_wrong_type() {
        let frame = Frame::heartbeat(ActorToken::generate(), RoomId::generate());
        assert!(frame.hello_payload().is_err());
        assert!(frame.action_payload().is_err());
        assert!(frame.notice().is_err());
        assert!(frame.error_kind().is_err());
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(Frame::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_collection_notice_redacted_copy() {
        let owner = ActorToken::generate();
        let full = Notice::CollectionChanged {
            owner,
            count: 3,
            items: Some(vec![ItemSpec::new("two"), ItemSpec::new("jack")]),
        };
        let redacted = Notice::CollectionChanged {
            owner,
            count: 3,
            items: None,
        };

        let room = RoomId::generate();
        let f1 = Frame::change(owner, room, &full).unwrap().encode().unwrap();
        let f2 = Frame::change(owner, room, &redacted).unwrap().encode().unwrap();
        // The redacted copy must not carry the contents
        assert!(f2.len() < f1.len());
    }

    #[test]
    fn test_transient_classification() {
        assert!(ErrorKind::VersionConflict.is_transient());
        assert!(ErrorKind::ConnectionLost.is_transient());
        assert!(!ErrorKind::RoomFull.is_transient());
        assert!(!ErrorKind::AccessDenied.is_transient());
    }
}
