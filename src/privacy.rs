//! Access control in front of the session store.
//!
//! One rule set, no bypass path: shared-surface state is readable and
//! writable by any non-expired room member; a private collection is
//! readable and writable only by its owner. Everyone else gets a derived
//! summary (the item count), never the contents. Violations surface as
//! `AccessDenied` with no detail about what was protected.
//!
//! The same rule is applied three times: on the read path (redacted
//! [`PlayerView`]s), at snapshot assembly, and at feed fan-out time via
//! audience scoping — so no concurrency interleaving can leak a hand.

use std::sync::Arc;

use crate::protocol::ErrorKind;
use crate::record::{ActorToken, ItemSpec, MetaValue, Player, PlayerView, RoomId, epoch_secs};
use crate::store::SessionStore;

/// What is being touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    SharedSurface,
    PrivateCollection,
}

/// How it is being touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

/// Bounds on item payloads, checked at the gate boundary.
pub const MAX_ITEM_NAME_LEN: usize = 128;
pub const MAX_METADATA_KEYS: usize = 16;
pub const MAX_METADATA_KEY_LEN: usize = 64;
pub const MAX_METADATA_TEXT_LEN: usize = 512;

/// The authorization layer.
pub struct PrivacyGate {
    store: Arc<SessionStore>,
    expiry_window_secs: u64,
}

impl PrivacyGate {
    pub fn new(store: Arc<SessionStore>, expiry_window_secs: u64) -> Self {
        Self {
            store,
            expiry_window_secs,
        }
    }

    /// The single authorization decision.
    ///
    /// `owner` names the record owner for private-collection records and
    /// is ignored for shared-surface records.
    pub fn authorize(
        &self,
        actor: ActorToken,
        room_id: RoomId,
        kind: RecordKind,
        owner: Option<ActorToken>,
        _op: Operation,
    ) -> Result<(), ErrorKind> {
        self.require_member(actor, room_id)?;
        match kind {
            // Room membership is the whole rule for the shared surface,
            // for reads and writes alike.
            RecordKind::SharedSurface => Ok(()),
            RecordKind::PrivateCollection => {
                if owner == Some(actor) {
                    Ok(())
                } else {
                    Err(ErrorKind::AccessDenied)
                }
            }
        }
    }

    /// Look up the actor's membership row, rejecting expired sessions.
    pub fn require_member(&self, actor: ActorToken, room_id: RoomId) -> Result<Player, ErrorKind> {
        let player = self
            .store
            .find_player(actor)
            .map_err(|e| ErrorKind::Internal(e.to_string()))?
            .ok_or(ErrorKind::AccessDenied)?;

        if player.room_id != room_id {
            return Err(ErrorKind::AccessDenied);
        }
        if player.is_expired(epoch_secs(), self.expiry_window_secs) {
            return Err(ErrorKind::SessionExpired);
        }
        Ok(player)
    }

    /// Redacting projection: full collection for the owner, count-only for
    /// everyone else.
    pub fn view_player(&self, viewer: ActorToken, player: &Player) -> PlayerView {
        PlayerView {
            token: player.token,
            display_name: player.display_name.clone(),
            is_creator: player.is_creator,
            online: player.online,
            collection_count: player.collection.len() as u32,
            collection: if viewer == player.token {
                Some(player.collection.clone())
            } else {
                None
            },
        }
    }

    /// Boundary validation for imported items: bounded names and bounded
    /// primitive metadata, nothing open-ended.
    pub fn validate_items(&self, items: &[ItemSpec]) -> Result<(), ErrorKind> {
        for item in items {
            if item.name.is_empty() || item.name.len() > MAX_ITEM_NAME_LEN {
                return Err(ErrorKind::Protocol("item name out of bounds".into()));
            }
            if item.metadata.len() > MAX_METADATA_KEYS {
                return Err(ErrorKind::Protocol("too many metadata keys".into()));
            }
            for (key, value) in &item.metadata {
                if key.is_empty() || key.len() > MAX_METADATA_KEY_LEN {
                    return Err(ErrorKind::Protocol("metadata key out of bounds".into()));
                }
                if let MetaValue::Text(text) = value {
                    if text.len() > MAX_METADATA_TEXT_LEN {
                        return Err(ErrorKind::Protocol("metadata text too long".into()));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn expiry_window_secs(&self) -> u64 {
        self.expiry_window_secs
    }
}
