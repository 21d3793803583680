//! Versioned record store for rooms and players.
//!
//! Column families:
//! - `rooms`   — [`Room`] records, bincode-encoded, LZ4 above a threshold
//! - `players` — [`Player`] records, same encoding
//!
//! Every mutation goes through [`SessionStore::commit`]: an atomic,
//! multi-record conditional write. Each write names the version it expects
//! to replace; a mismatch fails the whole commit with `VersionConflict`
//! and nothing is applied. This check-and-commit is the engine's only
//! cross-task mutual-exclusion point.
//!
//! Two backends share the same semantics: RocksDB (when a path is
//! configured) and a plain in-memory map (`path: None`) for tests and
//! ephemeral deployments.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use crate::record::{ActorToken, Player, Room, RoomId};

const CF_ROOMS: &str = "rooms";
const CF_PLAYERS: &str = "players";
const COLUMN_FAMILIES: &[&str] = &[CF_ROOMS, CF_PLAYERS];

/// Encoding flags prepended to every stored value.
const TAG_RAW: u8 = 0;
const TAG_LZ4: u8 = 1;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory. `None` selects the in-memory backend.
    pub path: Option<PathBuf>,
    /// Block cache size in bytes.
    pub block_cache_size: usize,
    /// fsync on every commit.
    pub sync_writes: bool,
    /// Max open files for RocksDB.
    pub max_open_files: i32,
    /// Write buffer size per column family.
    pub write_buffer_size: usize,
    /// Encoded records at or above this size are LZ4-compressed.
    pub compress_threshold: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            block_cache_size: 32 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 8 * 1024 * 1024,
            compress_threshold: 512,
        }
    }
}

impl StoreConfig {
    /// In-memory store, no persistence.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Persistent store at the given path.
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
            compress_threshold: 512,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    DatabaseError(String),
    RoomNotFound(RoomId),
    PlayerNotFound(ActorToken),
    /// A conditional write observed a different version than expected.
    VersionConflict {
        expected: Option<u64>,
        actual: Option<u64>,
    },
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::RoomNotFound(id) => write!(f, "Room not found: {id}"),
            StoreError::PlayerNotFound(t) => write!(f, "Player not found: {t}"),
            StoreError::VersionConflict { expected, actual } => {
                write!(f, "Version conflict: expected {expected:?}, found {actual:?}")
            }
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// One conditional write inside a commit.
///
/// `expect: None` means the record must not exist yet (insert); `Some(v)`
/// means the stored record must currently be at version `v`. The record
/// being written carries its *new* version (caller increments).
#[derive(Debug, Clone)]
pub enum RecordWrite {
    PutRoom { expect: Option<u64>, room: Room },
    PutPlayer { expect: Option<u64>, player: Player },
    /// Unconditional removal; deleting an absent row is a no-op.
    DeletePlayer { token: ActorToken },
}

enum Backend {
    Memory {
        rooms: RwLock<HashMap<[u8; 16], Vec<u8>>>,
        players: RwLock<HashMap<[u8; 16], Vec<u8>>>,
    },
    Rocks(DBWithThreadMode<SingleThreaded>),
}

/// The durable record store.
pub struct SessionStore {
    backend: Backend,
    config: StoreConfig,
    /// Serializes the check-and-commit critical section.
    commit_lock: Mutex<()>,
}

impl SessionStore {
    /// Open the store. Creates the database and column families when a
    /// path is configured; otherwise runs fully in memory.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let backend = match &config.path {
            None => Backend::Memory {
                rooms: RwLock::new(HashMap::new()),
                players: RwLock::new(HashMap::new()),
            },
            Some(path) => {
                let mut db_opts = Options::default();
                db_opts.create_if_missing(true);
                db_opts.create_missing_column_families(true);
                db_opts.set_max_open_files(config.max_open_files);
                db_opts.set_keep_log_file_num(5);

                let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
                    .iter()
                    .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
                    .collect();

                let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
                    &db_opts,
                    path,
                    cf_descriptors,
                )?;
                Backend::Rocks(db)
            }
        };

        Ok(Self {
            backend,
            config,
            commit_lock: Mutex::new(()),
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        // Records are LZ4-framed above the threshold already; leave the
        // table-level compression to LZ4 as well for the small ones.
        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub fn get_room(&self, room_id: RoomId) -> Result<Room, StoreError> {
        self.find_room(room_id)?
            .ok_or(StoreError::RoomNotFound(room_id))
    }

    pub fn find_room(&self, room_id: RoomId) -> Result<Option<Room>, StoreError> {
        match self.raw_get(CF_ROOMS, room_id.0.as_bytes())? {
            Some(bytes) => Ok(Some(self.decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_player(&self, token: ActorToken) -> Result<Player, StoreError> {
        self.find_player(token)?
            .ok_or(StoreError::PlayerNotFound(token))
    }

    pub fn find_player(&self, token: ActorToken) -> Result<Option<Player>, StoreError> {
        match self.raw_get(CF_PLAYERS, token.0.as_bytes())? {
            Some(bytes) => Ok(Some(self.decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All player rows for a room, expired ones included — callers filter.
    pub fn players_in_room(&self, room_id: RoomId) -> Result<Vec<Player>, StoreError> {
        let mut players = Vec::new();
        for bytes in self.raw_scan(CF_PLAYERS)? {
            let player: Player = self.decode_record(&bytes)?;
            if player.room_id == room_id {
                players.push(player);
            }
        }
        Ok(players)
    }

    pub fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let mut rooms = Vec::new();
        for bytes in self.raw_scan(CF_ROOMS)? {
            rooms.push(self.decode_record(&bytes)?);
        }
        Ok(rooms)
    }

    // ─── Commit ───────────────────────────────────────────────────────

    /// Atomic multi-record conditional write.
    ///
    /// Checks every expectation under the commit lock, then applies all
    /// writes as one batch. On any version mismatch nothing is written.
    pub fn commit(&self, writes: Vec<RecordWrite>) -> Result<(), StoreError> {
        let _guard = self
            .commit_lock
            .lock()
            .map_err(|_| StoreError::DatabaseError("commit lock poisoned".into()))?;

        // Phase 1: check expectations.
        for write in &writes {
            match write {
                RecordWrite::PutRoom { expect, room } => {
                    let current = self.find_room(room.room_id)?.map(|r| r.version);
                    Self::check_expectation(*expect, current)?;
                }
                RecordWrite::PutPlayer { expect, player } => {
                    let current = self.find_player(player.token)?.map(|p| p.version);
                    Self::check_expectation(*expect, current)?;
                }
                RecordWrite::DeletePlayer { .. } => {}
            }
        }

        // Phase 2: apply.
        match &self.backend {
            Backend::Memory { rooms, players } => {
                let mut rooms_w = rooms
                    .write()
                    .map_err(|_| StoreError::DatabaseError("rooms lock poisoned".into()))?;
                let mut players_w = players
                    .write()
                    .map_err(|_| StoreError::DatabaseError("players lock poisoned".into()))?;
                for write in writes {
                    match write {
                        RecordWrite::PutRoom { room, .. } => {
                            let bytes = self.encode_record(&room)?;
                            rooms_w.insert(*room.room_id.0.as_bytes(), bytes);
                        }
                        RecordWrite::PutPlayer { player, .. } => {
                            let bytes = self.encode_record(&player)?;
                            players_w.insert(*player.token.0.as_bytes(), bytes);
                        }
                        RecordWrite::DeletePlayer { token } => {
                            players_w.remove(token.0.as_bytes());
                        }
                    }
                }
            }
            Backend::Rocks(db) => {
                let rooms_cf = db
                    .cf_handle(CF_ROOMS)
                    .ok_or_else(|| StoreError::DatabaseError("missing rooms cf".into()))?;
                let players_cf = db
                    .cf_handle(CF_PLAYERS)
                    .ok_or_else(|| StoreError::DatabaseError("missing players cf".into()))?;

                let mut batch = WriteBatch::default();
                for write in writes {
                    match write {
                        RecordWrite::PutRoom { room, .. } => {
                            let bytes = self.encode_record(&room)?;
                            batch.put_cf(&rooms_cf, room.room_id.0.as_bytes(), bytes);
                        }
                        RecordWrite::PutPlayer { player, .. } => {
                            let bytes = self.encode_record(&player)?;
                            batch.put_cf(&players_cf, player.token.0.as_bytes(), bytes);
                        }
                        RecordWrite::DeletePlayer { token } => {
                            batch.delete_cf(&players_cf, token.0.as_bytes());
                        }
                    }
                }

                let mut write_opts = WriteOptions::default();
                write_opts.set_sync(self.config.sync_writes);
                db.write_opt(batch, &write_opts)?;
            }
        }

        Ok(())
    }

    fn check_expectation(expect: Option<u64>, actual: Option<u64>) -> Result<(), StoreError> {
        if expect == actual {
            Ok(())
        } else {
            Err(StoreError::VersionConflict {
                expected: expect,
                actual,
            })
        }
    }

    // ─── Raw access ───────────────────────────────────────────────────

    fn raw_get(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match &self.backend {
            Backend::Memory { rooms, players } => {
                let map = if cf == CF_ROOMS { rooms } else { players };
                let map_r = map
                    .read()
                    .map_err(|_| StoreError::DatabaseError("map lock poisoned".into()))?;
                let mut fixed = [0u8; 16];
                fixed.copy_from_slice(key);
                Ok(map_r.get(&fixed).cloned())
            }
            Backend::Rocks(db) => {
                let handle = db
                    .cf_handle(cf)
                    .ok_or_else(|| StoreError::DatabaseError(format!("missing cf {cf}")))?;
                Ok(db.get_cf(&handle, key)?)
            }
        }
    }

    fn raw_scan(&self, cf: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        match &self.backend {
            Backend::Memory { rooms, players } => {
                let map = if cf == CF_ROOMS { rooms } else { players };
                let map_r = map
                    .read()
                    .map_err(|_| StoreError::DatabaseError("map lock poisoned".into()))?;
                Ok(map_r.values().cloned().collect())
            }
            Backend::Rocks(db) => {
                let handle = db
                    .cf_handle(cf)
                    .ok_or_else(|| StoreError::DatabaseError(format!("missing cf {cf}")))?;
                let mut values = Vec::new();
                for entry in db.iterator_cf(&handle, IteratorMode::Start) {
                    let (_, value) = entry?;
                    values.push(value.to_vec());
                }
                Ok(values)
            }
        }
    }

    // ─── Record encoding ──────────────────────────────────────────────

    fn encode_record<T: Serialize>(&self, record: &T) -> Result<Vec<u8>, StoreError> {
        let encoded = bincode::serde::encode_to_vec(record, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        if encoded.len() >= self.config.compress_threshold {
            let mut framed = Vec::with_capacity(encoded.len() / 2 + 1);
            framed.push(TAG_LZ4);
            framed.extend_from_slice(&lz4_flex::compress_prepend_size(&encoded));
            Ok(framed)
        } else {
            let mut framed = Vec::with_capacity(encoded.len() + 1);
            framed.push(TAG_RAW);
            framed.extend_from_slice(&encoded);
            Ok(framed)
        }
    }

    fn decode_record<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, StoreError> {
        let (tag, body) = bytes
            .split_first()
            .ok_or_else(|| StoreError::DeserializationError("empty record".into()))?;

        let raw;
        let payload: &[u8] = match *tag {
            TAG_RAW => body,
            TAG_LZ4 => {
                raw = lz4_flex::decompress_size_prepended(body)
                    .map_err(|e| StoreError::CompressionError(e.to_string()))?;
                &raw
            }
            other => {
                return Err(StoreError::DeserializationError(format!(
                    "unknown record tag {other}"
                )))
            }
        };

        let (record, _) = bincode::serde::decode_from_slice(payload, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ItemSpec, MetaValue};

    fn memory_store() -> SessionStore {
        SessionStore::open(StoreConfig::in_memory()).unwrap()
    }

    fn put_room(room: Room, expect: Option<u64>) -> RecordWrite {
        RecordWrite::PutRoom { expect, room }
    }

    fn put_player(player: Player, expect: Option<u64>) -> RecordWrite {
        RecordWrite::PutPlayer { expect, player }
    }

    #[test]
    fn test_insert_and_get_room() {
        let store = memory_store();
        let room = Room::new(ActorToken::generate(), 4);
        let id = room.room_id;

        store.commit(vec![put_room(room.clone(), None)]).unwrap();
        let loaded = store.get_room(id).unwrap();
        assert_eq!(loaded, room);
    }

    #[test]
    fn test_get_missing_room_fails() {
        let store = memory_store();
        let id = RoomId::generate();
        assert!(matches!(
            store.get_room(id),
            Err(StoreError::RoomNotFound(found)) if found == id
        ));
    }

    #[test]
    fn test_insert_twice_conflicts() {
        let store = memory_store();
        let room = Room::new(ActorToken::generate(), 4);

        store.commit(vec![put_room(room.clone(), None)]).unwrap();
        let err = store.commit(vec![put_room(room, None)]).unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[test]
    fn test_versioned_update() {
        let store = memory_store();
        let mut room = Room::new(ActorToken::generate(), 4);
        store.commit(vec![put_room(room.clone(), None)]).unwrap();

        room.player_count = 1;
        room.version = 1;
        store.commit(vec![put_room(room.clone(), Some(0))]).unwrap();

        // Stale writer still expecting version 0 loses
        let mut stale = room.clone();
        stale.player_count = 2;
        stale.version = 1;
        let err = store.commit(vec![put_room(stale, Some(0))]).unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: Some(0),
                actual: Some(1),
            }
        ));

        assert_eq!(store.get_room(room.room_id).unwrap().player_count, 1);
    }

    #[test]
    fn test_commit_is_all_or_nothing() {
        let store = memory_store();
        let room = Room::new(ActorToken::generate(), 4);
        let player = Player::new(ActorToken::generate(), room.room_id, "Nils", false);

        // Player expects an existing row that is not there — whole commit
        // fails, the room must not appear either.
        let err = store
            .commit(vec![
                put_room(room.clone(), None),
                put_player(player, Some(3)),
            ])
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
        assert!(store.find_room(room.room_id).unwrap().is_none());
    }

    #[test]
    fn test_players_in_room_filters() {
        let store = memory_store();
        let room_a = RoomId::generate();
        let room_b = RoomId::generate();
        let p1 = Player::new(ActorToken::generate(), room_a, "A", true);
        let p2 = Player::new(ActorToken::generate(), room_a, "B", false);
        let p3 = Player::new(ActorToken::generate(), room_b, "C", true);

        store
            .commit(vec![
                put_player(p1, None),
                put_player(p2, None),
                put_player(p3, None),
            ])
            .unwrap();

        assert_eq!(store.players_in_room(room_a).unwrap().len(), 2);
        assert_eq!(store.players_in_room(room_b).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_player_idempotent() {
        let store = memory_store();
        let player = Player::new(ActorToken::generate(), RoomId::generate(), "D", false);
        let token = player.token;
        store.commit(vec![put_player(player, None)]).unwrap();

        store
            .commit(vec![RecordWrite::DeletePlayer { token }])
            .unwrap();
        assert!(store.find_player(token).unwrap().is_none());

        // Second delete is a no-op
        store
            .commit(vec![RecordWrite::DeletePlayer { token }])
            .unwrap();
    }

    #[test]
    fn test_large_record_roundtrips_compressed() {
        let store = memory_store();
        let token = ActorToken::generate();
        let mut player = Player::new(token, RoomId::generate(), "Hoarder", false);
        for i in 0..20 {
            player.collection.push(
                ItemSpec::new(format!("card-{i}"))
                    .with_meta("flavor", MetaValue::Text("x".repeat(200))),
            );
        }

        store.commit(vec![put_player(player.clone(), None)]).unwrap();
        assert_eq!(store.get_player(token).unwrap(), player);
    }

    #[test]
    fn test_rocks_backend_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let room = Room::new(ActorToken::generate(), 6);
        let id = room.room_id;

        {
            let store = SessionStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.commit(vec![put_room(room.clone(), None)]).unwrap();
        }

        let store = SessionStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.get_room(id).unwrap(), room);
        assert_eq!(store.list_rooms().unwrap().len(), 1);
    }
}
