//! RocksDB-backed message store.
//!
//! Column families:
//! - `messages`           — message records keyed by message id (bincode, LZ4 compressed)
//! - `conversation_index` — `<conversation_id:16><seq:8 BE>` → message id, prefix-scanned
//! - `meta`               — the append sequence counter
//!
//! The sequence counter gives every message a global append position, so a
//! prefix scan of the index yields a conversation's messages in order.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, SliceTransform, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

use murmur_core::{ChatMessage, ConversationId, MessageId};

use super::{MessageStore, StoreError, StoreUpdate};

const CF_MESSAGES: &str = "messages";
const CF_CONVERSATION_INDEX: &str = "conversation_index";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_MESSAGES, CF_CONVERSATION_INDEX, CF_META];

const SEQ_KEY: &[u8] = b"seq";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("murmur_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Default settings at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

pub struct RocksMessageStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next append position
    sequence: AtomicU64,
    /// Serializes appends and read-modify-write cycles
    write_lock: Mutex<()>,
}

impl RocksMessageStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db)?;
        log::info!(
            "Opened message store at {} (next seq {sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_MESSAGES => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_CONVERSATION_INDEX => {
                // Prefix-scanned by conversation id
                opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(16));
            }
            CF_META => {
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let cf = db
            .cf_handle(CF_META)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_META}' not found")))?;
        match db.get_cf(&cf, SEQ_KEY)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    pub fn message_count(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_MESSAGES)?;
        let mut count = 0;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    /// `conversation_id (16 bytes) + seq (8 bytes big-endian)`
    fn index_key(conversation_id: &ConversationId, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(conversation_id.as_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn encode_message(message: &ChatMessage) -> Result<Vec<u8>, StoreError> {
        let bytes = bincode::serde::encode_to_vec(message, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&bytes))
    }

    fn decode_message(bytes: &[u8]) -> Result<ChatMessage, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let (message, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(message)
    }

    fn load(&self, message_id: &MessageId) -> Result<Option<ChatMessage>, StoreError> {
        let cf = self.cf(CF_MESSAGES)?;
        match self.db.get_cf(&cf, message_id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode_message(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl MessageStore for RocksMessageStore {
    fn append(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let cf_messages = self.cf(CF_MESSAGES)?;
        let cf_index = self.cf(CF_CONVERSATION_INDEX)?;
        let cf_meta = self.cf(CF_META)?;

        if self.db.get_cf(&cf_messages, message.id.as_bytes())?.is_some() {
            return Err(StoreError::Duplicate(message.id));
        }

        let seq = self.sequence.load(Ordering::SeqCst);
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_messages, message.id.as_bytes(), Self::encode_message(message)?);
        batch.put_cf(
            &cf_index,
            Self::index_key(&message.conversation_id, seq),
            message.id.as_bytes(),
        );
        batch.put_cf(&cf_meta, SEQ_KEY, (seq + 1).to_be_bytes());
        self.db.write_opt(batch, &self.write_options())?;

        self.sequence.store(seq + 1, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, message_id: &MessageId) -> Result<ChatMessage, StoreError> {
        self.load(message_id)?
            .ok_or(StoreError::NotFound(*message_id))
    }

    fn find_by_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let cf_index = self.cf(CF_CONVERSATION_INDEX)?;
        let start_key = Self::index_key(conversation_id, 0);

        let mut messages = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf_index, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() < 24 || &key[..16] != conversation_id.as_bytes() {
                break;
            }
            let id = Uuid::from_slice(&value)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            // Index entries are written in the same batch as the record
            match self.load(&id)? {
                Some(message) => messages.push(message),
                None => log::warn!("Index entry for missing message {id}"),
            }
        }
        Ok(messages)
    }

    fn modify(
        &self,
        message_id: &MessageId,
        f: &mut dyn FnMut(&mut ChatMessage) -> bool,
    ) -> Result<StoreUpdate, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut message = self
            .load(message_id)?
            .ok_or(StoreError::NotFound(*message_id))?;
        let changed = f(&mut message);
        if changed {
            let cf = self.cf(CF_MESSAGES)?;
            self.db.put_cf_opt(
                &cf,
                message_id.as_bytes(),
                Self::encode_message(&message)?,
                &self.write_options(),
            )?;
        }
        Ok(StoreUpdate { message, changed })
    }
}

fn decode_u64(bytes: &[u8]) -> Result<u64, StoreError> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Deserialization("Invalid sequence value".into()))?;
    Ok(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_core::{Conversation, MessageStatus};
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, RocksMessageStore) {
        let dir = TempDir::new().unwrap();
        let store = RocksMessageStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    fn message_in(conv: &Conversation, content: &str) -> ChatMessage {
        ChatMessage::new(conv, conv.participants[0], content, Some(Uuid::new_v4()), 1_000)
    }

    #[test]
    fn test_store_open() {
        let (dir, store) = open_temp();
        assert_eq!(store.path(), dir.path());
        assert_eq!(store.message_count().unwrap(), 0);
    }

    #[test]
    fn test_append_get() {
        let (_dir, store) = open_temp();
        let conv = Conversation::group("team", [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()]);
        let msg = message_in(&conv, "Hello, team! This is long enough to be worth compressing.");

        store.append(&msg).unwrap();
        assert_eq!(store.get(&msg.id).unwrap(), msg);
        assert_eq!(store.append(&msg), Err(StoreError::Duplicate(msg.id)));
    }

    #[test]
    fn test_not_found() {
        let (_dir, store) = open_temp();
        let id = Uuid::new_v4();
        assert_eq!(store.get(&id), Err(StoreError::NotFound(id)));
        assert!(matches!(
            store.add_delivery_receipt(&id, Uuid::new_v4(), 0),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_conversation_order_and_isolation() {
        let (_dir, store) = open_temp();
        let conv = Conversation::direct(Uuid::new_v4(), Uuid::new_v4());
        let other = Conversation::direct(Uuid::new_v4(), Uuid::new_v4());

        for i in 0..10 {
            store.append(&message_in(&conv, &format!("m{i}"))).unwrap();
            store.append(&message_in(&other, &format!("o{i}"))).unwrap();
        }

        let found = store.find_by_conversation(&conv.id).unwrap();
        assert_eq!(found.len(), 10);
        assert_eq!(found[0].content, "m0");
        assert_eq!(found[9].content, "m9");
        assert!(found.iter().all(|m| m.conversation_id == conv.id));
        assert!(store.find_by_conversation(&Uuid::new_v4()).unwrap().is_empty());
    }

    #[test]
    fn test_modify_persists_receipts() {
        let (_dir, store) = open_temp();
        let conv = Conversation::direct(Uuid::new_v4(), Uuid::new_v4());
        let reader = conv.participants[1];
        let msg = message_in(&conv, "hi");
        store.append(&msg).unwrap();

        let update = store.add_read_receipt(&msg.id, reader, 2_000).unwrap();
        assert!(update.changed);
        assert!(update.message.was_delivered_to(&reader));

        let again = store.add_read_receipt(&msg.id, reader, 3_000).unwrap();
        assert!(!again.changed);

        let stored = store.get(&msg.id).unwrap();
        assert_eq!(stored.read_by.iter().filter(|r| r.user_id == reader).count(), 1);
    }

    #[test]
    fn test_reopen_recovers_messages_and_sequence() {
        let dir = TempDir::new().unwrap();
        let conv = Conversation::direct(Uuid::new_v4(), Uuid::new_v4());
        let first = message_in(&conv, "before restart");

        {
            let store = RocksMessageStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.append(&first).unwrap();
            store.set_status(&first.id, MessageStatus::Delivered).unwrap();
            store.sync().unwrap();
        }

        let store = RocksMessageStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.get(&first.id).unwrap().status, MessageStatus::Delivered);

        let second = message_in(&conv, "after restart");
        store.append(&second).unwrap();
        let found = store.find_by_conversation(&conv.id).unwrap();
        let contents: Vec<&str> = found.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["before restart", "after restart"]);
    }
}
