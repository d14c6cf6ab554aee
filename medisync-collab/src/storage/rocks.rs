//! RocksDB-backed local persistence for one device.
//!
//! Column families:
//! - `snapshots`: full document snapshots (LZ4 compressed), keyed by doc id
//! - `pending`: local changes not yet accepted by the backend,
//!   keyed by `<doc id><0x00><sequence:8 bytes BE>`
//! - `offline`: offline event queue, keyed by sequence (8 bytes BE)
//! - `metadata`: per-document metadata (bincode)
//!
//! Snapshots are never overwritten in place: every write goes through a
//! `WriteBatch`, which RocksDB commits atomically through its own WAL. After
//! a crash the store holds either the previous snapshot or the new one.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_PENDING: &str = "pending";
const CF_OFFLINE: &str = "offline";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_PENDING, CF_OFFLINE, CF_METADATA];

/// Separates the doc id from the sequence in `pending` keys.
const KEY_SEPARATOR: u8 = 0x00;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write batch (default: true; a mutation is durable once its batch returns)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 8MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("medisync_data"),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 8 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Per-document metadata stored alongside snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: String,
    /// Number of snapshot writes so far
    pub version: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
    /// Last successful backend push (seconds since epoch)
    pub last_synced_at: Option<u64>,
}

impl DocumentMetadata {
    fn new(doc_id: &str) -> Self {
        let now = unix_now();
        Self {
            doc_id: doc_id.to_string(),
            version: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
            last_synced_at: None,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed local store.
pub struct LocalStore {
    /// RocksDB instance (single-threaded mode, concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Shared sequence for pending changes and offline events
    sequence: AtomicU64,
}

impl LocalStore {
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
        log::debug!(
            "Opened local store at {} (next sequence {sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Snapshots are already LZ4-compressed by us.
            CF_SNAPSHOTS => opts.set_compression_type(DBCompressionType::None),
            CF_OFFLINE | CF_PENDING | CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4)
            }
            _ => {}
        }

        opts
    }

    /// Next free sequence: one past the highest key in `offline` or `pending`.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let mut next = 0u64;

        if let Some(cf) = db.cf_handle(CF_OFFLINE) {
            if let Some(Ok((key, _))) = db.iterator_cf(&cf, IteratorMode::End).next() {
                if let Some(seq) = decode_seq(&key) {
                    next = next.max(seq + 1);
                }
            }
        }

        if let Some(cf) = db.cf_handle(CF_PENDING) {
            for item in db.iterator_cf(&cf, IteratorMode::Start) {
                let (key, _) = item?;
                if key.len() >= 8 {
                    if let Some(seq) = decode_seq(&key[key.len() - 8..]) {
                        next = next.max(seq + 1);
                    }
                }
            }
        }

        Ok(next)
    }

    /// Allocate the next sequence number.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Replace a document snapshot (and its metadata) atomically.
    pub fn save_snapshot(&self, doc_id: &str, snapshot: &[u8]) -> Result<DocumentMetadata, StoreError> {
        let mut batch = WriteBatch::default();
        let meta = self.stage_snapshot(&mut batch, doc_id, snapshot)?;
        self.write(batch)?;
        Ok(meta)
    }

    /// Persist a local mutation: the new snapshot and the change it produced,
    /// in one batch so neither can exist without the other.
    pub fn commit_local_change(
        &self,
        doc_id: &str,
        snapshot: &[u8],
        seq: u64,
        change: &[u8],
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_pending = self.cf(CF_PENDING)?;
        let mut batch = WriteBatch::default();
        let meta = self.stage_snapshot(&mut batch, doc_id, snapshot)?;
        batch.put_cf(&cf_pending, pending_key(doc_id, seq), change);
        self.write(batch)?;
        Ok(meta)
    }

    fn stage_snapshot(
        &self,
        batch: &mut WriteBatch,
        doc_id: &str,
        snapshot: &[u8],
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self
            .load_metadata(doc_id)?
            .unwrap_or_else(|| DocumentMetadata::new(doc_id));
        meta.version += 1;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        batch.put_cf(&cf_snapshots, doc_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, doc_id.as_bytes(), meta.encode()?);
        Ok(meta)
    }

    /// Load a document snapshot, `None` if the document was never persisted.
    pub fn load_snapshot(&self, doc_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn load_metadata(&self, doc_id: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// List all persisted document ids.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    // ─── Pending (unsynced) changes ───────────────────────────────────

    /// All unsynced changes of a document, in sequence order.
    pub fn load_pending(&self, doc_id: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_PENDING)?;
        let prefix = pending_prefix(doc_id);

        let mut out = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
                break;
            }
            if let Some(seq) = decode_seq(&key[prefix.len()..]) {
                out.push((seq, value.to_vec()));
            }
        }
        Ok(out)
    }

    /// Drop unsynced changes the backend has accepted, stamping `last_synced_at`.
    pub fn clear_pending(&self, doc_id: &str, seqs: &[u64]) -> Result<(), StoreError> {
        let cf_pending = self.cf(CF_PENDING)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        for seq in seqs {
            batch.delete_cf(&cf_pending, pending_key(doc_id, *seq));
        }
        if let Some(mut meta) = self.load_metadata(doc_id)? {
            meta.last_synced_at = Some(unix_now());
            batch.put_cf(&cf_meta, doc_id.as_bytes(), meta.encode()?);
        }
        self.write(batch)
    }

    // ─── Offline queue ────────────────────────────────────────────────

    /// Append an encoded offline event. Returns its sequence number.
    pub fn offline_append(&self, event: &[u8]) -> Result<u64, StoreError> {
        let cf = self.cf(CF_OFFLINE)?;
        let seq = self.next_sequence();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, seq.to_be_bytes(), event);
        self.write(batch)?;
        Ok(seq)
    }

    /// Read up to `limit` offline events from the head of the queue.
    pub fn offline_read(&self, limit: usize) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_OFFLINE)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start).take(limit) {
            let (key, value) = item?;
            if let Some(seq) = decode_seq(&key) {
                out.push((seq, value.to_vec()));
            }
        }
        Ok(out)
    }

    /// Remove offline events by sequence number.
    pub fn offline_remove(&self, seqs: &[u64]) -> Result<(), StoreError> {
        if seqs.is_empty() {
            return Ok(());
        }
        let cf = self.cf(CF_OFFLINE)?;
        let mut batch = WriteBatch::default();
        for seq in seqs {
            batch.delete_cf(&cf, seq.to_be_bytes());
        }
        self.write(batch)
    }

    pub fn offline_len(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_OFFLINE)?;
        let mut count = 0;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Force memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

fn pending_prefix(doc_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(doc_id.len() + 1);
    prefix.extend_from_slice(doc_id.as_bytes());
    prefix.push(KEY_SEPARATOR);
    prefix
}

fn pending_key(doc_id: &str, seq: u64) -> Vec<u8> {
    let mut key = pending_prefix(doc_id);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn decode_seq(bytes: &[u8]) -> Option<u64> {
    let buf: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(buf))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = open_temp();
        let data = b"patient record snapshot with enough bytes to compress".to_vec();

        let meta = store.save_snapshot("patient:1", &data).unwrap();
        assert_eq!(meta.doc_id, "patient:1");
        assert_eq!(meta.version, 1);
        assert_eq!(meta.snapshot_size, data.len() as u64);

        assert_eq!(store.load_snapshot("patient:1").unwrap(), Some(data));
        assert_eq!(store.load_snapshot("patient:2").unwrap(), None);
    }

    #[test]
    fn test_snapshot_replace_bumps_version() {
        let (_dir, store) = open_temp();
        store.save_snapshot("d", b"one").unwrap();
        let meta = store.save_snapshot("d", b"two").unwrap();
        assert_eq!(meta.version, 2);
        assert_eq!(store.load_snapshot("d").unwrap().unwrap(), b"two");
    }

    #[test]
    fn test_commit_local_change_writes_both() {
        let (_dir, store) = open_temp();
        let seq = store.next_sequence();
        store
            .commit_local_change("d", b"snapshot", seq, b"change")
            .unwrap();

        assert_eq!(store.load_snapshot("d").unwrap().unwrap(), b"snapshot");
        assert_eq!(store.load_pending("d").unwrap(), vec![(seq, b"change".to_vec())]);
    }

    #[test]
    fn test_pending_isolated_per_document() {
        let (_dir, store) = open_temp();
        // "d" is a prefix of "d2"; the separator keeps them apart.
        for doc in ["d", "d2"] {
            for i in 0..3u8 {
                let seq = store.next_sequence();
                store
                    .commit_local_change(doc, b"s", seq, &[i])
                    .unwrap();
            }
        }
        assert_eq!(store.load_pending("d").unwrap().len(), 3);
        assert_eq!(store.load_pending("d2").unwrap().len(), 3);
        assert!(store.load_pending("d3").unwrap().is_empty());
    }

    #[test]
    fn test_clear_pending_stamps_sync_time() {
        let (_dir, store) = open_temp();
        let a = store.next_sequence();
        let b = store.next_sequence();
        store.commit_local_change("d", b"s1", a, b"c1").unwrap();
        store.commit_local_change("d", b"s2", b, b"c2").unwrap();

        store.clear_pending("d", &[a]).unwrap();
        assert_eq!(store.load_pending("d").unwrap(), vec![(b, b"c2".to_vec())]);
        assert!(store.load_metadata("d").unwrap().unwrap().last_synced_at.is_some());
    }

    #[test]
    fn test_offline_fifo() {
        let (_dir, store) = open_temp();
        let s1 = store.offline_append(b"first").unwrap();
        let s2 = store.offline_append(b"second").unwrap();
        let s3 = store.offline_append(b"third").unwrap();
        assert!(s1 < s2 && s2 < s3);

        let head = store.offline_read(2).unwrap();
        assert_eq!(head, vec![(s1, b"first".to_vec()), (s2, b"second".to_vec())]);

        store.offline_remove(&[s1, s2]).unwrap();
        assert_eq!(store.offline_len().unwrap(), 1);
        assert_eq!(store.offline_read(10).unwrap()[0].0, s3);
    }

    #[test]
    fn test_sequence_recovers_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));

        let last = {
            let store = LocalStore::open(config.clone()).unwrap();
            store.offline_append(b"a").unwrap();
            let seq = store.next_sequence();
            store.commit_local_change("d", b"s", seq, b"c").unwrap();
            seq
        };

        let store = LocalStore::open(config).unwrap();
        assert_eq!(store.next_sequence(), last + 1);
        assert_eq!(store.offline_len().unwrap(), 1);
        assert_eq!(store.load_pending("d").unwrap().len(), 1);
    }

    #[test]
    fn test_list_documents() {
        let (_dir, store) = open_temp();
        store.save_snapshot("a", b"1").unwrap();
        store.save_snapshot("b", b"2").unwrap();
        let mut ids = store.list_documents().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_large_snapshot_compresses() {
        let (_dir, store) = open_temp();
        let data = vec![42u8; 1_000_000];
        let meta = store.save_snapshot("big", &data).unwrap();
        assert!(meta.compressed_size < 100_000);
        assert_eq!(store.load_snapshot("big").unwrap().unwrap().len(), 1_000_000);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert!(config.sync_writes);
        assert_eq!(config.bloom_filter_bits, 10);
    }
}
