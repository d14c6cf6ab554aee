//! Local Document Store: in-memory merged state of every open document,
//! backed by the RocksDB [`LocalStore`].
//!
//! Architecture:
//! ```text
//!   mutate(doc, edit) ─┐                       ┌──► broadcast: LocalChange
//!                      ├─► Mutex<Document> ────┤
//! apply_change(doc) ───┘   (one writer/doc)    └──► persister queue (FIFO)
//!                                                        │
//!                                                        ▼
//!                                              LocalStore WriteBatch
//! ```
//!
//! Every write, awaited or deferred, goes through the same persister task, so
//! writes reach disk in the order the mutations happened. A caller that picks
//! [`Durability::Await`] gets control back only after its batch is on disk.
//!
//! A local edit that fails to persist is still in memory and still pending, so
//! it is published to peers anyway; the caller gets the storage error.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::engine::{EngineError, MergeEngine};
use crate::storage::{LocalStore, StoreError};

const PERSIST_QUEUE_CAPACITY: usize = 1024;
const CHANGE_FEED_CAPACITY: usize = 256;
/// Digests remembered per document for duplicate detection.
pub const SEEN_CAPACITY: usize = 4096;
/// Quarantined changes kept per document; the oldest is dropped first.
pub const REJECTED_CAPACITY: usize = 256;

/// One edit's delta. Immutable; two changes are equal when their bytes are.
#[derive(Clone)]
pub struct Change {
    bytes: Arc<[u8]>,
    digest: [u8; 32],
}

impl Change {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        let digest = Sha256::digest(&bytes).into();
        Self {
            bytes: bytes.into(),
            digest,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl PartialEq for Change {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl Eq for Change {}

impl fmt::Debug for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Change({} bytes, {:02x}{:02x}{:02x}{:02x}…)",
            self.bytes.len(),
            self.digest[0],
            self.digest[1],
            self.digest[2],
            self.digest[3]
        )
    }
}

impl From<Vec<u8>> for Change {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

/// Whether a write must be on disk before the call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Wait for the write batch to commit.
    Await,
    /// Queue the write and return; `flush()` waits for it.
    Deferred,
}

/// Result of merging a remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already part of the document; nothing changed.
    Duplicate,
    /// Zero-length change; nothing to do.
    Empty,
}

/// A change produced on this device, published for peer transports.
#[derive(Debug, Clone)]
pub struct LocalChange {
    pub doc_id: String,
    pub change: Change,
}

/// Document store errors.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("change rejected for document {doc_id}: {source}")]
    Merge {
        doc_id: String,
        #[source]
        source: EngineError,
    },
    #[error("persisted snapshot of {doc_id} is unreadable: {source}")]
    Corrupt {
        doc_id: String,
        #[source]
        source: EngineError,
    },
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("persister stopped")]
    PersisterClosed,
}

/// Most recent change digests, oldest evicted first. Merges are idempotent,
/// so an evicted digest only costs a redundant merge.
struct DigestWindow {
    set: HashSet<[u8; 32]>,
    order: VecDeque<[u8; 32]>,
    capacity: usize,
}

impl DigestWindow {
    fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, digest: &[u8; 32]) -> bool {
        self.set.contains(digest)
    }

    fn insert(&mut self, digest: [u8; 32]) {
        if !self.set.insert(digest) {
            return;
        }
        self.order.push_back(digest);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, digest: &[u8; 32]) {
        if self.set.remove(digest) {
            self.order.retain(|d| d != digest);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.set.len()
    }
}

struct Document<E> {
    engine: E,
    /// Digests of recent changes merged or produced here
    seen: DigestWindow,
    /// Unsynced local changes by sequence
    pending: BTreeMap<u64, Change>,
    /// Changes the engine refused, kept for manual reconciliation
    rejected: Vec<Change>,
}

impl<E: MergeEngine> Document<E> {
    fn empty() -> Self {
        Self {
            engine: E::default(),
            seen: DigestWindow::new(SEEN_CAPACITY),
            pending: BTreeMap::new(),
            rejected: Vec::new(),
        }
    }
}

enum PersistOp {
    Snapshot {
        doc_id: String,
        snapshot: Vec<u8>,
    },
    LocalChange {
        doc_id: String,
        snapshot: Vec<u8>,
        seq: u64,
        change: Change,
    },
    ClearPending {
        doc_id: String,
        seqs: Vec<u64>,
    },
    Flush,
}

impl PersistOp {
    fn apply(self, store: &LocalStore) -> Result<(), StoreError> {
        match self {
            PersistOp::Snapshot { doc_id, snapshot } => {
                store.save_snapshot(&doc_id, &snapshot).map(|_| ())
            }
            PersistOp::LocalChange {
                doc_id,
                snapshot,
                seq,
                change,
            } => store
                .commit_local_change(&doc_id, &snapshot, seq, change.as_bytes())
                .map(|_| ()),
            PersistOp::ClearPending { doc_id, seqs } => store.clear_pending(&doc_id, &seqs),
            PersistOp::Flush => store.flush(),
        }
    }
}

struct PersistJob {
    op: PersistOp,
    reply: Option<oneshot::Sender<Result<(), StoreError>>>,
}

/// In-memory documents plus their durable copy.
pub struct DocumentStore<E: MergeEngine> {
    store: Arc<LocalStore>,
    docs: RwLock<HashMap<String, Arc<Mutex<Document<E>>>>>,
    persist_tx: mpsc::Sender<PersistJob>,
    persister: JoinHandle<()>,
    changes_tx: broadcast::Sender<LocalChange>,
}

impl<E: MergeEngine> DocumentStore<E> {
    /// Create the store and start its persister task. Requires a tokio runtime.
    pub fn new(store: Arc<LocalStore>) -> Self {
        let (persist_tx, mut persist_rx) = mpsc::channel::<PersistJob>(PERSIST_QUEUE_CAPACITY);
        let (changes_tx, _) = broadcast::channel(CHANGE_FEED_CAPACITY);

        let persister_store = store.clone();
        let persister = tokio::spawn(async move {
            while let Some(job) = persist_rx.recv().await {
                let result = job.op.apply(&persister_store);
                match job.reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            log::error!("Deferred write failed: {e}");
                        }
                    }
                }
            }
            log::debug!("Persister stopped");
        });

        Self {
            store,
            docs: RwLock::new(HashMap::new()),
            persist_tx,
            persister,
            changes_tx,
        }
    }

    /// Load a document from disk, or create it empty. No-op when already loaded.
    pub async fn initialize(&self, doc_id: &str) -> Result<(), DocumentError> {
        self.document(doc_id).await.map(|_| ())
    }

    async fn document(&self, doc_id: &str) -> Result<Arc<Mutex<Document<E>>>, DocumentError> {
        if let Some(doc) = self.docs.read().await.get(doc_id) {
            return Ok(doc.clone());
        }

        let mut docs = self.docs.write().await;
        if let Some(doc) = docs.get(doc_id) {
            return Ok(doc.clone());
        }

        let mut doc = Document::<E>::empty();
        if let Some(snapshot) = self.store.load_snapshot(doc_id)? {
            doc.engine
                .restore(&snapshot)
                .map_err(|source| DocumentError::Corrupt {
                    doc_id: doc_id.to_string(),
                    source,
                })?;
            for (seq, bytes) in self.store.load_pending(doc_id)? {
                let change = Change::new(bytes);
                doc.seen.insert(*change.digest());
                doc.pending.insert(seq, change);
            }
            log::info!(
                "Loaded document {doc_id} from storage ({} unsynced changes)",
                doc.pending.len()
            );
        } else {
            log::debug!("Created empty document {doc_id}");
        }

        let doc = Arc::new(Mutex::new(doc));
        docs.insert(doc_id.to_string(), doc.clone());
        Ok(doc)
    }

    /// Merge a change received from a peer or the backend.
    pub async fn apply_change(
        &self,
        doc_id: &str,
        change: &Change,
        durability: Durability,
    ) -> Result<ApplyOutcome, DocumentError> {
        if change.is_empty() {
            return Ok(ApplyOutcome::Empty);
        }

        let doc = self.document(doc_id).await?;
        let reply = {
            let mut doc = doc.lock().await;
            if doc.seen.contains(change.digest()) {
                return Ok(ApplyOutcome::Duplicate);
            }

            if let Err(source) = doc.engine.merge(change.as_bytes()) {
                log::warn!("Quarantined change {change:?} for document {doc_id}: {source}");
                if !doc.rejected.contains(change) {
                    if doc.rejected.len() >= REJECTED_CAPACITY {
                        doc.rejected.remove(0);
                    }
                    doc.rejected.push(change.clone());
                }
                return Err(DocumentError::Merge {
                    doc_id: doc_id.to_string(),
                    source,
                });
            }
            doc.seen.insert(*change.digest());

            let op = PersistOp::Snapshot {
                doc_id: doc_id.to_string(),
                snapshot: doc.engine.snapshot(),
            };
            self.enqueue(op, durability).await?
        };

        if let Err(e) = Self::wait(reply).await {
            // Forget the change so a resend merges and persists it again.
            doc.lock().await.seen.remove(change.digest());
            return Err(e);
        }
        Ok(ApplyOutcome::Applied)
    }

    /// Apply a local edit. `edit` returns the change it produced, which is
    /// published to peers even when persisting it fails.
    pub async fn mutate<F>(
        &self,
        doc_id: &str,
        durability: Durability,
        edit: F,
    ) -> Result<Change, DocumentError>
    where
        F: FnOnce(&mut E) -> Vec<u8>,
    {
        let doc = self.document(doc_id).await?;
        let (change, queued) = {
            let mut doc = doc.lock().await;
            let change = Change::new(edit(&mut doc.engine));
            if change.is_empty() {
                return Ok(change);
            }

            let seq = self.store.next_sequence();
            doc.seen.insert(*change.digest());
            doc.pending.insert(seq, change.clone());

            let op = PersistOp::LocalChange {
                doc_id: doc_id.to_string(),
                snapshot: doc.engine.snapshot(),
                seq,
                change: change.clone(),
            };
            (change, self.enqueue(op, durability).await)
        };
        let written = match queued {
            Ok(reply) => Self::wait(reply).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &written {
            log::error!("Local change {change:?} to {doc_id} not persisted: {e}");
        }

        // No subscribers simply means no open transports.
        let _ = self.changes_tx.send(LocalChange {
            doc_id: doc_id.to_string(),
            change: change.clone(),
        });
        written.map(|()| change)
    }

    /// Read the current merged state.
    pub async fn read<R>(&self, doc_id: &str, f: impl FnOnce(&E) -> R) -> Result<R, DocumentError> {
        let doc = self.document(doc_id).await?;
        let doc = doc.lock().await;
        Ok(f(&doc.engine))
    }

    /// Full snapshot of the current state.
    pub async fn snapshot(&self, doc_id: &str) -> Result<Vec<u8>, DocumentError> {
        self.read(doc_id, |engine| engine.snapshot()).await
    }

    /// Unsynced local changes, oldest first.
    pub async fn pending_changes(&self, doc_id: &str) -> Result<Vec<(u64, Change)>, DocumentError> {
        let doc = self.document(doc_id).await?;
        let doc = doc.lock().await;
        Ok(doc
            .pending
            .iter()
            .map(|(seq, change)| (*seq, change.clone()))
            .collect())
    }

    /// Changes the engine refused to merge.
    pub async fn rejected_changes(&self, doc_id: &str) -> Result<Vec<Change>, DocumentError> {
        let doc = self.document(doc_id).await?;
        let doc = doc.lock().await;
        Ok(doc.rejected.clone())
    }

    /// Forget unsynced changes the backend has accepted.
    pub async fn mark_synced(&self, doc_id: &str, seqs: &[u64]) -> Result<(), DocumentError> {
        if seqs.is_empty() {
            return Ok(());
        }
        let doc = self.document(doc_id).await?;
        let reply = {
            let mut doc = doc.lock().await;
            for seq in seqs {
                doc.pending.remove(seq);
            }
            let op = PersistOp::ClearPending {
                doc_id: doc_id.to_string(),
                seqs: seqs.to_vec(),
            };
            self.enqueue(op, Durability::Await).await?
        };
        Self::wait(reply).await
    }

    /// Wait until every queued write, deferred ones included, is on disk.
    pub async fn flush(&self) -> Result<(), DocumentError> {
        let reply = self.enqueue(PersistOp::Flush, Durability::Await).await?;
        Self::wait(reply).await
    }

    /// Feed of changes produced on this device.
    pub fn subscribe(&self) -> broadcast::Receiver<LocalChange> {
        self.changes_tx.subscribe()
    }

    /// Ids of documents currently loaded, sorted.
    pub async fn documents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.docs.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Flush, stop the persister and wait for it to exit.
    pub async fn close(self) -> Result<(), DocumentError> {
        self.flush().await?;
        let Self {
            persist_tx,
            persister,
            ..
        } = self;
        drop(persist_tx);
        if let Err(e) = persister.await {
            log::error!("Persister task failed: {e}");
        }
        Ok(())
    }

    async fn enqueue(
        &self,
        op: PersistOp,
        durability: Durability,
    ) -> Result<Option<oneshot::Receiver<Result<(), StoreError>>>, DocumentError> {
        let (reply, rx) = match durability {
            Durability::Await => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            }
            Durability::Deferred => (None, None),
        };
        self.persist_tx
            .send(PersistJob { op, reply })
            .await
            .map_err(|_| DocumentError::PersisterClosed)?;
        Ok(rx)
    }

    async fn wait(
        reply: Option<oneshot::Receiver<Result<(), StoreError>>>,
    ) -> Result<(), DocumentError> {
        match reply {
            Some(rx) => rx.await.map_err(|_| DocumentError::PersisterClosed)?.map_err(Into::into),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RecordEngine;
    use crate::storage::StoreConfig;
    use std::path::Path;

    fn open(path: &Path) -> DocumentStore<RecordEngine> {
        let store = LocalStore::open(StoreConfig::for_testing(path)).unwrap();
        DocumentStore::new(Arc::new(store))
    }

    #[tokio::test]
    async fn test_mutate_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let docs = open(&dir.path().join("db"));

        let change = docs
            .mutate("patient:1", Durability::Await, |e| e.set_field("name", "Amina"))
            .await
            .unwrap();
        assert!(!change.is_empty());

        let name = docs.read("patient:1", |e| e.field("name")).await.unwrap();
        assert_eq!(name.as_deref(), Some("Amina"));

        let pending = docs.pending_changes("patient:1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1, change);
    }

    #[tokio::test]
    async fn test_state_and_pending_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");

        {
            let docs = open(&path);
            docs.mutate("p", Durability::Deferred, |e| e.append_note("rx: ibuprofen"))
                .await
                .unwrap();
            docs.mutate("p", Durability::Deferred, |e| e.add_visit("2026-05-02"))
                .await
                .unwrap();
            docs.close().await.unwrap();
        }

        let docs = open(&path);
        docs.initialize("p").await.unwrap();
        assert_eq!(docs.read("p", |e| e.notes()).await.unwrap(), "rx: ibuprofen");
        assert_eq!(docs.read("p", |e| e.visits()).await.unwrap().len(), 1);
        assert_eq!(docs.pending_changes("p").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_apply_change_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let docs = open(&dir.path().join("db"));

        let mut remote = RecordEngine::new();
        let change = Change::new(remote.set_field("dob", "1990-01-01"));

        let first = docs.apply_change("p", &change, Durability::Await).await.unwrap();
        let before = docs.snapshot("p").await.unwrap();
        let second = docs.apply_change("p", &change, Durability::Await).await.unwrap();

        assert_eq!(first, ApplyOutcome::Applied);
        assert_eq!(second, ApplyOutcome::Duplicate);
        assert_eq!(docs.snapshot("p").await.unwrap(), before);
        // Remote changes are not ours to push.
        assert!(docs.pending_changes("p").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_change_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let docs = open(&dir.path().join("db"));
        let outcome = docs
            .apply_change("p", &Change::new(Vec::new()), Durability::Await)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Empty);
    }

    #[tokio::test]
    async fn test_malformed_change_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let docs = open(&dir.path().join("db"));
        docs.mutate("p", Durability::Await, |e| e.set_field("name", "Baraka"))
            .await
            .unwrap();

        let bad = Change::new(vec![0xFF, 0xFE, 0xFD, 0xFC]);
        let result = docs.apply_change("p", &bad, Durability::Await).await;
        assert!(matches!(result, Err(DocumentError::Merge { .. })));

        // Same change twice is quarantined once.
        let _ = docs.apply_change("p", &bad, Durability::Await).await;
        assert_eq!(docs.rejected_changes("p").await.unwrap(), vec![bad]);

        // The document keeps working.
        assert_eq!(
            docs.read("p", |e| e.field("name")).await.unwrap().as_deref(),
            Some("Baraka")
        );
        docs.mutate("p", Durability::Await, |e| e.append_note("ok"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mark_synced_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let docs = open(&path);
            docs.mutate("p", Durability::Await, |e| e.set_field("a", "1"))
                .await
                .unwrap();
            docs.mutate("p", Durability::Await, |e| e.set_field("b", "2"))
                .await
                .unwrap();
            let seqs: Vec<u64> = docs
                .pending_changes("p")
                .await
                .unwrap()
                .into_iter()
                .map(|(seq, _)| seq)
                .take(1)
                .collect();
            docs.mark_synced("p", &seqs).await.unwrap();
            assert_eq!(docs.pending_changes("p").await.unwrap().len(), 1);
            docs.close().await.unwrap();
        }
        let docs = open(&path);
        assert_eq!(docs.pending_changes("p").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_sees_local_changes() {
        let dir = tempfile::tempdir().unwrap();
        let docs = open(&dir.path().join("db"));
        let mut feed = docs.subscribe();

        let change = docs
            .mutate("p", Durability::Deferred, |e| e.append_note("hello"))
            .await
            .unwrap();
        let published = feed.recv().await.unwrap();
        assert_eq!(published.doc_id, "p");
        assert_eq!(published.change, change);

        // Remote changes are not republished.
        let mut remote = RecordEngine::new();
        let incoming = Change::new(remote.set_field("x", "y"));
        docs.apply_change("p", &incoming, Durability::Await).await.unwrap();
        assert!(feed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_two_devices_converge() {
        let dir = tempfile::tempdir().unwrap();
        let a = open(&dir.path().join("a"));
        let b = open(&dir.path().join("b"));

        let from_a = a
            .mutate("p", Durability::Await, |e| e.append_note("[A] bp 120/80. "))
            .await
            .unwrap();
        let from_b = b
            .mutate("p", Durability::Await, |e| e.append_note("[B] temp 37.2. "))
            .await
            .unwrap();

        a.apply_change("p", &from_b, Durability::Await).await.unwrap();
        b.apply_change("p", &from_a, Durability::Await).await.unwrap();

        let notes_a = a.read("p", |e| e.notes()).await.unwrap();
        let notes_b = b.read("p", |e| e.notes()).await.unwrap();
        assert_eq!(notes_a, notes_b);
        assert!(notes_a.contains("[A] bp 120/80."));
        assert!(notes_a.contains("[B] temp 37.2."));
    }

    #[tokio::test]
    async fn test_documents_lists_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let docs = open(&dir.path().join("db"));
        docs.initialize("b").await.unwrap();
        docs.initialize("a").await.unwrap();
        docs.initialize("a").await.unwrap();
        assert_eq!(docs.documents().await, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_digest_window_evicts_oldest() {
        let mut window = DigestWindow::new(3);
        for i in 0..5u8 {
            window.insert([i; 32]);
        }
        assert_eq!(window.len(), 3);
        assert!(!window.contains(&[0; 32]) && !window.contains(&[1; 32]));
        assert!(window.contains(&[4; 32]));

        // Re-inserting a live digest does not push anything out.
        window.insert([2; 32]);
        assert!(window.contains(&[2; 32]));

        window.remove(&[3; 32]);
        window.insert([5; 32]);
        window.insert([6; 32]);
        assert_eq!(window.len(), 3);
        assert!(!window.contains(&[2; 32]));
        assert!(window.contains(&[4; 32]) && window.contains(&[6; 32]));
    }

    #[tokio::test]
    async fn test_rejected_changes_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let docs = open(&dir.path().join("db"));

        let total = REJECTED_CAPACITY + 44;
        let mut last = None;
        for i in 0..total {
            let bad = Change::new(vec![
                0xFF,
                0xFE,
                0xFD,
                0xFC,
                0x80 | (i & 0x7F) as u8,
                0x80 | (i >> 7) as u8,
            ]);
            assert!(docs.apply_change("p", &bad, Durability::Await).await.is_err());
            last = Some(bad);
        }

        let rejected = docs.rejected_changes("p").await.unwrap();
        assert_eq!(rejected.len(), REJECTED_CAPACITY);
        assert_eq!(rejected.last(), last.as_ref());
    }

    #[tokio::test]
    async fn test_edit_published_when_persist_fails() {
        let dir = tempfile::tempdir().unwrap();
        let docs = open(&dir.path().join("db"));
        docs.initialize("p").await.unwrap();
        let mut feed = docs.subscribe();

        docs.persister.abort();
        while !docs.persister.is_finished() {
            tokio::task::yield_now().await;
        }

        let result = docs
            .mutate("p", Durability::Await, |e| e.set_field("allergy", "latex"))
            .await;
        assert!(matches!(result, Err(DocumentError::PersisterClosed)));

        let published = feed.try_recv().unwrap();
        assert_eq!(published.doc_id, "p");
        assert_eq!(
            docs.read("p", |e| e.field("allergy")).await.unwrap().as_deref(),
            Some("latex")
        );
        let pending = docs.pending_changes("p").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1, published.change);
    }

    #[test]
    fn test_change_equality_by_content() {
        let a = Change::new(vec![1, 2, 3]);
        let b = Change::from(vec![1, 2, 3]);
        assert_eq!(a, b);
        assert_ne!(a, Change::new(vec![3, 2, 1]));
    }
}
