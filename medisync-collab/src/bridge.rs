//! Server sync bridge: reconciles local state with the backend whenever it
//! is reachable.
//!
//! ```text
//!             push: unsynced changes ──────────►
//! DocumentStore                                   SyncBackend
//!             ◄────────── pull: canonical snapshot (merged, never replaces)
//! OfflineQueue ── drain: FIFO batches ─────────►  (accepted items evicted)
//! ```
//!
//! Nothing is removed locally until the backend has confirmed it. Errors stay
//! inside the bridge: they are logged and the next cycle retries.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{watch, Notify, RwLock};
use tokio::time::{Duration, MissedTickBehavior};

use crate::document::{ApplyOutcome, Change, DocumentError, DocumentStore, Durability};
use crate::engine::MergeEngine;
use crate::offline::{OfflineEvent, OfflineQueue, QueueError};

/// Backend answer to an offline upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UploadReceipt {
    /// Indices (into the uploaded batch) the backend accepted.
    /// `None` means the whole batch was accepted.
    #[serde(default)]
    pub accepted: Option<Vec<usize>>,
}

impl UploadReceipt {
    pub fn all() -> Self {
        Self { accepted: None }
    }

    pub fn only(indices: Vec<usize>) -> Self {
        Self {
            accepted: Some(indices),
        }
    }
}

/// The server side of synchronization.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Upload a batch of changes for one document.
    async fn upload_changes(&self, doc_id: &str, changes: &[Vec<u8>]) -> Result<(), BridgeError>;

    /// Fetch the canonical snapshot, `None` if the server has no such document.
    async fn fetch_snapshot(&self, doc_id: &str) -> Result<Option<Vec<u8>>, BridgeError>;

    /// Upload a batch of offline events.
    async fn upload_offline(&self, items: &[OfflineEvent]) -> Result<UploadReceipt, BridgeError>;
}

/// Bridge errors.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
    #[error("invalid backend url: {0}")]
    InvalidUrl(String),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        BridgeError::Unreachable(e.to_string())
    }
}

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Time between periodic sync cycles
    pub interval: Duration,
    /// Offline events per upload request
    pub batch_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 100,
        }
    }
}

impl BridgeConfig {
    pub fn for_testing() -> Self {
        Self {
            interval: Duration::from_millis(100),
            batch_size: 2,
        }
    }
}

/// Result of one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Changes uploaded
    pub pushed: usize,
    /// Server snapshots merged that were not already known locally
    pub pulled: usize,
    /// Offline events confirmed
    pub offline_uploaded: usize,
    /// Operations that failed (logged, retried next cycle)
    pub failures: usize,
}

pub struct SyncBridge<E: MergeEngine, B: SyncBackend> {
    docs: Arc<DocumentStore<E>>,
    queue: Arc<OfflineQueue>,
    backend: B,
    config: BridgeConfig,
    tracked: RwLock<BTreeSet<String>>,
    reconnect: Notify,
}

impl<E: MergeEngine, B: SyncBackend> SyncBridge<E, B> {
    pub fn new(
        docs: Arc<DocumentStore<E>>,
        queue: Arc<OfflineQueue>,
        backend: B,
        config: BridgeConfig,
    ) -> Self {
        Self {
            docs,
            queue,
            backend,
            config,
            tracked: RwLock::new(BTreeSet::new()),
            reconnect: Notify::new(),
        }
    }

    /// Include a document in every sync cycle.
    pub async fn track(&self, doc_id: impl Into<String>) {
        self.tracked.write().await.insert(doc_id.into());
    }

    pub async fn tracked(&self) -> Vec<String> {
        self.tracked.read().await.iter().cloned().collect()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Upload unsynced changes as one batch. Returns how many were accepted.
    pub async fn push(&self, doc_id: &str) -> Result<usize, BridgeError> {
        let pending = self.docs.pending_changes(doc_id).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let seqs: Vec<u64> = pending.iter().map(|(seq, _)| *seq).collect();
        let changes: Vec<Vec<u8>> = pending
            .iter()
            .map(|(_, change)| change.as_bytes().to_vec())
            .collect();

        self.backend.upload_changes(doc_id, &changes).await?;
        self.docs.mark_synced(doc_id, &seqs).await?;
        log::info!("Pushed {} changes of {doc_id}", changes.len());
        Ok(changes.len())
    }

    /// Merge the server's snapshot into the local document.
    ///
    /// Returns `true` if the snapshot was new to this device. Local edits not
    /// yet on the server survive because the snapshot is merged, not restored.
    pub async fn pull(&self, doc_id: &str) -> Result<bool, BridgeError> {
        let Some(snapshot) = self.backend.fetch_snapshot(doc_id).await? else {
            log::debug!("Server has no document {doc_id} yet");
            return Ok(false);
        };
        let outcome = self
            .docs
            .apply_change(doc_id, &Change::new(snapshot), Durability::Await)
            .await?;
        Ok(outcome == ApplyOutcome::Applied)
    }

    /// Upload offline events in FIFO batches. Returns how many were confirmed.
    ///
    /// Stops at the first failed batch (which stays queued in full) or at the
    /// first batch the backend accepted only in part.
    pub async fn drain_offline(&self) -> Result<usize, BridgeError> {
        let mut confirmed_total = 0;
        loop {
            let batch = self.queue.peek(self.config.batch_size.max(1))?;
            if batch.is_empty() {
                break;
            }

            let items: Vec<OfflineEvent> = batch.iter().map(|q| q.event.clone()).collect();
            let receipt = self.backend.upload_offline(&items).await?;

            let confirmed: Vec<u64> = match receipt.accepted {
                None => batch.iter().map(|q| q.seq).collect(),
                Some(indices) => indices
                    .into_iter()
                    .filter_map(|i| batch.get(i).map(|q| q.seq))
                    .collect::<BTreeSet<u64>>()
                    .into_iter()
                    .collect(),
            };
            self.queue.confirm(&confirmed)?;
            confirmed_total += confirmed.len();

            if confirmed.len() < batch.len() {
                log::warn!(
                    "Backend accepted {}/{} offline events; the rest stay queued",
                    confirmed.len(),
                    batch.len()
                );
                break;
            }
        }
        if confirmed_total > 0 {
            log::info!("Uploaded {confirmed_total} offline events");
        }
        Ok(confirmed_total)
    }

    /// One full cycle: push and pull every tracked document, then drain the
    /// offline queue. Failures are counted, never propagated.
    pub async fn sync_once(&self) -> SyncReport {
        let mut report = SyncReport::default();

        for doc_id in self.tracked().await {
            match self.push(&doc_id).await {
                Ok(n) => report.pushed += n,
                Err(e) => {
                    report.failures += 1;
                    log::warn!("Push of {doc_id} failed: {e}");
                }
            }
            match self.pull(&doc_id).await {
                Ok(true) => report.pulled += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failures += 1;
                    log::warn!("Pull of {doc_id} failed: {e}");
                }
            }
        }

        match self.drain_offline().await {
            Ok(n) => report.offline_uploaded = n,
            Err(e) => {
                report.failures += 1;
                log::warn!("Offline upload failed: {e}");
            }
        }

        report
    }

    /// Trigger a cycle now, e.g. when connectivity returns.
    pub fn reconnected(&self) {
        self.reconnect.notify_one();
    }

    /// Sync on every interval tick and on each reconnect signal until
    /// `shutdown` turns `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("Sync bridge running every {:?}", self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.reconnect.notified() => {
                    log::info!("Connectivity restored, syncing now");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let report = self.sync_once().await;
            if report.failures > 0 {
                log::debug!("Sync cycle finished with {} failures", report.failures);
            }
        }
        log::info!("Sync bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RecordEngine;
    use crate::storage::{LocalStore, StoreConfig};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Backend keeping one yrs document per id, like the real server.
    #[derive(Default)]
    struct MemoryBackend {
        docs: Mutex<HashMap<String, RecordEngine>>,
        offline: Mutex<Vec<OfflineEvent>>,
        offline_accept: Mutex<Option<Vec<usize>>>,
        down: AtomicBool,
    }

    impl MemoryBackend {
        fn check(&self) -> Result<(), BridgeError> {
            if self.down.load(Ordering::SeqCst) {
                Err(BridgeError::Unreachable("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl SyncBackend for MemoryBackend {
        async fn upload_changes(&self, doc_id: &str, changes: &[Vec<u8>]) -> Result<(), BridgeError> {
            self.check()?;
            let mut docs = self.docs.lock().unwrap();
            let doc = docs.entry(doc_id.to_string()).or_default();
            for change in changes {
                doc.merge(change)
                    .map_err(|e| BridgeError::InvalidResponse(e.to_string()))?;
            }
            Ok(())
        }

        async fn fetch_snapshot(&self, doc_id: &str) -> Result<Option<Vec<u8>>, BridgeError> {
            self.check()?;
            Ok(self.docs.lock().unwrap().get(doc_id).map(|d| d.snapshot()))
        }

        async fn upload_offline(&self, items: &[OfflineEvent]) -> Result<UploadReceipt, BridgeError> {
            self.check()?;
            let accepted = self.offline_accept.lock().unwrap().clone();
            let mut stored = self.offline.lock().unwrap();
            match &accepted {
                None => stored.extend_from_slice(items),
                Some(indices) => stored.extend(indices.iter().filter_map(|i| items.get(*i).cloned())),
            }
            Ok(UploadReceipt { accepted })
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        docs: Arc<DocumentStore<RecordEngine>>,
        queue: Arc<OfflineQueue>,
        bridge: SyncBridge<RecordEngine, MemoryBackend>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let docs = Arc::new(DocumentStore::new(store.clone()));
        let queue = Arc::new(OfflineQueue::new(store, 100));
        let bridge = SyncBridge::new(
            docs.clone(),
            queue.clone(),
            MemoryBackend::default(),
            BridgeConfig::for_testing(),
        );
        Fixture {
            _dir: dir,
            docs,
            queue,
            bridge,
        }
    }

    #[tokio::test]
    async fn test_push_marks_synced_only_on_success() {
        let f = fixture();
        f.docs
            .mutate("p", Durability::Await, |e| e.set_field("name", "Amina"))
            .await
            .unwrap();

        f.bridge.backend().down.store(true, Ordering::SeqCst);
        assert!(f.bridge.push("p").await.is_err());
        assert_eq!(f.docs.pending_changes("p").await.unwrap().len(), 1);

        f.bridge.backend().down.store(false, Ordering::SeqCst);
        assert_eq!(f.bridge.push("p").await.unwrap(), 1);
        assert!(f.docs.pending_changes("p").await.unwrap().is_empty());
        assert_eq!(f.bridge.push("p").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pull_merges_and_keeps_local_edits() {
        let f = fixture();
        {
            let mut server_doc = RecordEngine::new();
            server_doc.set_field("dob", "1985-07-14");
            f.bridge
                .backend()
                .docs
                .lock()
                .unwrap()
                .insert("p".into(), server_doc);
        }
        f.docs
            .mutate("p", Durability::Await, |e| e.append_note("local note"))
            .await
            .unwrap();

        assert!(f.bridge.pull("p").await.unwrap());
        assert_eq!(
            f.docs.read("p", |e| e.field("dob")).await.unwrap().as_deref(),
            Some("1985-07-14")
        );
        assert_eq!(f.docs.read("p", |e| e.notes()).await.unwrap(), "local note");
        // Same snapshot again changes nothing.
        assert!(!f.bridge.pull("p").await.unwrap());
    }

    #[tokio::test]
    async fn test_pull_missing_document_is_not_an_error() {
        let f = fixture();
        assert!(!f.bridge.pull("unknown").await.unwrap());
    }

    #[tokio::test]
    async fn test_drain_offline_in_batches() {
        let f = fixture();
        for i in 0..5 {
            f.queue.enqueue("scale", json!({"kg": 70 + i})).unwrap();
        }
        assert_eq!(f.bridge.drain_offline().await.unwrap(), 5);
        assert!(f.queue.is_empty().unwrap());
        let uploaded = f.bridge.backend().offline.lock().unwrap().clone();
        assert_eq!(uploaded.len(), 5);
        assert_eq!(uploaded[0].payload, json!({"kg": 70}));
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_queue() {
        let f = fixture();
        f.queue.enqueue("scale", json!(1)).unwrap();
        f.bridge.backend().down.store(true, Ordering::SeqCst);
        assert!(f.bridge.drain_offline().await.is_err());
        assert_eq!(f.queue.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_partial_acceptance_evicts_only_accepted() {
        let f = fixture();
        f.queue.enqueue("c", json!("a")).unwrap();
        f.queue.enqueue("c", json!("b")).unwrap();
        *f.bridge.backend().offline_accept.lock().unwrap() = Some(vec![1]);

        assert_eq!(f.bridge.drain_offline().await.unwrap(), 1);
        let left = f.queue.peek(10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].event.payload, json!("a"));
    }

    #[tokio::test]
    async fn test_sync_once_reports_failures() {
        let f = fixture();
        f.bridge.track("p").await;
        f.docs
            .mutate("p", Durability::Await, |e| e.add_visit("2026-02-02"))
            .await
            .unwrap();

        f.bridge.backend().down.store(true, Ordering::SeqCst);
        let report = f.bridge.sync_once().await;
        // Push and pull fail; the empty offline queue makes no request.
        assert_eq!(report.failures, 2);

        f.bridge.backend().down.store(false, Ordering::SeqCst);
        let report = f.bridge.sync_once().await;
        assert_eq!(report.pushed, 1);
        assert_eq!(report.failures, 0);
    }
}
