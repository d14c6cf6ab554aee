//! Durable FIFO of events captured while the backend is unreachable.
//!
//! Events are appended to the `offline` column family under a big-endian
//! sequence key, so iteration order is arrival order. An event leaves the
//! queue only through [`OfflineQueue::confirm`], which the bridge calls after
//! the backend has accepted it.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::storage::{LocalStore, StoreError};

/// Default maximum number of queued events.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// One event produced by a device connector (vitals monitor, lab reader, …).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineEvent {
    pub connector_id: String,
    pub payload: serde_json::Value,
}

impl OfflineEvent {
    pub fn new(connector_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            connector_id: connector_id.into(),
            payload,
        }
    }
}

/// A stored event together with its queue position.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    pub seq: u64,
    pub event: OfflineEvent,
    /// Unix millis at enqueue time
    pub queued_at: u64,
}

#[derive(Serialize, Deserialize)]
struct StoredEvent {
    event: OfflineEvent,
    queued_at: u64,
}

/// Offline queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("offline queue full ({capacity} events)")]
    QueueFull { capacity: usize },
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("event encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Persistent offline event queue.
pub struct OfflineQueue {
    store: Arc<LocalStore>,
    capacity: usize,
}

impl OfflineQueue {
    pub fn new(store: Arc<LocalStore>, capacity: usize) -> Self {
        Self { store, capacity }
    }

    pub fn with_default_capacity(store: Arc<LocalStore>) -> Self {
        Self::new(store, DEFAULT_CAPACITY)
    }

    /// Append an event. The write is durable when this returns.
    pub fn enqueue(
        &self,
        connector_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<u64, QueueError> {
        if self.store.offline_len()? >= self.capacity {
            return Err(QueueError::QueueFull {
                capacity: self.capacity,
            });
        }

        let stored = StoredEvent {
            event: OfflineEvent::new(connector_id, payload),
            queued_at: unix_millis(),
        };
        let bytes = serde_json::to_vec(&stored)?;
        let seq = self.store.offline_append(&bytes)?;
        log::debug!(
            "Queued offline event {seq} from connector {}",
            stored.event.connector_id
        );
        Ok(seq)
    }

    /// Up to `limit` events from the head, oldest first. Nothing is removed.
    pub fn peek(&self, limit: usize) -> Result<Vec<QueuedEvent>, QueueError> {
        let mut out = Vec::new();
        for (seq, bytes) in self.store.offline_read(limit)? {
            match serde_json::from_slice::<StoredEvent>(&bytes) {
                Ok(stored) => out.push(QueuedEvent {
                    seq,
                    event: stored.event,
                    queued_at: stored.queued_at,
                }),
                Err(e) => {
                    // Unreadable entries would block the head forever.
                    log::error!("Dropping corrupt offline event {seq}: {e}");
                    self.store.offline_remove(&[seq])?;
                }
            }
        }
        Ok(out)
    }

    /// Remove events the backend has confirmed.
    pub fn confirm(&self, seqs: &[u64]) -> Result<(), QueueError> {
        self.store.offline_remove(seqs)?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize, QueueError> {
        Ok(self.store.offline_len()?)
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;
    use serde_json::json;

    fn open_queue(capacity: usize) -> (tempfile::TempDir, OfflineQueue) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, OfflineQueue::new(Arc::new(store), capacity))
    }

    #[test]
    fn test_enqueue_peek_preserves_order() {
        let (_dir, queue) = open_queue(100);
        queue.enqueue("bp-cuff", json!({"systolic": 120})).unwrap();
        queue.enqueue("oximeter", json!({"spo2": 97})).unwrap();
        queue.enqueue("bp-cuff", json!({"systolic": 135})).unwrap();

        let head = queue.peek(10).unwrap();
        assert_eq!(head.len(), 3);
        assert_eq!(head[0].event.payload, json!({"systolic": 120}));
        assert_eq!(head[1].event.connector_id, "oximeter");
        assert!(head[0].seq < head[1].seq && head[1].seq < head[2].seq);
        // Peek is non-destructive.
        assert_eq!(queue.len().unwrap(), 3);
    }

    #[test]
    fn test_confirm_removes_only_given() {
        let (_dir, queue) = open_queue(100);
        let a = queue.enqueue("c", json!(1)).unwrap();
        let _b = queue.enqueue("c", json!(2)).unwrap();
        let c = queue.enqueue("c", json!(3)).unwrap();

        queue.confirm(&[a, c]).unwrap();
        let rest = queue.peek(10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].event.payload, json!(2));
    }

    #[test]
    fn test_capacity_enforced() {
        let (_dir, queue) = open_queue(2);
        queue.enqueue("c", json!(1)).unwrap();
        queue.enqueue("c", json!(2)).unwrap();
        assert!(matches!(
            queue.enqueue("c", json!(3)),
            Err(QueueError::QueueFull { capacity: 2 })
        ));

        let head = queue.peek(1).unwrap();
        queue.confirm(&[head[0].seq]).unwrap();
        assert!(queue.enqueue("c", json!(3)).is_ok());
    }

    #[test]
    fn test_event_wire_shape() {
        let event = OfflineEvent::new("glucometer", json!({"mmol": 5.4}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"connectorId": "glucometer", "payload": {"mmol": 5.4}})
        );
    }

    #[test]
    fn test_empty_queue() {
        let (_dir, queue) = open_queue(10);
        assert!(queue.is_empty().unwrap());
        assert!(queue.peek(5).unwrap().is_empty());
        queue.confirm(&[]).unwrap();
    }
}
