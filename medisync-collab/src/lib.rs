//! # medisync-collab: offline-first sync for shared clinical records
//!
//! Devices edit patient records while disconnected and converge once a peer
//! or the backend is reachable again. State merging is delegated to a CRDT
//! engine; this crate moves, acknowledges and persists its changes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  ws text frames   ┌──────────────┐
//! │ PeerTransport│ ◄───────────────► │ PeerTransport│   chunk / ack / meta
//! │ (per doc)    │   chunked + acked │ (remote)     │
//! └──────┬───────┘                   └──────────────┘
//!        │ apply_change / LocalChange feed
//!        ▼
//! ┌──────────────┐   push / pull     ┌──────────────┐
//! │DocumentStore │ ◄───────────────► │ SyncBridge   │ ──► HTTP backend
//! │ (yrs engine) │                   │              │
//! └──────┬───────┘                   └──────┬───────┘
//!        │ snapshots, unsynced changes      │ offline events
//!        ▼                                  ▼
//! ┌─────────────────────────────────────────────────┐
//! │ LocalStore (RocksDB column families)            │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages and identifiers
//! - [`chunk`]: segmentation and reassembly
//! - [`engine`]: merge-engine contract and the yrs record engine
//! - [`storage`]: RocksDB persistence
//! - [`document`]: local document store
//! - [`scheduler`], [`session`], [`transport`]: ack/retry state machine
//! - [`driver`]: tokio task running the state machine
//! - [`channel`]: WebSocket peer channels
//! - [`offline`]: durable offline event queue
//! - [`bridge`], [`http`]: server synchronization
//! - [`config`]: layered node configuration

pub mod protocol;
pub mod chunk;
pub mod engine;
pub mod storage;
pub mod document;
pub mod scheduler;
pub mod session;
pub mod transport;
pub mod driver;
pub mod channel;
pub mod offline;
pub mod bridge;
pub mod http;
pub mod config;

// Re-exports for convenience
pub use protocol::{Chunk, MessageId, PeerId, ProtocolError, WireMessage};
pub use chunk::{reassemble, segment, ChunkError, ReassemblyBuffer, DEFAULT_CHUNK_SIZE};
pub use engine::{EngineError, MergeEngine, RecordEngine};
pub use storage::{DocumentMetadata, LocalStore, StoreConfig, StoreError};
pub use document::{ApplyOutcome, Change, DocumentError, DocumentStore, Durability, LocalChange};
pub use transport::{RetryPolicy, TransportConfig, TransportCore, TransportError, TransportStats};
pub use driver::{ChannelId, PeerTransport, SyncEvent, TransportHandle};
pub use offline::{OfflineEvent, OfflineQueue, QueueError, QueuedEvent};
pub use bridge::{BridgeConfig, BridgeError, SyncBackend, SyncBridge, SyncReport, UploadReceipt};
pub use http::{HttpBackend, HttpConfig};
pub use config::{ConfigError, SyncConfig};
