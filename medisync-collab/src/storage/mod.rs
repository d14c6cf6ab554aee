//! Durable local state of one device.
//!
//! Architecture:
//! ```text
//! ┌───────────────┐  snapshot + change  ┌──────────────────────────────────┐
//! │ DocumentStore │ ──────────────────► │ LocalStore (RocksDB)             │
//! │ (persister)   │    one WriteBatch   │                                  │
//! └───────────────┘                     │ CF "snapshots": LZ4 snapshots    │
//! ┌───────────────┐   JSON events       │ CF "pending"  : unsynced edits   │
//! │ OfflineQueue  │ ──────────────────► │ CF "offline"  : event FIFO       │
//! └───────────────┘                     │ CF "metadata" : doc metadata     │
//!                                       └──────────────────────────────────┘
//! ```
//!
//! A snapshot is replaced only together with whatever else the same mutation
//! touched, so a crash mid-write leaves either the old state or the new one.

pub mod rocks;

pub use rocks::{DocumentMetadata, LocalStore, StoreConfig, StoreError};
