//! Chunk segmenter: split a payload into bounded fragments and put it back
//! together on the receiving side.
//!
//! A zero-length payload still yields exactly one (empty) chunk with
//! `total = 1`, so the receiver has something concrete to reassemble and ack.

use std::collections::BTreeMap;

use tokio::time::{Duration, Instant};

use crate::protocol::{Chunk, MessageId};

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024; // 16 KiB

/// Split `bytes` into chunks of at most `chunk_size` bytes.
///
/// `chunk_size == 0` falls back to [`DEFAULT_CHUNK_SIZE`].
pub fn segment(message_id: &MessageId, bytes: &[u8], chunk_size: usize) -> Vec<Chunk> {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };

    if bytes.is_empty() {
        return vec![Chunk {
            message_id: message_id.clone(),
            index: 0,
            total: 1,
            payload: Vec::new(),
        }];
    }

    let total = bytes.len().div_ceil(size) as u32;
    bytes
        .chunks(size)
        .enumerate()
        .map(|(i, part)| Chunk {
            message_id: message_id.clone(),
            index: i as u32,
            total,
            payload: part.to_vec(),
        })
        .collect()
}

/// Reassemble a complete chunk set in index order.
///
/// Arrival order does not matter and duplicate indices overwrite each other;
/// the set must however cover exactly `0..total` of one message.
pub fn reassemble(chunks: &[Chunk]) -> Result<Vec<u8>, ChunkError> {
    let first = chunks.first().ok_or(ChunkError::Empty)?;
    let message_id = &first.message_id;
    let total = first.total;

    let mut parts: BTreeMap<u32, &[u8]> = BTreeMap::new();
    for chunk in chunks {
        if &chunk.message_id != message_id {
            return Err(ChunkError::MixedMessages);
        }
        if chunk.total != total {
            return Err(ChunkError::TotalMismatch {
                expected: total,
                got: chunk.total,
            });
        }
        if chunk.index >= total {
            return Err(ChunkError::IndexOutOfRange {
                index: chunk.index,
                total,
            });
        }
        parts.insert(chunk.index, &chunk.payload);
    }

    if parts.len() != total as usize {
        return Err(ChunkError::Incomplete {
            received: parts.len() as u32,
            total,
        });
    }

    let len = parts.values().map(|p| p.len()).sum();
    let mut out = Vec::with_capacity(len);
    for part in parts.values() {
        out.extend_from_slice(part);
    }
    Ok(out)
}

/// Receiver-side accumulator for one in-flight message.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    message_id: MessageId,
    total: u32,
    received: BTreeMap<u32, Vec<u8>>,
    last_activity: Instant,
}

impl ReassemblyBuffer {
    pub fn new(message_id: MessageId, total: u32, now: Instant) -> Self {
        Self {
            message_id,
            total,
            received: BTreeMap::new(),
            last_activity: now,
        }
    }

    /// Store a chunk (overwriting any earlier copy of the same index) and
    /// refresh the inactivity clock. Returns `true` once the set is complete.
    pub fn insert(&mut self, chunk: Chunk, now: Instant) -> Result<bool, ChunkError> {
        if chunk.message_id != self.message_id {
            return Err(ChunkError::MixedMessages);
        }
        if chunk.total != self.total {
            return Err(ChunkError::TotalMismatch {
                expected: self.total,
                got: chunk.total,
            });
        }
        if chunk.index >= self.total {
            return Err(ChunkError::IndexOutOfRange {
                index: chunk.index,
                total: self.total,
            });
        }
        self.received.insert(chunk.index, chunk.payload);
        self.last_activity = now;
        Ok(self.is_complete())
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() == self.total as usize
    }

    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Instant after which the buffer is considered stale.
    pub fn expires_at(&self, inactivity: Duration) -> Instant {
        self.last_activity + inactivity
    }

    /// Concatenate the payload. Call only when `is_complete()`.
    pub fn into_bytes(self) -> Vec<u8> {
        let len = self.received.values().map(Vec::len).sum();
        let mut out = Vec::with_capacity(len);
        for part in self.received.into_values() {
            out.extend_from_slice(&part);
        }
        out
    }
}

/// Chunk reassembly errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("no chunks to reassemble")]
    Empty,
    #[error("chunks belong to different messages")]
    MixedMessages,
    #[error("chunk total mismatch: expected {expected}, got {got}")]
    TotalMismatch { expected: u32, got: u32 },
    #[error("chunk index {index} out of range for total {total}")]
    IndexOutOfRange { index: u32, total: u32 },
    #[error("incomplete message: {received}/{total} chunks")]
    Incomplete { received: u32, total: u32 },
}
