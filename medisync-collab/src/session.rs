//! Per-peer transport session.
//!
//! A session exists from the moment a peer channel starts connecting until it
//! closes. It owns the peer's reassembly buffers and the delivery state of
//! every outgoing message addressed to that peer:
//!
//! ```text
//! Created ──► Sent ──► Acked
//!              │ ▲
//!      timeout ▼ │ resend
//!            Retrying ──► Failed   (attempt limit reached)
//!
//! any ──► Closed                   (session torn down)
//! ```
//!
//! Dropping a session only discards transport state. Documents are untouched.

use std::collections::HashMap;

use tokio::time::{Duration, Instant};

use crate::chunk::{ChunkError, ReassemblyBuffer};
use crate::protocol::{Chunk, MessageId, PeerId};

/// State of the underlying channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// Delivery state of one message to this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Created,
    Sent,
    /// Resent `attempt` times so far without an ack.
    Retrying { attempt: u32 },
    Acked,
    Failed,
    Closed,
}

impl DeliveryState {
    /// Acked or failed: nothing more will happen for this peer.
    pub fn is_settled(self) -> bool {
        matches!(self, DeliveryState::Acked | DeliveryState::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub state: DeliveryState,
    /// Number of transmissions, first send included
    pub transmissions: u32,
    pub last_sent_at: Option<Instant>,
}

/// Outcome of feeding one chunk into a session.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkProgress {
    Pending { received: usize, total: u32 },
    Complete(Vec<u8>),
}

#[derive(Debug)]
pub struct PeerSession {
    peer: PeerId,
    state: ChannelState,
    incoming: HashMap<MessageId, ReassemblyBuffer>,
    deliveries: HashMap<MessageId, Delivery>,
    connected_at: Instant,
}

impl PeerSession {
    pub fn new(peer: PeerId, now: Instant) -> Self {
        Self {
            peer,
            state: ChannelState::Connecting,
            incoming: HashMap::new(),
            deliveries: HashMap::new(),
            connected_at: now,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn open(&mut self) {
        self.state = ChannelState::Open;
    }

    /// Close the channel: buffers are dropped, deliveries end as `Closed`.
    pub fn close(&mut self) {
        self.state = ChannelState::Closed;
        self.incoming.clear();
        for delivery in self.deliveries.values_mut() {
            delivery.state = DeliveryState::Closed;
        }
    }

    // ─── Incoming ─────────────────────────────────────────────────────

    /// Store a chunk. The buffer is released as soon as it completes.
    ///
    /// A chunk whose `total` disagrees with an existing buffer is rejected
    /// and leaves that buffer as it was.
    pub fn accept_chunk(&mut self, chunk: Chunk, now: Instant) -> Result<ChunkProgress, ChunkError> {
        let message_id = chunk.message_id.clone();
        let buffer = self
            .incoming
            .entry(message_id.clone())
            .or_insert_with(|| ReassemblyBuffer::new(message_id.clone(), chunk.total, now));

        if !buffer.insert(chunk, now)? {
            return Ok(ChunkProgress::Pending {
                received: buffer.received_count(),
                total: buffer.total(),
            });
        }

        match self.incoming.remove(&message_id) {
            Some(buffer) => Ok(ChunkProgress::Complete(buffer.into_bytes())),
            None => Err(ChunkError::Empty),
        }
    }

    pub fn buffer_expiry(&self, message_id: &MessageId, inactivity: Duration) -> Option<Instant> {
        self.incoming.get(message_id).map(|b| b.expires_at(inactivity))
    }

    /// Drop a stale buffer. Returns `false` if it was already gone.
    pub fn expire_buffer(&mut self, message_id: &MessageId) -> bool {
        self.incoming.remove(message_id).is_some()
    }

    pub fn incoming_len(&self) -> usize {
        self.incoming.len()
    }

    // ─── Outgoing ─────────────────────────────────────────────────────

    pub fn begin_delivery(&mut self, message_id: &MessageId) {
        self.deliveries.insert(
            message_id.clone(),
            Delivery {
                state: DeliveryState::Created,
                transmissions: 0,
                last_sent_at: None,
            },
        );
    }

    /// Record a transmission. The first one moves `Created → Sent`, later
    /// ones move to `Retrying`. Returns the transmission count.
    pub fn record_transmission(&mut self, message_id: &MessageId, now: Instant) -> u32 {
        let Some(delivery) = self.deliveries.get_mut(message_id) else {
            return 0;
        };
        delivery.transmissions += 1;
        delivery.last_sent_at = Some(now);
        delivery.state = if delivery.transmissions == 1 {
            DeliveryState::Sent
        } else {
            DeliveryState::Retrying {
                attempt: delivery.transmissions - 1,
            }
        };
        delivery.transmissions
    }

    /// Mark a delivery acked. Returns `true` only on the first ack.
    pub fn mark_acked(&mut self, message_id: &MessageId) -> bool {
        match self.deliveries.get_mut(message_id) {
            Some(delivery) if delivery.state != DeliveryState::Acked => {
                delivery.state = DeliveryState::Acked;
                true
            }
            _ => false,
        }
    }

    pub fn mark_failed(&mut self, message_id: &MessageId) {
        if let Some(delivery) = self.deliveries.get_mut(message_id) {
            delivery.state = DeliveryState::Failed;
        }
    }

    pub fn delivery(&self, message_id: &MessageId) -> Option<&Delivery> {
        self.deliveries.get(message_id)
    }

    pub fn forget_delivery(&mut self, message_id: &MessageId) {
        self.deliveries.remove(message_id);
    }

    pub fn deliveries_len(&self) -> usize {
        self.deliveries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::segment;

    #[test]
    fn test_channel_lifecycle() {
        let mut session = PeerSession::new(PeerId::from("p"), Instant::now());
        assert_eq!(session.state(), ChannelState::Connecting);
        assert!(!session.is_open());
        session.open();
        assert!(session.is_open());
        session.close();
        assert_eq!(session.state(), ChannelState::Closed);
    }

    #[test]
    fn test_chunks_complete_and_release_buffer() {
        let now = Instant::now();
        let mut session = PeerSession::new(PeerId::from("p"), now);
        let id = MessageId::from("m");
        let chunks = segment(&id, b"abcdefghij", 4);

        assert_eq!(
            session.accept_chunk(chunks[2].clone(), now).unwrap(),
            ChunkProgress::Pending {
                received: 1,
                total: 3
            }
        );
        session.accept_chunk(chunks[0].clone(), now).unwrap();
        assert_eq!(session.incoming_len(), 1);
        assert_eq!(
            session.accept_chunk(chunks[1].clone(), now).unwrap(),
            ChunkProgress::Complete(b"abcdefghij".to_vec())
        );
        assert_eq!(session.incoming_len(), 0);
    }

    #[test]
    fn test_mismatched_total_dropped() {
        let now = Instant::now();
        let mut session = PeerSession::new(PeerId::from("p"), now);
        let id = MessageId::from("m");
        let chunks = segment(&id, b"abcdefghij", 4);
        session.accept_chunk(chunks[0].clone(), now).unwrap();

        let mut stray = chunks[1].clone();
        stray.total = 5;
        assert!(session.accept_chunk(stray, now).is_err());
        assert_eq!(
            session.accept_chunk(chunks[1].clone(), now).unwrap(),
            ChunkProgress::Pending {
                received: 2,
                total: 3
            }
        );
    }

    #[test]
    fn test_buffer_expiry() {
        let now = Instant::now();
        let mut session = PeerSession::new(PeerId::from("p"), now);
        let id = MessageId::from("m");
        let chunks = segment(&id, b"abcdefghij", 4);
        session.accept_chunk(chunks[0].clone(), now).unwrap();

        let timeout = Duration::from_secs(60);
        assert_eq!(session.buffer_expiry(&id, timeout), Some(now + timeout));
        assert!(session.expire_buffer(&id));
        assert!(!session.expire_buffer(&id));
        assert_eq!(session.buffer_expiry(&id, timeout), None);
    }

    #[test]
    fn test_delivery_state_machine() {
        let now = Instant::now();
        let mut session = PeerSession::new(PeerId::from("p"), now);
        let id = MessageId::from("m");

        session.begin_delivery(&id);
        assert_eq!(session.delivery(&id).unwrap().state, DeliveryState::Created);

        assert_eq!(session.record_transmission(&id, now), 1);
        assert_eq!(session.delivery(&id).unwrap().state, DeliveryState::Sent);

        assert_eq!(session.record_transmission(&id, now), 2);
        assert_eq!(
            session.delivery(&id).unwrap().state,
            DeliveryState::Retrying { attempt: 1 }
        );

        assert!(session.mark_acked(&id));
        assert!(!session.mark_acked(&id));
        assert!(session.delivery(&id).unwrap().state.is_settled());

        assert!(!session.mark_acked(&MessageId::from("unknown")));
    }

    #[test]
    fn test_close_marks_deliveries_closed() {
        let now = Instant::now();
        let mut session = PeerSession::new(PeerId::from("p"), now);
        let id = MessageId::from("m");
        session.begin_delivery(&id);
        session.record_transmission(&id, now);
        session.close();
        assert_eq!(session.delivery(&id).unwrap().state, DeliveryState::Closed);
    }
}
