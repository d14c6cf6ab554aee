//! Acknowledged, chunked message transport over many peer sessions.
//!
//! [`TransportCore`] is a plain state machine: every input carries the
//! current instant and every output is a list of [`Action`]s for the caller
//! to perform (write a frame, hand a payload to the document store, report a
//! failure). It never sleeps, spawns or does I/O, which keeps timing
//! behaviour testable step by step. [`crate::driver`] runs it on tokio.
//!
//! Delivery flow for one message:
//! ```text
//! sender                                      receiver
//! send_message ── chunk 0..N-1 ─────────────► chunk_received (buffer)
//!   │ ack watch armed                           │ complete
//!   │                                           ▼
//!   │ (timeout: resend all chunks)            Deliver ─► apply_change
//!   │                                           │ durable
//! ack_received ◄──────────────────── ack ───── ack_delivery
//!   │ covered by every connected recipient
//!   ▼
//! outgoing entry purged
//! ```

use std::collections::{BTreeSet, HashMap};

use tokio::time::{Duration, Instant};

use crate::chunk::{segment, DEFAULT_CHUNK_SIZE};
use crate::protocol::{Chunk, MessageId, PeerId, WireMessage, PULL_ACTION};
use crate::scheduler::{TimerKind, TimerRegistry};
use crate::session::{ChannelState, ChunkProgress, DeliveryState, PeerSession};

/// Default time to wait for an ack before resending.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(15);
/// Default inactivity after which a partial incoming message is dropped.
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(60);

/// Resend schedule for unacked messages.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Multiplier applied to the wait after each resend (1.0 = fixed interval)
    pub backoff_factor: f64,
    /// Upper bound on the wait between resends
    pub max_interval: Duration,
    /// Resends allowed before the delivery fails (None = unbounded)
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_factor: 1.0,
            max_interval: Duration::from_secs(300),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Wait before the next resend, given how many transmissions happened.
    pub fn delay(&self, base: Duration, transmissions: u32) -> Duration {
        let exponent = transmissions.saturating_sub(1).min(32) as i32;
        let factor = self.backoff_factor.max(1.0).powi(exponent);
        let scaled = base.as_secs_f64() * factor;
        if scaled >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum payload bytes per chunk
    pub chunk_size: usize,
    /// Wait for an ack before resending
    pub ack_timeout: Duration,
    /// Inactivity before a partial incoming message is dropped
    pub reassembly_timeout: Duration,
    pub retry: RetryPolicy,
    /// Ask every newly opened peer for its snapshot
    pub pull_on_connect: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            retry: RetryPolicy::default(),
            pull_on_connect: false,
        }
    }
}

impl TransportConfig {
    /// Small chunks and short timeouts for tests.
    pub fn for_testing() -> Self {
        Self {
            chunk_size: 64,
            ack_timeout: Duration::from_secs(1),
            reassembly_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            pull_on_connect: false,
        }
    }
}

/// Work the caller must perform on behalf of the core.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Write a frame to a peer channel.
    Send { peer: PeerId, message: WireMessage },
    /// A complete message arrived; apply it, then call `ack_delivery`.
    Deliver {
        peer: PeerId,
        message_id: MessageId,
        payload: Vec<u8>,
    },
    /// Retries to a peer were exhausted.
    DeliveryFailed {
        peer: PeerId,
        message_id: MessageId,
        transmissions: u32,
    },
    /// The peer asked for our full snapshot.
    PullRequested { peer: PeerId },
    /// A meta action this transport does not handle itself.
    Meta { peer: PeerId, action: String },
}

/// Transport statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub chunks_sent: u64,
    pub retransmissions: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub delivered: u64,
    pub expired_buffers: u64,
    pub failed_deliveries: u64,
    pub dropped_frames: u64,
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("channel to peer {0} is not open")]
    ChannelNotOpen(PeerId),
    #[error("peer {0} already has a preferred connection")]
    DuplicateChannel(PeerId),
    #[error("transport stopped")]
    Stopped,
}

#[derive(Debug)]
struct OutgoingEntry {
    chunks: Vec<Chunk>,
    recipients: BTreeSet<PeerId>,
    acked_by: BTreeSet<PeerId>,
    failed: BTreeSet<PeerId>,
    first_sent_at: Instant,
}

/// The transport state machine for one document room.
pub struct TransportCore {
    config: TransportConfig,
    sessions: HashMap<PeerId, PeerSession>,
    outgoing: HashMap<MessageId, OutgoingEntry>,
    timers: TimerRegistry,
    stats: TransportStats,
}

impl TransportCore {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
            outgoing: HashMap::new(),
            timers: TimerRegistry::new(),
            stats: TransportStats::default(),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    // ─── Session lifecycle ────────────────────────────────────────────

    /// A peer channel started connecting.
    pub fn peer_joined(&mut self, peer: &PeerId, now: Instant) {
        let replace = self
            .sessions
            .get(peer)
            .map_or(true, |s| s.state() == ChannelState::Closed);
        if replace {
            self.sessions
                .insert(peer.clone(), PeerSession::new(peer.clone(), now));
        }
    }

    /// A peer channel is ready for frames.
    pub fn channel_opened(&mut self, peer: &PeerId, now: Instant) -> Vec<Action> {
        self.peer_joined(peer, now);
        if let Some(session) = self.sessions.get_mut(peer) {
            session.open();
        }
        log::info!("Peer {peer} connected");

        if self.config.pull_on_connect {
            vec![Action::Send {
                peer: peer.clone(),
                message: WireMessage::pull(),
            }]
        } else {
            Vec::new()
        }
    }

    /// Tear a peer down: timers cancelled in one step, session discarded,
    /// outgoing coverage re-evaluated without it.
    pub fn peer_closed(&mut self, peer: &PeerId) -> bool {
        let Some(mut session) = self.sessions.remove(peer) else {
            return false;
        };
        session.close();
        let cancelled = self.timers.cancel_peer(peer);

        let ids: Vec<MessageId> = self.outgoing.keys().cloned().collect();
        for id in ids {
            if let Some(entry) = self.outgoing.get_mut(&id) {
                entry.recipients.remove(peer);
            }
            self.collect_if_covered(&id);
        }

        log::info!("Peer {peer} disconnected ({cancelled} timers cancelled)");
        true
    }

    // ─── Sending ──────────────────────────────────────────────────────

    /// Send a payload to every open peer.
    pub fn send_message(&mut self, payload: &[u8], now: Instant) -> (MessageId, Vec<Action>) {
        let recipients: BTreeSet<PeerId> = self
            .sessions
            .values()
            .filter(|s| s.is_open())
            .map(|s| s.peer().clone())
            .collect();
        self.send_to_set(payload, recipients, now)
    }

    /// Send a payload to one peer (e.g. a snapshot answering a pull).
    pub fn send_to(
        &mut self,
        peer: &PeerId,
        payload: &[u8],
        now: Instant,
    ) -> Result<(MessageId, Vec<Action>), TransportError> {
        if !self.sessions.get(peer).is_some_and(PeerSession::is_open) {
            return Err(TransportError::ChannelNotOpen(peer.clone()));
        }
        Ok(self.send_to_set(payload, BTreeSet::from([peer.clone()]), now))
    }

    fn send_to_set(
        &mut self,
        payload: &[u8],
        recipients: BTreeSet<PeerId>,
        now: Instant,
    ) -> (MessageId, Vec<Action>) {
        let message_id = MessageId::generate();
        if recipients.is_empty() {
            log::debug!("No open peers for message {message_id}");
            return (message_id, Vec::new());
        }

        let chunks = segment(&message_id, payload, self.config.chunk_size);
        self.stats.messages_sent += 1;

        let mut actions = Vec::with_capacity(chunks.len() * recipients.len());
        for peer in &recipients {
            if let Some(session) = self.sessions.get_mut(peer) {
                session.begin_delivery(&message_id);
            }
            self.transmit(peer, &message_id, &chunks, now, &mut actions);
        }

        log::debug!(
            "Sent message {message_id} ({} bytes, {} chunks) to {} peers",
            payload.len(),
            chunks.len(),
            recipients.len()
        );

        self.outgoing.insert(
            message_id.clone(),
            OutgoingEntry {
                chunks,
                recipients,
                acked_by: BTreeSet::new(),
                failed: BTreeSet::new(),
                first_sent_at: now,
            },
        );
        (message_id, actions)
    }

    /// Emit every chunk to one peer and re-arm its ack watch.
    fn transmit(
        &mut self,
        peer: &PeerId,
        message_id: &MessageId,
        chunks: &[Chunk],
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        for chunk in chunks {
            actions.push(Action::Send {
                peer: peer.clone(),
                message: WireMessage::Chunk(chunk.clone()),
            });
        }
        self.stats.chunks_sent += chunks.len() as u64;

        let transmissions = session.record_transmission(message_id, now);
        let wait = self
            .config
            .retry
            .delay(self.config.ack_timeout, transmissions);
        self.timers
            .schedule(peer, message_id, TimerKind::AckWatch, now + wait);
    }

    /// Ask one peer, or every open peer, for its full snapshot.
    pub fn request_pull(&mut self, peer: Option<&PeerId>) -> Vec<Action> {
        self.sessions
            .values()
            .filter(|s| s.is_open() && peer.map_or(true, |p| p == s.peer()))
            .map(|s| Action::Send {
                peer: s.peer().clone(),
                message: WireMessage::pull(),
            })
            .collect()
    }

    // ─── Receiving ────────────────────────────────────────────────────

    /// Decode and dispatch one text frame. Malformed frames are dropped.
    pub fn handle_frame(&mut self, peer: &PeerId, text: &str, now: Instant) -> Vec<Action> {
        match WireMessage::decode(text) {
            Ok(WireMessage::Chunk(chunk)) => self.chunk_received(peer, chunk, now),
            Ok(WireMessage::Ack { message_id }) => {
                self.ack_received(peer, &message_id);
                Vec::new()
            }
            Ok(WireMessage::Meta { action }) => self.meta_received(peer, action),
            Err(e) => {
                self.stats.dropped_frames += 1;
                log::warn!("Dropping malformed frame from {peer}: {e}");
                Vec::new()
            }
        }
    }

    pub fn chunk_received(&mut self, peer: &PeerId, chunk: Chunk, now: Instant) -> Vec<Action> {
        if let Err(e) = chunk.validate() {
            self.stats.dropped_frames += 1;
            log::warn!("Dropping invalid chunk from {peer}: {e}");
            return Vec::new();
        }
        let Some(session) = self
            .sessions
            .get_mut(peer)
            .filter(|s| s.state() != ChannelState::Closed)
        else {
            self.stats.dropped_frames += 1;
            log::debug!("Chunk from unknown peer {peer} dropped");
            return Vec::new();
        };

        let message_id = chunk.message_id.clone();
        match session.accept_chunk(chunk, now) {
            Ok(ChunkProgress::Pending { .. }) => {
                let deadline = now + self.config.reassembly_timeout;
                self.timers
                    .schedule(peer, &message_id, TimerKind::ReassemblyExpiry, deadline);
                Vec::new()
            }
            Ok(ChunkProgress::Complete(payload)) => {
                self.timers
                    .cancel(peer, &message_id, TimerKind::ReassemblyExpiry);
                self.stats.delivered += 1;
                vec![Action::Deliver {
                    peer: peer.clone(),
                    message_id,
                    payload,
                }]
            }
            Err(e) => {
                self.stats.dropped_frames += 1;
                log::debug!("Chunk for {message_id} from {peer} dropped: {e}");
                Vec::new()
            }
        }
    }

    /// A delivered message has been applied durably; ack it to its sender.
    pub fn ack_delivery(&mut self, peer: &PeerId, message_id: MessageId) -> Vec<Action> {
        if !self.sessions.get(peer).is_some_and(PeerSession::is_open) {
            log::debug!("Peer {peer} gone before ack of {message_id}");
            return Vec::new();
        }
        self.stats.acks_sent += 1;
        vec![Action::Send {
            peer: peer.clone(),
            message: WireMessage::ack(message_id),
        }]
    }

    /// Record a peer's ack. Unknown message ids are ignored.
    pub fn ack_received(&mut self, peer: &PeerId, message_id: &MessageId) {
        let Some(entry) = self.outgoing.get_mut(message_id) else {
            log::debug!("Ack from {peer} for unknown message {message_id} ignored");
            return;
        };
        if !entry.recipients.contains(peer) {
            log::debug!("Ack from {peer} for {message_id} ignored, not a recipient");
            return;
        }
        if !entry.acked_by.insert(peer.clone()) {
            return;
        }
        self.stats.acks_received += 1;
        let elapsed = entry.first_sent_at.elapsed();
        log::debug!("Message {message_id} acked by {peer} after {elapsed:?}");

        if let Some(session) = self.sessions.get_mut(peer) {
            session.mark_acked(message_id);
        }
        self.timers.cancel(peer, message_id, TimerKind::AckWatch);
        self.collect_if_covered(message_id);
    }

    pub fn meta_received(&mut self, peer: &PeerId, action: String) -> Vec<Action> {
        if action == PULL_ACTION {
            log::debug!("Peer {peer} requested a pull");
            vec![Action::PullRequested { peer: peer.clone() }]
        } else {
            vec![Action::Meta {
                peer: peer.clone(),
                action,
            }]
        }
    }

    // ─── Timers ───────────────────────────────────────────────────────

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Fire every timer due at `now`.
    pub fn poll_timers(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        for due in self.timers.take_due(now) {
            match due.kind {
                TimerKind::AckWatch => {
                    self.ack_timeout(&due.peer, &due.message_id, now, &mut actions)
                }
                TimerKind::ReassemblyExpiry => {
                    self.reassembly_timeout(&due.peer, &due.message_id, now)
                }
            }
        }
        actions
    }

    fn ack_timeout(
        &mut self,
        peer: &PeerId,
        message_id: &MessageId,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let Some(entry) = self.outgoing.get(message_id) else {
            return;
        };
        if entry.acked_by.contains(peer) || entry.failed.contains(peer) {
            return;
        }
        let Some(session) = self.sessions.get_mut(peer).filter(|s| s.is_open()) else {
            return;
        };
        let transmissions = session.delivery(message_id).map_or(0, |d| d.transmissions);
        let resends = transmissions.saturating_sub(1);

        if self
            .config
            .retry
            .max_attempts
            .is_some_and(|max| resends >= max)
        {
            session.mark_failed(message_id);
            self.stats.failed_deliveries += 1;
            log::warn!("Delivery of {message_id} to {peer} failed after {transmissions} transmissions");
            if let Some(entry) = self.outgoing.get_mut(message_id) {
                entry.failed.insert(peer.clone());
            }
            actions.push(Action::DeliveryFailed {
                peer: peer.clone(),
                message_id: message_id.clone(),
                transmissions,
            });
            self.collect_if_covered(message_id);
            return;
        }

        let chunks = entry.chunks.clone();
        self.stats.retransmissions += 1;
        log::debug!(
            "No ack from {peer} for {message_id}; resending {} chunks (attempt {})",
            chunks.len(),
            resends + 1
        );
        self.transmit(peer, message_id, &chunks, now, actions);
    }

    fn reassembly_timeout(&mut self, peer: &PeerId, message_id: &MessageId, now: Instant) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        match session.buffer_expiry(message_id, self.config.reassembly_timeout) {
            Some(expiry) if expiry > now => {
                self.timers
                    .schedule(peer, message_id, TimerKind::ReassemblyExpiry, expiry);
            }
            Some(_) => {
                session.expire_buffer(message_id);
                self.stats.expired_buffers += 1;
                log::debug!("Dropped stale partial message {message_id} from {peer}");
            }
            None => {}
        }
    }

    // ─── Outgoing GC ──────────────────────────────────────────────────

    /// Purge an outgoing entry once every connected recipient is settled.
    fn collect_if_covered(&mut self, message_id: &MessageId) {
        let Some(entry) = self.outgoing.get(message_id) else {
            return;
        };
        let covered = entry.recipients.iter().all(|peer| {
            entry.acked_by.contains(peer)
                || entry.failed.contains(peer)
                || !self.sessions.get(peer).is_some_and(PeerSession::is_open)
        });
        if !covered {
            return;
        }

        self.outgoing.remove(message_id);
        self.timers.cancel_message(message_id);
        for session in self.sessions.values_mut() {
            session.forget_delivery(message_id);
        }
        log::debug!("Message {message_id} settled, outgoing entry purged");
    }

    // ─── Queries ──────────────────────────────────────────────────────

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    pub fn open_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .sessions
            .values()
            .filter(|s| s.is_open())
            .map(|s| s.peer().clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn session(&self, peer: &PeerId) -> Option<&PeerSession> {
        self.sessions.get(peer)
    }

    pub fn delivery_state(&self, peer: &PeerId, message_id: &MessageId) -> Option<DeliveryState> {
        self.sessions
            .get(peer)?
            .delivery(message_id)
            .map(|d| d.state)
    }

    pub fn is_outgoing(&self, message_id: &MessageId) -> bool {
        self.outgoing.contains_key(message_id)
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }
}
