//! Deadline registry for per-peer protocol timers.
//!
//! Timers are plain deadlines keyed by `(peer, message, kind)`. Nothing here
//! sleeps: the driver asks for [`TimerRegistry::next_deadline`], sleeps until
//! then, and collects what is due with [`TimerRegistry::take_due`]. Tearing a
//! peer down drops all of its timers in one call.

use std::collections::HashMap;

use tokio::time::Instant;

use crate::protocol::{MessageId, PeerId};

/// What a timer guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    /// Resend an outgoing message the peer has not acked.
    AckWatch,
    /// Drop a reassembly buffer that stopped receiving chunks.
    ReassemblyExpiry,
}

/// A timer that has fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueTimer {
    pub peer: PeerId,
    pub message_id: MessageId,
    pub kind: TimerKind,
    pub deadline: Instant,
}

#[derive(Debug, Default)]
pub struct TimerRegistry {
    timers: HashMap<PeerId, HashMap<(MessageId, TimerKind), Instant>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) a timer. Returns the previous deadline if one existed.
    pub fn schedule(
        &mut self,
        peer: &PeerId,
        message_id: &MessageId,
        kind: TimerKind,
        deadline: Instant,
    ) -> Option<Instant> {
        self.timers
            .entry(peer.clone())
            .or_default()
            .insert((message_id.clone(), kind), deadline)
    }

    pub fn cancel(&mut self, peer: &PeerId, message_id: &MessageId, kind: TimerKind) -> bool {
        let Some(peer_timers) = self.timers.get_mut(peer) else {
            return false;
        };
        let removed = peer_timers.remove(&(message_id.clone(), kind)).is_some();
        if peer_timers.is_empty() {
            self.timers.remove(peer);
        }
        removed
    }

    /// Drop every timer of one peer. Returns how many were armed.
    pub fn cancel_peer(&mut self, peer: &PeerId) -> usize {
        self.timers.remove(peer).map_or(0, |t| t.len())
    }

    /// Drop every timer of one message, across peers.
    pub fn cancel_message(&mut self, message_id: &MessageId) {
        self.timers.retain(|_, peer_timers| {
            peer_timers.retain(|(id, _), _| id != message_id);
            !peer_timers.is_empty()
        });
    }

    pub fn deadline(&self, peer: &PeerId, message_id: &MessageId, kind: TimerKind) -> Option<Instant> {
        self.timers
            .get(peer)?
            .get(&(message_id.clone(), kind))
            .copied()
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers
            .values()
            .flat_map(|peer_timers| peer_timers.values())
            .min()
            .copied()
    }

    /// Remove and return every timer due at `now`, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<DueTimer> {
        let mut due = Vec::new();
        self.timers.retain(|peer, peer_timers| {
            peer_timers.retain(|(message_id, kind), deadline| {
                if *deadline <= now {
                    due.push(DueTimer {
                        peer: peer.clone(),
                        message_id: message_id.clone(),
                        kind: *kind,
                        deadline: *deadline,
                    });
                    false
                } else {
                    true
                }
            });
            !peer_timers.is_empty()
        });
        due.sort_by(|a, b| {
            a.deadline
                .cmp(&b.deadline)
                .then_with(|| a.peer.cmp(&b.peer))
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        due
    }

    pub fn len(&self) -> usize {
        self.timers.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}
