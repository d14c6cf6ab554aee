//! Async runner for one document room's [`TransportCore`].
//!
//! Architecture:
//! ```text
//!  WebSocket tasks ──► TransportHandle ──┐
//!                       (mpsc commands)  │
//!  DocumentStore ── LocalChange feed ────┼──► PeerTransport task ──► per-peer
//!                                        │    (single writer)         outbound
//!  next timer deadline ── sleep_until ───┘         │                  mpsc
//!                                                  ▼
//!                                         apply_change / SyncEvent
//! ```
//!
//! The task is the only owner of the core, so session state is never shared.
//! Frames to peers are sent with `try_send`: a full or closed outbound queue
//! is logged and left to the ack watch.
//!
//! A peer has at most one registered connection. Each registration gets a
//! [`ChannelId`]; closing a superseded connection is ignored, so the session
//! lives on over its replacement. When two connections to the same peer
//! overlap, both ends keep the one dialed by the smaller peer id, or the
//! newer one if the same side dialed both.

use std::collections::{HashMap, VecDeque};
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Duration, Instant};

use crate::document::{ApplyOutcome, Change, DocumentError, DocumentStore, Durability, LocalChange};
use crate::engine::MergeEngine;
use crate::protocol::{MessageId, PeerId, WireMessage};
use crate::transport::{Action, TransportConfig, TransportCore, TransportError, TransportStats};

const COMMAND_CAPACITY: usize = 1024;
const EVENT_CAPACITY: usize = 256;
/// Sleep used when no timer is armed.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Notifications for the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    PeerConnected { peer: PeerId },
    PeerDisconnected { peer: PeerId },
    /// A remote change was merged (or was already present).
    ChangeApplied {
        peer: PeerId,
        message_id: MessageId,
        outcome: ApplyOutcome,
    },
    /// A remote change could not be merged and was quarantined.
    ChangeRejected {
        peer: PeerId,
        message_id: MessageId,
        reason: String,
    },
    DeliveryFailed {
        peer: PeerId,
        message_id: MessageId,
        transmissions: u32,
    },
    Meta { peer: PeerId, action: String },
}

/// One registered connection to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

struct PeerChannel {
    id: ChannelId,
    dialer: PeerId,
    outbound: mpsc::Sender<String>,
}

enum Command {
    Open {
        peer: PeerId,
        dialer: PeerId,
        outbound: mpsc::Sender<String>,
        reply: oneshot::Sender<Result<ChannelId, TransportError>>,
    },
    Frame {
        peer: PeerId,
        text: String,
    },
    Close {
        peer: PeerId,
        channel: Option<ChannelId>,
    },
    Broadcast {
        payload: Vec<u8>,
        reply: oneshot::Sender<MessageId>,
    },
    SendTo {
        peer: PeerId,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<MessageId, TransportError>>,
    },
    RequestPull {
        peer: Option<PeerId>,
    },
    Stats {
        reply: oneshot::Sender<TransportStats>,
    },
    OpenPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running [`PeerTransport`].
#[derive(Clone)]
pub struct TransportHandle {
    doc_id: Arc<str>,
    tx: mpsc::Sender<Command>,
}

impl TransportHandle {
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Register a ready channel that `peer` initiated. Frames for the peer go
    /// to `outbound`.
    pub async fn open_channel(
        &self,
        peer: PeerId,
        outbound: mpsc::Sender<String>,
    ) -> Result<ChannelId, TransportError> {
        let dialer = peer.clone();
        self.open_connection(peer, dialer, outbound).await
    }

    /// Register a connection initiated by `dialer` (the remote peer or us).
    /// Fails with [`TransportError::DuplicateChannel`] when the peer's
    /// current connection is preferred over this one.
    pub async fn open_connection(
        &self,
        peer: PeerId,
        dialer: PeerId,
        outbound: mpsc::Sender<String>,
    ) -> Result<ChannelId, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Open {
            peer,
            dialer,
            outbound,
            reply,
        })
        .await?;
        rx.await.map_err(|_| TransportError::Stopped)?
    }

    /// Hand over one text frame received from `peer`.
    pub async fn frame(&self, peer: &PeerId, text: String) -> Result<(), TransportError> {
        self.command(Command::Frame {
            peer: peer.clone(),
            text,
        })
        .await
    }

    /// Tear the peer down, whichever connection it is on.
    pub async fn close(&self, peer: &PeerId) -> Result<(), TransportError> {
        self.command(Command::Close {
            peer: peer.clone(),
            channel: None,
        })
        .await
    }

    /// Report that one connection ended. No-op if it was already replaced.
    pub async fn close_channel(&self, peer: &PeerId, channel: ChannelId) -> Result<(), TransportError> {
        self.command(Command::Close {
            peer: peer.clone(),
            channel: Some(channel),
        })
        .await
    }

    /// Send a payload to every open peer.
    pub async fn broadcast(&self, payload: Vec<u8>) -> Result<MessageId, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Broadcast { payload, reply }).await?;
        rx.await.map_err(|_| TransportError::Stopped)
    }

    pub async fn send_to(&self, peer: &PeerId, payload: Vec<u8>) -> Result<MessageId, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::SendTo {
            peer: peer.clone(),
            payload,
            reply,
        })
        .await?;
        rx.await.map_err(|_| TransportError::Stopped)?
    }

    /// Ask `peer` (or every open peer) for its snapshot.
    pub async fn request_pull(&self, peer: Option<PeerId>) -> Result<(), TransportError> {
        self.command(Command::RequestPull { peer }).await
    }

    pub async fn stats(&self) -> Result<TransportStats, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Stats { reply }).await?;
        rx.await.map_err(|_| TransportError::Stopped)
    }

    pub async fn open_peers(&self) -> Result<Vec<PeerId>, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::OpenPeers { reply }).await?;
        rx.await.map_err(|_| TransportError::Stopped)
    }

    /// Stop the transport and wait for its task to finish.
    pub async fn shutdown(&self) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Shutdown { reply }).await?;
        rx.await.map_err(|_| TransportError::Stopped)
    }

    async fn command(&self, command: Command) -> Result<(), TransportError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| TransportError::Stopped)
    }
}

/// The task that owns a [`TransportCore`] for one document.
pub struct PeerTransport<E: MergeEngine> {
    doc_id: String,
    core: TransportCore,
    docs: Arc<DocumentStore<E>>,
    channels: HashMap<PeerId, PeerChannel>,
    next_channel: u64,
    commands: mpsc::Receiver<Command>,
    changes: broadcast::Receiver<LocalChange>,
    feed_open: bool,
    events: mpsc::Sender<SyncEvent>,
}

impl<E: MergeEngine> PeerTransport<E> {
    /// Start the transport for `doc_id`. Returns its handle and event stream.
    pub fn spawn(
        doc_id: impl Into<String>,
        config: TransportConfig,
        docs: Arc<DocumentStore<E>>,
    ) -> (TransportHandle, mpsc::Receiver<SyncEvent>) {
        let doc_id = doc_id.into();
        let (tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (events, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let changes = docs.subscribe();

        let handle = TransportHandle {
            doc_id: Arc::from(doc_id.as_str()),
            tx,
        };
        let transport = Self {
            doc_id,
            core: TransportCore::new(config),
            docs,
            channels: HashMap::new(),
            next_channel: 0,
            commands,
            changes,
            feed_open: true,
            events,
        };
        tokio::spawn(transport.run());
        (handle, events_rx)
    }

    async fn run(mut self) {
        log::info!("Transport for document {} started", self.doc_id);
        loop {
            let deadline = self.core.next_deadline();
            let wake_at = deadline.unwrap_or_else(|| Instant::now() + IDLE_WAIT);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let ControlFlow::Break(reply) = self.handle_command(command).await {
                            self.shutdown();
                            let _ = reply.send(());
                            return;
                        }
                    }
                    None => break,
                },
                change = self.changes.recv(), if self.feed_open => match change {
                    Ok(local) if local.doc_id == self.doc_id => {
                        let now = Instant::now();
                        let (_, actions) = self.core.send_message(local.change.as_bytes(), now);
                        self.perform(actions).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!("Missed {missed} local changes for {}; sending full snapshot", self.doc_id);
                        self.broadcast_snapshot().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.feed_open = false;
                    }
                },
                _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => {
                    let actions = self.core.poll_timers(Instant::now());
                    self.perform(actions).await;
                }
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        for peer in self.core.open_peers() {
            self.core.peer_closed(&peer);
        }
        self.channels.clear();
        log::info!("Transport for document {} stopped", self.doc_id);
    }

    /// Breaks with the reply channel when asked to shut down.
    async fn handle_command(&mut self, command: Command) -> ControlFlow<oneshot::Sender<()>> {
        let now = Instant::now();
        match command {
            Command::Open {
                peer,
                dialer,
                outbound,
                reply,
            } => {
                let result = self.register_channel(peer, dialer, outbound, now).await;
                let _ = reply.send(result);
            }
            Command::Frame { peer, text } => {
                let actions = self.core.handle_frame(&peer, &text, now);
                self.perform(actions).await;
            }
            Command::Close { peer, channel } => {
                let current = self.channels.get(&peer).map(|c| c.id);
                if channel.is_some() && channel != current {
                    log::debug!("Superseded connection to {peer} closed");
                    return ControlFlow::Continue(());
                }
                self.channels.remove(&peer);
                if self.core.peer_closed(&peer) {
                    self.emit(SyncEvent::PeerDisconnected { peer });
                }
            }
            Command::Broadcast { payload, reply } => {
                let (message_id, actions) = self.core.send_message(&payload, now);
                self.perform(actions).await;
                let _ = reply.send(message_id);
            }
            Command::SendTo {
                peer,
                payload,
                reply,
            } => {
                let result = match self.core.send_to(&peer, &payload, now) {
                    Ok((message_id, actions)) => {
                        self.perform(actions).await;
                        Ok(message_id)
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::RequestPull { peer } => {
                let actions = self.core.request_pull(peer.as_ref());
                self.perform(actions).await;
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.core.stats().clone());
            }
            Command::OpenPeers { reply } => {
                let _ = reply.send(self.core.open_peers());
            }
            Command::Shutdown { reply } => return ControlFlow::Break(reply),
        }
        ControlFlow::Continue(())
    }

    async fn register_channel(
        &mut self,
        peer: PeerId,
        dialer: PeerId,
        outbound: mpsc::Sender<String>,
        now: Instant,
    ) -> Result<ChannelId, TransportError> {
        let replacing = match self.channels.get(&peer) {
            Some(current) if dialer > current.dialer => {
                log::info!(
                    "Refusing second connection to {peer} dialed by {dialer}; keeping the one dialed by {}",
                    current.dialer
                );
                return Err(TransportError::DuplicateChannel(peer));
            }
            Some(_) => true,
            None => false,
        };

        self.next_channel += 1;
        let id = ChannelId(self.next_channel);
        // A replaced connection loses its sender here and winds down on its own.
        self.channels.insert(
            peer.clone(),
            PeerChannel {
                id,
                dialer,
                outbound,
            },
        );

        let actions = self.core.channel_opened(&peer, now);
        if replacing {
            log::info!("Connection to {peer} replaced");
        } else {
            self.emit(SyncEvent::PeerConnected { peer });
        }
        self.perform(actions).await;
        Ok(id)
    }

    /// Carry out core actions; follow-up actions are queued behind them.
    async fn perform(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Send { peer, message } => self.send_frame(&peer, &message),
                Action::Deliver {
                    peer,
                    message_id,
                    payload,
                } => {
                    let follow_up = self.deliver(peer, message_id, payload).await;
                    queue.extend(follow_up);
                }
                Action::DeliveryFailed {
                    peer,
                    message_id,
                    transmissions,
                } => self.emit(SyncEvent::DeliveryFailed {
                    peer,
                    message_id,
                    transmissions,
                }),
                Action::PullRequested { peer } => {
                    let follow_up = self.answer_pull(&peer).await;
                    queue.extend(follow_up);
                }
                Action::Meta { peer, action } => self.emit(SyncEvent::Meta { peer, action }),
            }
        }
    }

    /// Apply a delivered message, acking only once it is durable.
    async fn deliver(&mut self, peer: PeerId, message_id: MessageId, payload: Vec<u8>) -> Vec<Action> {
        let change = Change::new(payload);
        match self
            .docs
            .apply_change(&self.doc_id, &change, Durability::Await)
            .await
        {
            Ok(outcome) => {
                self.emit(SyncEvent::ChangeApplied {
                    peer: peer.clone(),
                    message_id: message_id.clone(),
                    outcome,
                });
                self.core.ack_delivery(&peer, message_id)
            }
            Err(DocumentError::Merge { source, .. }) => {
                // Quarantined locally; a resend would fail the same way.
                self.emit(SyncEvent::ChangeRejected {
                    peer: peer.clone(),
                    message_id: message_id.clone(),
                    reason: source.to_string(),
                });
                self.core.ack_delivery(&peer, message_id)
            }
            Err(e) => {
                log::error!("Could not persist {message_id} from {peer}, withholding ack: {e}");
                Vec::new()
            }
        }
    }

    async fn answer_pull(&mut self, peer: &PeerId) -> Vec<Action> {
        let snapshot = match self.docs.snapshot(&self.doc_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::error!("Cannot answer pull from {peer}: {e}");
                return Vec::new();
            }
        };
        match self.core.send_to(peer, &snapshot, Instant::now()) {
            Ok((message_id, actions)) => {
                log::debug!("Answering pull from {peer} with snapshot {message_id} ({} bytes)", snapshot.len());
                actions
            }
            Err(e) => {
                log::debug!("Pull from {peer} not answered: {e}");
                Vec::new()
            }
        }
    }

    async fn broadcast_snapshot(&mut self) {
        match self.docs.snapshot(&self.doc_id).await {
            Ok(snapshot) => {
                let (_, actions) = self.core.send_message(&snapshot, Instant::now());
                self.perform(actions).await;
            }
            Err(e) => log::error!("Snapshot of {} unavailable: {e}", self.doc_id),
        }
    }

    fn send_frame(&self, peer: &PeerId, message: &WireMessage) {
        let Some(PeerChannel { outbound, .. }) = self.channels.get(peer) else {
            log::debug!("No channel to {peer}; frame left to the ack watch");
            return;
        };
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to encode frame for {peer}: {e}");
                return;
            }
        };
        if let Err(e) = outbound.try_send(text) {
            log::debug!("Frame to {peer} not queued: {e}");
        }
    }

    fn emit(&self, event: SyncEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            log::debug!("Event queue full, dropped {event:?}");
        }
    }
}
