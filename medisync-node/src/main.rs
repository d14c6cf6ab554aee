//! medisync node: device daemon.
//!
//! Opens the local record store, serves the configured document rooms to
//! peers over WebSocket, dials known peers and, when a backend URL is set,
//! keeps the server in sync. Usage: `medisync-node [config.toml]`.

use std::collections::HashMap;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use medisync_collab::channel;
use medisync_collab::config::PeerEndpoint;
use medisync_collab::{
    DocumentStore, HttpBackend, LocalStore, OfflineQueue, PeerId, PeerTransport, ProtocolError,
    RecordEngine, SyncBridge, SyncConfig, SyncEvent, TransportError, TransportHandle,
};

const REDIAL_INTERVAL: Duration = Duration::from_secs(5);

async fn log_events(doc_id: String, mut events: mpsc::Receiver<SyncEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SyncEvent::PeerConnected { peer } => info!("[{doc_id}] {peer} connected"),
            SyncEvent::PeerDisconnected { peer } => info!("[{doc_id}] {peer} disconnected"),
            SyncEvent::ChangeApplied { peer, message_id, outcome } => {
                log::debug!("[{doc_id}] {message_id} from {peer}: {outcome:?}")
            }
            SyncEvent::ChangeRejected { peer, message_id, reason } => {
                log::warn!("[{doc_id}] {message_id} from {peer} quarantined: {reason}")
            }
            SyncEvent::DeliveryFailed { peer, message_id, transmissions } => log::warn!(
                "[{doc_id}] {message_id} never acked by {peer} after {transmissions} sends"
            ),
            SyncEvent::Meta { peer, action } => info!("[{doc_id}] meta '{action}' from {peer}"),
        }
    }
}

/// Keep a channel to `endpoint` open, redialing after every disconnect.
/// Nothing is dialed while the peer is already connected through its own dial.
async fn keep_dialing(
    endpoint: PeerEndpoint,
    local: PeerId,
    handle: TransportHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    let remote = PeerId::new(endpoint.id.clone());
    loop {
        let connected = match handle.open_peers().await {
            Ok(peers) => peers.contains(&remote),
            Err(_) => return,
        };
        if !connected {
            match channel::dial(&endpoint.url, &local, remote.clone(), handle.clone()).await {
                Ok(task) => {
                    let _ = task.await;
                }
                Err(ProtocolError::Transport(TransportError::DuplicateChannel(_))) => {
                    log::debug!("{remote} already connected for {}", handle.doc_id())
                }
                Err(e) => log::debug!("Dial {} for {} failed: {e}", endpoint.url, handle.doc_id()),
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(REDIAL_INTERVAL) => {}
            _ = shutdown.changed() => return,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = SyncConfig::load(config_path.as_deref())?;
    info!(
        "Starting medisync node {} with {} documents",
        config.node.peer_id,
        config.node.documents.len()
    );

    let store = Arc::new(LocalStore::open(config.store_config())?);
    let docs = Arc::new(DocumentStore::<RecordEngine>::new(store.clone()));
    let queue = Arc::new(OfflineQueue::new(store.clone(), config.backend.offline_capacity));
    info!("{} offline events waiting for upload", queue.len()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut rooms = HashMap::new();
    for doc_id in &config.node.documents {
        docs.initialize(doc_id).await?;
        let (handle, events) =
            PeerTransport::spawn(doc_id.clone(), config.transport_config(), docs.clone());
        tokio::spawn(log_events(doc_id.clone(), events));
        rooms.insert(doc_id.clone(), handle);
    }
    let rooms = Arc::new(rooms);

    let listener = TcpListener::bind(&config.node.listen_addr).await?;
    let server = tokio::spawn(channel::serve(listener, rooms.clone()));

    let local = PeerId::new(config.node.peer_id.clone());
    for endpoint in &config.node.peers {
        for handle in rooms.values() {
            tokio::spawn(keep_dialing(
                endpoint.clone(),
                local.clone(),
                handle.clone(),
                shutdown_rx.clone(),
            ));
        }
    }

    let bridge = match config.http_config() {
        Some(http) => {
            let bridge = Arc::new(SyncBridge::new(
                docs.clone(),
                queue.clone(),
                HttpBackend::new(http)?,
                config.bridge_config(),
            ));
            for doc_id in &config.node.documents {
                bridge.track(doc_id.clone()).await;
            }
            Some(tokio::spawn(bridge.run(shutdown_rx.clone())))
        }
        None => {
            info!("No backend configured, peer sync only");
            None
        }
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    let _ = shutdown_tx.send(true);
    server.abort();
    for handle in rooms.values() {
        if let Err(e) = handle.shutdown().await {
            log::warn!("Transport for {} already stopped: {e}", handle.doc_id());
        }
    }
    if let Some(bridge) = bridge {
        let _ = bridge.await;
    }
    docs.flush().await?;
    store.flush()?;
    info!("Stopped");
    Ok(())
}
