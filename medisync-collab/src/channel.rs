//! WebSocket peer channels.
//!
//! The handshake is the request path `/{doc_id}/{peer_id}`: the dialing side
//! names the document room and announces its own peer id. After that every
//! WebSocket text frame carries one [`crate::protocol::WireMessage`].
//!
//! ```text
//! remote ── ws text ──► reader ── TransportHandle::frame ──► PeerTransport
//! remote ◄── ws text ── writer ◄── outbound mpsc ◄────────── PeerTransport
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::driver::TransportHandle;
use crate::protocol::{PeerId, ProtocolError};
use crate::transport::TransportError;

/// Frames buffered per peer before `try_send` starts dropping.
pub const OUTBOUND_CAPACITY: usize = 1024;

/// Document room and peer named by a handshake path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRoute {
    pub doc_id: String,
    pub peer: PeerId,
}

impl PeerRoute {
    pub fn new(doc_id: impl Into<String>, peer: PeerId) -> Self {
        Self {
            doc_id: doc_id.into(),
            peer,
        }
    }

    /// Parse `/{doc_id}/{peer_id}`.
    pub fn parse(path: &str) -> Result<Self, ProtocolError> {
        let trimmed = path.trim_matches('/');
        match trimmed.split_once('/') {
            Some((doc_id, peer))
                if !doc_id.is_empty() && !peer.is_empty() && !peer.contains('/') =>
            {
                Ok(Self::new(doc_id, PeerId::from(peer)))
            }
            _ => Err(ProtocolError::Handshake(format!(
                "expected /{{doc_id}}/{{peer_id}}, got {path}"
            ))),
        }
    }

    pub fn path(&self) -> String {
        format!("/{}/{}", self.doc_id, self.peer)
    }
}

/// Complete the server side of a handshake.
pub async fn accept(
    stream: TcpStream,
) -> Result<(PeerRoute, WebSocketStream<TcpStream>), ProtocolError> {
    let mut route = None;
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        match PeerRoute::parse(req.uri().path()) {
            Ok(parsed) => {
                route = Some(parsed);
                Ok(resp)
            }
            Err(e) => {
                let mut reject = ErrorResponse::new(Some(e.to_string()));
                *reject.status_mut() = StatusCode::BAD_REQUEST;
                Err(reject)
            }
        }
    })
    .await?;

    let route = route.ok_or_else(|| ProtocolError::Handshake("missing route".into()))?;
    Ok((route, ws))
}

/// Bridge a WebSocket to a transport. The connection stays up until either
/// side closes or the transport replaces it; the transport is told about the
/// close in every case. `dialer` is the peer that opened the connection.
///
/// If the transport already prefers another connection to `peer`, the socket
/// is closed and [`TransportError::DuplicateChannel`] is returned.
pub async fn attach<S>(
    handle: TransportHandle,
    peer: PeerId,
    dialer: PeerId,
    mut ws: WebSocketStream<S>,
) -> Result<JoinHandle<()>, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
    let channel = match handle.open_connection(peer.clone(), dialer, outbound_tx).await {
        Ok(channel) => channel,
        Err(e) => {
            let _ = ws.close(None).await;
            return Err(e.into());
        }
    };
    let (mut sink, mut stream) = ws.split();

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = outbound_rx.recv() => match frame {
                    Some(text) => {
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            log::warn!("Write to {peer} failed: {e}");
                            break;
                        }
                    }
                    None => break,
                },
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if handle.frame(&peer, text.as_str().to_owned()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("Read from {peer} failed: {e}");
                        break;
                    }
                },
            }
        }
        let _ = handle.close_channel(&peer, channel).await;
        let _ = sink.close().await;
        log::debug!("Channel to {peer} on {} closed", handle.doc_id());
    }))
}

/// Dial a remote peer and attach the connection.
///
/// `url` is the remote base address (`ws://host:port`), `local` is announced
/// in the path and `remote` is the id the transport tracks the peer under.
pub async fn dial(
    url: &str,
    local: &PeerId,
    remote: PeerId,
    handle: TransportHandle,
) -> Result<JoinHandle<()>, ProtocolError> {
    let route = PeerRoute::new(handle.doc_id(), local.clone());
    let target = format!("{}{}", url.trim_end_matches('/'), route.path());
    let (ws, _) = tokio_tungstenite::connect_async(target.as_str()).await?;
    log::info!("Connected to {remote} at {target}");
    attach(handle, remote, local.clone(), ws).await
}

/// Accept peer connections and route them to the transport of their room.
pub async fn serve(
    listener: TcpListener,
    rooms: Arc<HashMap<String, TransportHandle>>,
) -> Result<(), ProtocolError> {
    let addr = listener
        .local_addr()
        .map_err(|e| ProtocolError::Handshake(e.to_string()))?;
    log::info!("Peer listener on {addr}");

    loop {
        let (stream, remote_addr) = listener
            .accept()
            .await
            .map_err(|e| ProtocolError::Handshake(e.to_string()))?;
        log::debug!("New TCP connection from {remote_addr}");

        let rooms = rooms.clone();
        tokio::spawn(async move {
            let (route, ws) = match accept(stream).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Handshake from {remote_addr} failed: {e}");
                    return;
                }
            };
            let Some(handle) = rooms.get(&route.doc_id).cloned() else {
                log::warn!("Peer {} asked for unknown document {}", route.peer, route.doc_id);
                return;
            };
            let dialer = route.peer.clone();
            match attach(handle, route.peer.clone(), dialer, ws).await {
                Ok(_) => {}
                Err(ProtocolError::Transport(TransportError::DuplicateChannel(peer))) => {
                    log::debug!("Duplicate connection from {peer} closed");
                }
                Err(e) => log::error!("Could not attach {}: {e}", route.peer),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_parse() {
        let route = PeerRoute::parse("/patient:42/nurse-tablet").unwrap();
        assert_eq!(route.doc_id, "patient:42");
        assert_eq!(route.peer, PeerId::from("nurse-tablet"));
        assert_eq!(route.path(), "/patient:42/nurse-tablet");
    }

    #[test]
    fn test_route_rejects_bad_paths() {
        for path in ["/", "/only-doc", "//peer", "/doc/", "/a/b/c"] {
            assert!(PeerRoute::parse(path).is_err(), "{path}");
        }
    }
}
