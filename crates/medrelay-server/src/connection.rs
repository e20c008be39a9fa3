use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use medrelay_core::ConnectionId;
use tokio_util::sync::CancellationToken;

use crate::relay::Relay;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Drive one websocket from accept to close.
///
/// The socket is split: a writer task drains the connection's outbound queue
/// (plus a periodic ping), while this task reads frames one at a time and
/// hands each to the relay before reading the next.
pub async fn handle_ws_connection(socket: WebSocket, peer: SocketAddr, relay: Arc<Relay>, shutdown: CancellationToken) {
    let (mut ws_tx, ws_rx) = socket.split();

    let (registration, greeting) = relay.accept(peer.to_string());
    let id = registration.id;
    tracing::info!(connection_id = %id, device_id = %registration.device_id, ip = %peer, "client connected");

    let sent = match greeting.to_json() {
        Ok(json) => ws_tx.send(WsMessage::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!(connection_id = %id, error = %e, "failed to serialize greeting");
            false
        }
    };
    if !sent {
        tracing::warn!(connection_id = %id, "could not deliver connection status, closing");
        relay.abandon(id);
        let _ = ws_tx.close().await;
        return;
    }

    let mut rx = registration.rx;
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            // Unregistered or pruned: the queue is closed.
                            let _ = ws_tx.close().await;
                            break;
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(connection_id = %id, "sent ping");
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => {},
        () = read_frames(ws_rx, id, &relay) => {},
        () = shutdown.cancelled() => {},
    }

    // Closing the registration drops the queue sender, so the writer flushes
    // what is left and closes the socket on its own.
    if relay.close(id).is_none() {
        tracing::debug!(connection_id = %id, "connection already pruned");
    }
}

async fn read_frames(mut ws_rx: SplitStream<WebSocket>, id: ConnectionId, relay: &Relay) {
    while let Some(frame) = ws_rx.next().await {
        let keep_open = match frame {
            Ok(WsMessage::Text(text)) => relay.handle_frame(id, text.as_str().as_bytes()),
            Ok(WsMessage::Binary(bytes)) => relay.handle_frame(id, &bytes),
            Ok(WsMessage::Close(_)) => false,
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_)) => true, // axum answers pings
            Err(e) => {
                tracing::debug!(connection_id = %id, error = %e, "websocket read failed");
                false
            }
        };
        if !keep_open {
            return;
        }
    }
}
