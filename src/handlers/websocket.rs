use futures_util::sink::SinkExt;
use futures_util::stream::{SplitSink, StreamExt};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use warp::ws::{Message, WebSocket};

use crate::auth::provider::{AuthProvider, Identity};
use crate::core::connection::ConnectionHandle;
use crate::core::ids::ConnectionId;
use crate::core::message_types::ServerFrame;
use crate::core::router::SharedRouter;
use crate::error::HubError;

/// Transport timeouts taken from the hub configuration
#[derive(Debug, Clone, Copy)]
pub struct TransportSettings {
    pub auth_timeout: Duration,
    pub send_timeout: Duration,
}

/// Handle one upgraded WebSocket: authenticate, register, then pump frames
/// until either side goes away
pub async fn handle_ws_client(
    ws: WebSocket,
    credential: Option<String>,
    router: SharedRouter,
    auth: Arc<dyn AuthProvider>,
    settings: TransportSettings,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let identity = match authenticate(credential, auth.as_ref(), settings.auth_timeout).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!("Rejected WebSocket handshake: {}", e);
            refuse(&mut ws_tx, &e).await;
            return;
        }
    };

    let (connection, handle) = match router.register(identity).await {
        Ok(registered) => registered,
        Err(e) => {
            warn!("Refused connection: {}", e);
            refuse(&mut ws_tx, &e).await;
            return;
        }
    };
    let connection_id = connection.id;
    drop(connection);

    let mut writer = tokio::spawn(write_frames(
        ws_tx,
        handle,
        router.clone(),
        settings.send_timeout,
    ));

    loop {
        tokio::select! {
            incoming = ws_rx.next() => match incoming {
                Some(Ok(msg)) if msg.is_text() => {
                    if let Ok(text) = msg.to_str() {
                        router.handle_text(&connection_id, text).await;
                    }
                }
                Some(Ok(msg)) if msg.is_binary() => match std::str::from_utf8(msg.as_bytes()) {
                    Ok(text) => router.handle_text(&connection_id, text).await,
                    Err(_) => debug!("Ignoring non UTF-8 binary frame from {}", connection_id),
                },
                Some(Ok(msg)) if msg.is_close() => break,
                // Ping/pong are answered by the transport
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket error on {}: {}", connection_id, e);
                    break;
                }
                None => break,
            },
            _ = &mut writer => {
                debug!("Writer of {} stopped", connection_id);
                break;
            }
        }
    }

    router.remove(&connection_id).await;
    writer.abort();
    info!("Client disconnected: {}", connection_id);
}

async fn authenticate(
    credential: Option<String>,
    auth: &dyn AuthProvider,
    timeout: Duration,
) -> Result<Identity, HubError> {
    let credential = credential
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| HubError::AuthenticationFailed("missing credential".to_string()))?;
    tokio::time::timeout(timeout, auth.authenticate(&credential))
        .await
        .map_err(|_| HubError::UpstreamUnavailable("authentication timed out".to_string()))?
}

/// Tell the client why it was refused, then close
async fn refuse(ws_tx: &mut SplitSink<WebSocket, Message>, error: &HubError) {
    if let Ok(text) = ServerFrame::error(error, None, None).encode() {
        let _ = ws_tx.send(Message::text(text)).await;
    }
    let _ = ws_tx.close().await;
}

/// Drain the connection's outbound queue into the socket; a write that
/// fails or exceeds the send timeout removes the connection
async fn write_frames(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut handle: ConnectionHandle,
    router: SharedRouter,
    send_timeout: Duration,
) {
    let connection_id: ConnectionId = handle.id;
    while let Some(frame) = handle.receiver.recv().await {
        let write = ws_tx.send(Message::text(frame.to_string()));
        match tokio::time::timeout(send_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Failed to send WebSocket message to {}: {}", connection_id, e);
                break;
            }
            Err(_) => {
                warn!("Send to {} timed out after {:?}", connection_id, send_timeout);
                break;
            }
        }
    }
    router.remove(&connection_id).await;
    let _ = ws_tx.close().await;
}
