//! WebSocket handler for overlay connections
//!
//! Each socket gets a channel-backed transport. Outbound frames queued by the
//! hub are drained onto the socket by the same task that reads it, so writes
//! never block the RPC layer.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use castmate_rpc::{ChannelTransport, Payload};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::hub::HostHub;

/// Query string of the upgrade request
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub overlay: Option<String>,
}

/// WebSocket upgrade handler
///
/// Rejects the upgrade unless the URL names an overlay.
pub async fn ws_handler(
    Query(params): Query<ConnectParams>,
    State(hub): State<HostHub>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(overlay) = params.overlay.filter(|id| !id.is_empty()) else {
        warn!("WebSocket upgrade rejected: no overlay id");
        return (StatusCode::BAD_REQUEST, "Missing overlay id").into_response();
    };

    info!(overlay = %overlay, "WebSocket upgrade accepted");
    ws.on_upgrade(move |socket| handle_socket(socket, overlay, hub))
}

/// Pump one overlay socket until it closes
async fn handle_socket(mut socket: WebSocket, overlay: String, hub: HostHub) {
    let (transport, mut outbound) = ChannelTransport::new();
    let (id, endpoint) = hub.connect(&overlay, Arc::new(transport));

    loop {
        tokio::select! {
            Some(text) = outbound.recv() => {
                if socket.send(Message::Text(text.into())).await.is_err() {
                    info!(conn = id, "socket closed during send");
                    break;
                }
            }

            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        endpoint.spawn_receive(Payload::Text(text.as_str().to_owned()));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        endpoint.spawn_receive(Payload::Binary(data.to_vec()));
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(conn = id, "socket closed");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ping and pong are answered by axum
                    }
                    Some(Err(e)) => {
                        error!(conn = id, "WebSocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    hub.disconnect(id);
}
