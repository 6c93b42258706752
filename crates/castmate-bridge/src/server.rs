//! HTTP server
//!
//! Serves the overlay WebSocket and a small REST surface for host state,
//! overlay configs, widget calls and broadcasts.

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::hub::HostHub;

async fn get_state(
    Path((namespace, key)): Path<(String, String)>,
    State(hub): State<HostHub>,
) -> Json<Value> {
    Json(hub.state().get(&namespace, &key))
}

async fn put_state(
    Path((namespace, key)): Path<(String, String)>,
    State(hub): State<HostHub>,
    Json(value): Json<Value>,
) -> StatusCode {
    debug!(namespace = %namespace, key = %key, "state set over HTTP");
    hub.state().set(&namespace, &key, value);
    StatusCode::NO_CONTENT
}

async fn put_overlay_config(
    Path(overlay): Path<String>,
    State(hub): State<HostHub>,
    Json(config): Json<Value>,
) -> StatusCode {
    hub.set_overlay_config(&overlay, config);
    StatusCode::NO_CONTENT
}

async fn call_widget(
    Path((overlay, widget, rpc)): Path<(String, String, String)>,
    State(hub): State<HostHub>,
    Json(args): Json<Vec<Value>>,
) -> Json<Vec<Value>> {
    Json(hub.call_widget(&overlay, &widget, &rpc, args).await)
}

async fn broadcast(
    Path(message_id): Path<String>,
    State(hub): State<HostHub>,
    Json(args): Json<Vec<Value>>,
) -> StatusCode {
    tokio::spawn(async move { hub.broadcast(&message_id, args).await });
    StatusCode::ACCEPTED
}

/// Build the axum application router
///
/// Separated from `run_server` to enable testing without TCP binding.
pub(crate) fn build_app(hub: HostHub) -> Router {
    Router::new()
        .route("/ws", get(crate::router::ws_handler))
        .route("/state/{namespace}/{key}", get(get_state).put(put_state))
        .route("/overlays/{overlay}/config", put(put_overlay_config))
        .route("/overlays/{overlay}/widgets/{widget}/{rpc}", post(call_widget))
        .route("/broadcast/{message_id}", post(broadcast))
        .with_state(hub)
}

/// Run the HTTP server
///
/// Binds to `127.0.0.1:<port>`
pub async fn run_server(port: u16, hub: HostHub) -> Result<(), std::io::Error> {
    let app = build_app(hub);

    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    info!(port = port, "castmate bridge listening");

    axum::serve(listener, app).await
}
