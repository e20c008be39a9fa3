//! HTTP surface: websocket upgrade plus the read-only status and history
//! endpoints the dashboard polls.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use medrelay_core::{Device, MedicationEvent};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::connection;
use crate::relay::Relay;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub arduino: &'static str,
    #[serde(rename = "serverTime")]
    pub server_time: String,
    #[serde(rename = "connectedDevices")]
    pub connected_devices: Vec<Device>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub logs: Vec<MedicationEvent>,
}

/// Build the Axum router with all routes. Unknown paths fall through to
/// `static_dir` when one is given.
pub fn build_router(state: AppState, static_dir: Option<&Path>) -> Router {
    let router = Router::new()
        .route("/ws", get(ws_handler))
        .route("/status", get(status_handler))
        .route("/logs", get(logs_handler))
        .with_state(state);

    let router = match static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    };

    router.layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive())
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_ws_connection(socket, peer, state.relay, state.shutdown))
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let arduino = if state.relay.hardware_connected() {
        "connected"
    } else {
        "disconnected"
    };
    Json(StatusResponse {
        status: "online",
        arduino,
        server_time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        connected_devices: state.relay.registry().snapshot(),
    })
}

async fn logs_handler(State(state): State<AppState>) -> Json<LogsResponse> {
    let log = Arc::clone(state.relay.event_log());
    let logs = match tokio::task::spawn_blocking(move || log.read_all()).await {
        Ok(Ok(events)) => events,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "failed to read medication log");
            Vec::new()
        }
        Err(e) => {
            tracing::error!(error = %e, "log read task failed");
            Vec::new()
        }
    };
    Json(LogsResponse { logs })
}
