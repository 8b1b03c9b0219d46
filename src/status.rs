//! ==============================================================================
//! status.rs - local status api
//! ==============================================================================
//!
//! purpose:
//!     read-only view of the agent for whoever is on the local network, plus
//!     one command (clear the energy total).
//!
//! shared state:
//!     the orchestrator writes an AgentStatus snapshot after every tick and
//!     every inbound event; handlers only read it. commands do not touch the
//!     accumulator directly, they are queued to the run loop so storage is
//!     only ever used from that one control flow.
//!
//! routes:
//!     GET  /api/status         current snapshot as json
//!     POST /api/energy/clear   queue a clear of the durable total
//!
//! ==============================================================================

use crate::domain::{ConnectivityState, InboundEvent, SyncOutcome};
use crate::error::Result;

use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tower_http::cors::CorsLayer;
use tracing::info;

#[derive(Clone, Debug, Serialize)]
pub struct AgentStatus {
    pub device_id: String,
    pub connectivity: ConnectivityState,
    pub energy_total_kwh: f64,
    pub last_saved_kwh: Option<f64>,
    pub ticks: u64,
    pub primary: Option<SyncOutcome>,
    pub realtime: Option<SyncOutcome>,
    pub last_event: Option<InboundEvent>,
    pub stream_resubscribes: u64,
    /// milliseconds since the agent booted
    pub uptime_ms: u64,
}

impl AgentStatus {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            connectivity: ConnectivityState::Disconnected,
            energy_total_kwh: 0.0,
            last_saved_kwh: None,
            ticks: 0,
            primary: None,
            realtime: None,
            last_event: None,
            stream_resubscribes: 0,
            uptime_ms: 0,
        }
    }
}

pub type SharedStatus = Arc<RwLock<AgentStatus>>;

/// requests queued to the run loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentCommand {
    ClearEnergy,
}

#[derive(Clone)]
struct ApiState {
    status: SharedStatus,
    commands: mpsc::Sender<AgentCommand>,
}

pub fn router(status: SharedStatus, commands: mpsc::Sender<AgentCommand>) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/energy/clear", post(clear_handler))
        .layer(CorsLayer::permissive())
        .with_state(ApiState { status, commands })
}

pub async fn serve(
    bind: &str,
    status: SharedStatus,
    commands: mpsc::Sender<AgentCommand>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "status api listening");
    axum::serve(listener, router(status, commands)).await?;
    Ok(())
}

async fn status_handler(State(state): State<ApiState>) -> Json<AgentStatus> {
    let snapshot = state.status.read().await;
    Json(snapshot.clone())
}

async fn clear_handler(State(state): State<ApiState>) -> Json<serde_json::Value> {
    match state.commands.send(AgentCommand::ClearEnergy).await {
        Ok(()) => Json(serde_json::json!({"status": "ok", "action": "clear"})),
        Err(_) => Json(serde_json::json!({"status": "error", "message": "agent not running"})),
    }
}
