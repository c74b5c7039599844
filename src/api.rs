//! Read-only status API.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::controller::ControllerState;
use crate::publish::SharedSchedule;

pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

#[derive(Debug, Clone, Serialize)]
pub struct NowPlaying {
    pub line: usize,
    pub name: String,
    pub extra_info: Option<String>,
    pub duration: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Counters {
    pub videos_since_restart: u64,
    pub total_videos: u64,
    pub restarts: u64,
    pub retries: u64,
    pub downtime_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub version: String,
    pub state: ControllerState,
    pub now_playing: Option<NowPlaying>,
    pub index: usize,
    pub elapsed: f64,
    pub session_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub session_started_at: OffsetDateTime,
    pub session_runtime_secs: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub program_start_time: OffsetDateTime,
    pub counters: Counters,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: ControllerState::Stopped,
            now_playing: None,
            index: 0,
            elapsed: 0.0,
            session_id: Uuid::new_v4(),
            session_started_at: now,
            session_runtime_secs: 0.0,
            program_start_time: now,
            counters: Counters::default(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub status: SharedStatus,
    pub schedule: SharedSchedule,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/status", get(status))
        .route("/api/v1/schedule", get(schedule))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> &'static str {
    "loopcast engine is running. Try /api/v1/status"
}

async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.status.read().await.clone())
}

async fn schedule(State(state): State<AppState>) -> Response {
    match state.schedule.read().await.as_ref() {
        Some(doc) => Json(doc.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, "no schedule generated yet").into_response(),
    }
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    info!("status API listening on http://{addr}");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
