//! Gateway-facing HTTP surface: one tool-call endpoint plus health.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use bayline_channels::Dispatcher;
use bayline_core::ArtifactStore;
use bayline_sources::BrowserDriver;

#[derive(Clone)]
pub struct AppState {
    dispatcher: Arc<Dispatcher>,
    driver: Arc<BrowserDriver>,
    artifacts: ArtifactStore,
    started: Instant,
}

impl AppState {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        driver: Arc<BrowserDriver>,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            dispatcher,
            driver,
            artifacts,
            started: Instant::now(),
        }
    }
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/tool-call", post(tool_call))
        .with_state(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthReport {
    browser_running: bool,
    cdp_reachable: bool,
    disk_free_mb: u64,
    uptime_s: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    let cdp_reachable = state.driver.reachable().await;
    let disk_free_mb = fs2::available_space(state.artifacts.root())
        .or_else(|_| fs2::available_space(std::env::temp_dir()))
        .map(|bytes| bytes / (1024 * 1024))
        .unwrap_or(0);
    Json(HealthReport {
        browser_running: cdp_reachable,
        cdp_reachable,
        disk_free_mb,
        uptime_s: state.started.elapsed().as_secs(),
    })
}

#[derive(Debug, Deserialize)]
struct ToolCallRequest {
    chat_id: String,
    #[serde(flatten)]
    payload: Value,
}

#[derive(Debug, Serialize)]
struct ToolCallReply {
    chat_id: String,
    text: String,
}

async fn tool_call(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ToolCallRequest>,
) -> Result<Json<ToolCallReply>, StatusCode> {
    if request.chat_id.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let text = state
        .dispatcher
        .handle_tool_call(&request.chat_id, &request.payload)
        .await;
    Ok(Json(ToolCallReply {
        chat_id: request.chat_id,
        text,
    }))
}
