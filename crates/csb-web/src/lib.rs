//! Axum health/readiness endpoints for CSB.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use csb_store::StateStore;
use csb_sync::TimerDriver;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "csb-web";

#[derive(Clone)]
pub struct AppState {
    started_at: DateTime<Utc>,
    timer: Arc<TimerDriver>,
    state_store: Arc<StateStore>,
}

impl AppState {
    pub fn new(timer: Arc<TimerDriver>, state_store: Arc<StateStore>) -> Self {
        Self {
            started_at: Utc::now(),
            timer,
            state_store,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    uptime_secs: i64,
    timer_running: bool,
    cycles_completed: u64,
    tracked_state_keys: usize,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "health endpoint listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<AppState>) -> Response {
    let timer_running = state.timer.is_running();
    let report = HealthReport {
        status: if timer_running { "healthy" } else { "degraded" },
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        timer_running,
        cycles_completed: state.timer.cycles_completed(),
        tracked_state_keys: state.state_store.len().await,
    };
    let code = if timer_running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report)).into_response()
}

/// Ready once the first full update cycle has completed.
async fn ready(State(state): State<AppState>) -> Response {
    if state.timer.cycles_completed() > 0 {
        (StatusCode::OK, Json(serde_json::json!({ "ready": true }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "ready": false })),
        )
            .into_response()
    }
}
