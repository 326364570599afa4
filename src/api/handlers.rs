//! HTTP API handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;

use crate::redemption::CycleReport;
use crate::strategy::engine::EngineStatus;
use crate::strategy::kill_switch::{KillSwitch, KillSwitchStatus};

/// Application state shared with handlers.
#[derive(Clone)]
pub struct AppState {
    /// Whether the bot is ready to trade.
    pub ready: Arc<AtomicBool>,
    /// When the process started.
    pub started_at: OffsetDateTime,
    /// The shared kill switch.
    pub kill_switch: Arc<Mutex<KillSwitch>>,
    /// Latest engine snapshot, written by the strategy engine.
    pub engine_status: Arc<RwLock<Option<EngineStatus>>>,
    /// Latest redemption cycle report.
    pub claim_report: Arc<RwLock<Option<CycleReport>>>,
}

impl AppState {
    /// Create new app state around the shared engine handles.
    pub fn new(
        kill_switch: Arc<Mutex<KillSwitch>>,
        engine_status: Arc<RwLock<Option<EngineStatus>>>,
        claim_report: Arc<RwLock<Option<CycleReport>>>,
    ) -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            started_at: OffsetDateTime::now_utc(),
            kill_switch,
            engine_status,
            claim_report,
        }
    }

    /// Set ready state.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Check if ready.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn kill_switch_status(&self) -> KillSwitchStatus {
        self.kill_switch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .status()
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status: "ok".
    pub status: &'static str,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    /// Whether service is ready.
    pub ready: bool,
}

/// Status response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Service status.
    pub status: &'static str,
    /// Uptime in seconds.
    pub uptime_secs: i64,
    /// Kill switch snapshot.
    pub kill_switch: KillSwitchStatus,
    /// Latest engine snapshot, absent until the first tick.
    pub engine: Option<EngineStatus>,
    /// Latest redemption cycle, absent until the first cycle.
    pub last_claim_cycle: Option<CycleReport>,
}

/// Kill switch reset response.
#[derive(Debug, Serialize)]
pub struct KillSwitchResetResponse {
    /// Kill switch snapshot after the reset.
    pub kill_switch: KillSwitchStatus,
}

/// Health check handler - always returns 200.
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

/// Readiness check handler - returns 200 if ready, 503 otherwise.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let is_ready = state.is_ready();
    let response = ReadyResponse { ready: is_ready };

    if is_ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Status handler - engine snapshot plus kill switch state.
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let engine = state
        .engine_status
        .read()
        .ok()
        .and_then(|guard| guard.clone());

    let last_claim_cycle = state
        .claim_report
        .read()
        .ok()
        .and_then(|guard| guard.clone());

    let status = if state.is_ready() { "running" } else { "starting" };

    Json(StatusResponse {
        status,
        uptime_secs: (OffsetDateTime::now_utc() - state.started_at).whole_seconds(),
        kill_switch: state.kill_switch_status(),
        engine,
        last_claim_cycle,
    })
}

/// Operator reset of the kill switch. Entries resume on the next tick.
pub async fn reset_kill_switch(State(state): State<AppState>) -> impl IntoResponse {
    let mut switch = state
        .kill_switch
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let was_tripped = switch.entries_allowed();
    switch.reset();
    info!(was_allowed = was_tripped, "kill switch reset by operator");

    Json(KillSwitchResetResponse {
        kill_switch: switch.status(),
    })
}
