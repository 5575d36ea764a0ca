//! `/health` endpoint.

use std::time::Instant;

use axum::Json;
use axum::extract::State;
use serde::Serialize;
use sysinfo::{ProcessesToUpdate, System};

use super::AppState;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    pub version: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Number of live sessions.
    pub active_sessions: usize,
    /// Resident memory of the gateway process.
    pub memory_bytes: u64,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, sessions: usize, memory_bytes: u64) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        uptime_secs: start_time.elapsed().as_secs(),
        active_sessions: sessions,
        memory_bytes,
    }
}

/// Resident memory of this process, or 0 when it cannot be read.
pub fn current_process_memory_bytes() -> u64 {
    let mut system = System::new();
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let _ = system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
    system.process(pid).map_or(0, sysinfo::Process::memory)
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let sessions = state.engine.active_sessions().await;
    Json(health_check(
        state.start_time,
        sessions,
        current_process_memory_bytes(),
    ))
}
