//! HTTP surface: router, middleware, health and error mapping.

pub mod error;
pub mod health;
pub mod rate_limit;
pub mod routes;

use std::sync::Arc;
use std::time::{Duration, Instant};

use pipegate_core::{Admission, GatewayConfig, RateLimiter};

use crate::relay::RelayEngine;
use crate::worker::WorkerManager;

pub use error::ApiError;
pub use routes::build_router;

/// Shared application state.
#[derive(Debug, Clone)]
pub struct AppState {
    pub engine: RelayEngine,
    pub limiter: Arc<RateLimiter>,
    pub start_time: Instant,
    pub keep_alive: Duration,
}

impl AppState {
    pub fn new(engine: RelayEngine, limiter: RateLimiter, keep_alive: Duration) -> Self {
        Self {
            engine,
            limiter: Arc::new(limiter),
            start_time: Instant::now(),
            keep_alive,
        }
    }

    /// Wire the engine and rate limiter from a validated configuration.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let engine = RelayEngine::new(
            Admission::from_config(config),
            WorkerManager::new(config.sessions.terminate_grace()),
            config.max_sessions,
        );
        Self::new(
            engine,
            RateLimiter::new(config.rate_limit.clone()),
            config.sessions.keep_alive(),
        )
    }
}
