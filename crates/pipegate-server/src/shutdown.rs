//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cleanup::CleanupHandle;
use crate::relay::RelayEngine;
use crate::session::TeardownReason;

/// Signals the HTTP server to stop and drains live sessions.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    engine: RelayEngine,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(engine: RelayEngine, grace: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            engine,
            grace,
        }
    }

    /// Token cancelled when shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Drain all sessions.
    ///
    /// 1. Cancel the shutdown token (stops accepting connections)
    /// 2. Stop the cleanup scheduler
    /// 3. Tear down every session concurrently, bounded by the grace period
    ///
    /// Returns the number of sessions closed, or `None` if the grace expired.
    pub async fn drain(&self, cleanup: Option<&mut CleanupHandle>) -> Option<usize> {
        self.token.cancel();
        if let Some(cleanup) = cleanup {
            cleanup.stop().await;
        }

        let live = self.engine.active_sessions().await;
        info!(
            sessions = live,
            grace_secs = self.grace.as_secs(),
            "Draining sessions"
        );
        match tokio::time::timeout(self.grace, self.engine.teardown_all(TeardownReason::Shutdown))
            .await
        {
            Ok(closed) => {
                info!(closed, "All sessions drained");
                Some(closed)
            }
            Err(_) => {
                warn!(
                    "shutdown timed out after {:?}, some workers may still be running",
                    self.grace
                );
                None
            }
        }
    }
}
