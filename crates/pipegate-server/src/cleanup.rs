//! Periodic idle-session sweep.

use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::relay::RelayEngine;

/// Spawns the background sweep task.
pub struct CleanupScheduler;

impl CleanupScheduler {
    /// Start sweeping every `interval`, expiring sessions idle for longer
    /// than `session_timeout`. The first sweep runs one interval after start.
    /// Stopping never waits for an in-flight sweep to finish.
    pub fn spawn(engine: RelayEngine, interval: Duration, session_timeout: Duration) -> CleanupHandle {
        let token = CancellationToken::new();
        let stop = token.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // Skip first immediate tick
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        // Teardowns already started keep running if stop wins.
                        tokio::select! {
                            () = stop.cancelled() => break,
                            expired = engine.sweep_idle(session_timeout) => {
                                debug!(expired, "Idle sweep completed");
                            }
                        }
                    }
                }
            }
            debug!("Cleanup scheduler stopped");
        });
        info!(
            interval_secs = interval.as_secs(),
            timeout_secs = session_timeout.as_secs(),
            "Cleanup scheduler started"
        );
        CleanupHandle {
            token,
            task: Some(task),
        }
    }
}

/// Handle to the running sweep task.
#[derive(Debug)]
pub struct CleanupHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CleanupHandle {
    /// Stop ticking and wait for the task. Safe to call more than once.
    pub async fn stop(&mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Cleanup task failed");
            }
        }
    }

    /// Resolves only if the task ends without being stopped, which means it
    /// panicked. Pending forever once the task has been joined.
    pub async fn finished(&mut self) -> Result<(), JoinError> {
        match self.task.as_mut() {
            Some(task) => {
                let result = task.await;
                self.task = None;
                result
            }
            None => std::future::pending().await,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}
