use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::worker::WorkerHandle;

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Worker spawned, stream not yet announced.
    Starting,
    /// Relaying in both directions.
    Active,
    /// Teardown in progress.
    Closing,
    /// Worker gone and stream closed.
    Closed,
}

impl SessionState {
    const fn rank(self) -> u8 {
        match self {
            Self::Starting => 0,
            Self::Active => 1,
            Self::Closing => 2,
            Self::Closed => 3,
        }
    }
}

/// Why a session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    ClientDisconnected,
    WorkerExited,
    WorkerIoError,
    IdleExpired,
    Shutdown,
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ClientDisconnected => "client_disconnected",
            Self::WorkerExited => "worker_exited",
            Self::WorkerIoError => "worker_io_error",
            Self::IdleExpired => "idle_expired",
            Self::Shutdown => "shutdown",
        })
    }
}

/// One event delivered on a client's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Announces where the client should post messages. Always first.
    Endpoint { session_id: String, path: String },
    /// One JSON message produced by the worker.
    Message(Value),
}

/// A live binding of one client stream to one worker process.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub command: String,
    pub env_overrides: HashMap<String, String>,
    pub worker: WorkerHandle,
    pub created_at: Instant,
    stream_tx: Mutex<Option<mpsc::Sender<StreamEvent>>>,
    last_activity: Mutex<Instant>,
    state: Mutex<SessionState>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        id: String,
        command: String,
        env_overrides: HashMap<String, String>,
        worker: WorkerHandle,
        stream_tx: mpsc::Sender<StreamEvent>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            command,
            env_overrides,
            worker,
            created_at: now,
            stream_tx: Mutex::new(Some(stream_tx)),
            last_activity: Mutex::new(now),
            state: Mutex::new(SessionState::Starting),
            cancel: CancellationToken::new(),
        }
    }

    /// Record client or worker traffic.
    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Time since the last recorded activity, as seen at `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Move to `next` unless the session is already past it.
    pub fn advance(&self, next: SessionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if next.rank() > state.rank() {
            *state = next;
            true
        } else {
            false
        }
    }

    /// Sender for the client stream, if it is still open.
    pub fn stream_sender(&self) -> Option<mpsc::Sender<StreamEvent>> {
        self.stream_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop the session's stream sender. The stream ends once the relay
    /// task has dropped its clone as well.
    pub fn close_stream(&self) {
        self.stream_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Token cancelled when the session starts tearing down.
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}
