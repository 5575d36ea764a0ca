//! Relay engine.
//!
//! Every session gets one relay task that reads worker events, frames stdout
//! into NDJSON lines and forwards parsed messages to the client stream. All
//! termination triggers (client gone, worker exit, stdin failure, idle
//! expiry, shutdown) end in [`RelayEngine::teardown`], which is idempotent
//! because registry removal happens first.

use std::sync::Arc;
use std::time::Duration;

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use pipegate_core::ndjson::{LineFramer, encode_line, parse_line};
use pipegate_core::{Admission, Error, Result};

use crate::session::{Session, SessionRegistry, SessionState, StreamEvent, TeardownReason};
use crate::worker::{SpawnConfig, WorkerError, WorkerEvent, WorkerManager};

const WORKER_EVENT_QUEUE: usize = 64;
const STREAM_QUEUE: usize = 64;

/// Message endpoint announced to a client: `/{command}/message?sessionId=<id>`.
pub fn message_path(command: &str, session_id: &str) -> String {
    format!(
        "/{}/message?sessionId={}",
        utf8_percent_encode(command, NON_ALPHANUMERIC),
        session_id
    )
}

/// A freshly opened session, handed to the HTTP layer.
#[derive(Debug)]
pub struct OpenedSession {
    pub session_id: String,
    /// Path the client posts messages to.
    pub endpoint: String,
    /// Stream events; the endpoint event is already queued.
    pub events: mpsc::Receiver<StreamEvent>,
    /// Dropping this guard reports the client as disconnected.
    pub disconnect: DropGuard,
}

enum Flow {
    Continue,
    Stop(Option<TeardownReason>),
}

/// Pairs client streams with worker processes.
#[derive(Debug, Clone)]
pub struct RelayEngine {
    registry: SessionRegistry,
    workers: Arc<WorkerManager>,
    admission: Arc<Admission>,
    max_sessions: usize,
}

impl RelayEngine {
    pub fn new(admission: Admission, workers: WorkerManager, max_sessions: usize) -> Self {
        Self {
            registry: SessionRegistry::new(),
            workers: Arc::new(workers),
            admission: Arc::new(admission),
            max_sessions,
        }
    }

    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn workers(&self) -> &WorkerManager {
        &self.workers
    }

    pub async fn active_sessions(&self) -> usize {
        self.registry.len().await
    }

    /// Admit a stream request, spawn its worker and start relaying.
    pub async fn open_session<'a, I>(
        &self,
        authorization: Option<&str>,
        command: &str,
        metadata: I,
    ) -> Result<OpenedSession>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let admitted = self.admission.admit(authorization, command, metadata)?;

        if self.registry.len().await >= self.max_sessions {
            warn!(command, max_sessions = self.max_sessions, "Session limit reached");
            return Err(Error::SessionUnavailable(format!(
                "session limit of {} reached",
                self.max_sessions
            )));
        }

        let session_id = Uuid::new_v4().to_string();
        let (worker_tx, worker_rx) = mpsc::channel(WORKER_EVENT_QUEUE);
        let worker = self.workers.spawn(
            SpawnConfig {
                session_id: session_id.clone(),
                command: admitted.command.clone(),
                env: admitted.env.clone(),
            },
            worker_tx,
        )?;

        let endpoint = message_path(&admitted.command, &session_id);
        let (stream_tx, stream_rx) = mpsc::channel(STREAM_QUEUE);
        let announced = stream_tx.try_send(StreamEvent::Endpoint {
            session_id: session_id.clone(),
            path: endpoint.clone(),
        });

        let session = Arc::new(Session::new(
            session_id.clone(),
            admitted.command,
            admitted.env,
            worker,
            stream_tx,
        ));
        if announced.is_err() {
            session.worker.terminate().await;
            return Err(Error::Internal("failed to queue endpoint event".into()));
        }
        if let Err(e) = self
            .registry
            .insert(Arc::clone(&session), self.max_sessions)
            .await
        {
            session.worker.terminate().await;
            return Err(e);
        }
        session.advance(SessionState::Active);

        let client_gone = CancellationToken::new();
        tokio::spawn(
            self.clone()
                .relay(Arc::clone(&session), worker_rx, client_gone.clone()),
        );

        info!(session_id = %session_id, command = %session.command, "Session opened");
        Ok(OpenedSession {
            session_id,
            endpoint,
            events: stream_rx,
            disconnect: client_gone.drop_guard(),
        })
    }

    /// Relay one client message to the worker bound to `session_id`.
    pub async fn post_message(
        &self,
        authorization: Option<&str>,
        command: &str,
        session_id: Option<&str>,
        body: &[u8],
    ) -> Result<()> {
        self.admission.authenticate(authorization)?;
        let session_id = session_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::MalformedInput("Missing sessionId parameter".into()))?;

        let session = self
            .registry
            .get(session_id)
            .await
            .filter(|s| s.is_active() && s.command == command)
            .ok_or_else(|| Error::SessionUnavailable(format!("No active session {session_id}")))?;

        let value: Value = serde_json::from_slice(body)?;
        let line = encode_line(&value)?;

        match session.worker.try_send(line) {
            Ok(()) => {}
            Err(WorkerError::InputBusy) => {
                warn!(session_id, "Worker is not draining stdin, rejecting message");
                return Err(WorkerError::InputBusy.into());
            }
            Err(e) => {
                warn!(session_id, error = %e, "Failed to relay message to worker");
                self.teardown(session_id, TeardownReason::WorkerIoError)
                    .await;
                return Err(e.into());
            }
        }
        session.touch();
        debug!(session_id, "Relayed message to worker");
        Ok(())
    }

    /// Tear a session down. Returns `false` if it was already gone.
    pub async fn teardown(&self, session_id: &str, reason: TeardownReason) -> bool {
        let Some(session) = self.registry.remove(session_id).await else {
            debug!(session_id, %reason, "Session already torn down");
            return false;
        };

        session.advance(SessionState::Closing);
        session.cancel_token().cancel();
        let exit = session.worker.terminate().await;
        session.close_stream();
        session.advance(SessionState::Closed);

        info!(
            session_id,
            command = %session.command,
            %reason,
            exit_code = ?exit.and_then(|e| e.code),
            forced = exit.is_some_and(|e| e.forced),
            "Session closed"
        );
        true
    }

    /// Expire sessions idle for longer than `timeout` and reap sessions whose
    /// worker has already exited.
    pub async fn sweep_idle(&self, timeout: Duration) -> usize {
        self.sweep_idle_at(Instant::now(), timeout).await
    }

    /// Sweep at `now`. Teardowns run concurrently; each one is detached, so
    /// dropping this future mid-sweep leaves the started teardowns running.
    pub async fn sweep_idle_at(&self, now: Instant, timeout: Duration) -> usize {
        let mut pending = Vec::new();
        for session in self.registry.snapshot().await {
            let reason = if session.worker.has_exited() {
                TeardownReason::WorkerExited
            } else if session.idle_for(now) > timeout {
                TeardownReason::IdleExpired
            } else {
                continue;
            };
            let engine = self.clone();
            pending.push(tokio::spawn(async move {
                engine.teardown(&session.id, reason).await
            }));
        }

        let mut expired = 0;
        for task in pending {
            match task.await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Sweep teardown task failed"),
            }
        }
        if expired > 0 {
            info!(expired, "Swept sessions");
        }
        expired
    }

    /// Tear down every live session concurrently.
    pub async fn teardown_all(&self, reason: TeardownReason) -> usize {
        let mut set = JoinSet::new();
        for id in self.registry.snapshot_ids().await {
            let engine = self.clone();
            set.spawn(async move { engine.teardown(&id, reason).await });
        }
        let mut closed = 0;
        while let Some(result) = set.join_next().await {
            match result {
                Ok(true) => closed += 1,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Teardown task failed"),
            }
        }
        closed
    }

    async fn relay(
        self,
        session: Arc<Session>,
        mut worker_rx: mpsc::Receiver<WorkerEvent>,
        client_gone: CancellationToken,
    ) {
        let cancel = session.cancel_token().clone();
        let Some(stream_tx) = session.stream_sender() else {
            return;
        };
        let mut framer = LineFramer::new();

        let reason = 'relay: loop {
            tokio::select! {
                () = cancel.cancelled() => break None,
                () = client_gone.cancelled() => break Some(TeardownReason::ClientDisconnected),
                event = worker_rx.recv() => match event {
                    Some(WorkerEvent::Stdout(chunk)) => {
                        for line in framer.push(&chunk) {
                            if let Flow::Stop(reason) =
                                forward_line(&session, &stream_tx, &line, &cancel).await
                            {
                                break 'relay reason;
                            }
                        }
                    }
                    Some(WorkerEvent::InputFailed(error)) => {
                        warn!(session_id = %session.id, %error, "Worker stdin failed");
                        break Some(TeardownReason::WorkerIoError);
                    }
                    Some(WorkerEvent::Exited(exit)) => {
                        if let Some(line) = framer.finish() {
                            if let Flow::Stop(reason) =
                                forward_line(&session, &stream_tx, &line, &cancel).await
                            {
                                break reason;
                            }
                        }
                        debug!(session_id = %session.id, code = ?exit.code, "Worker exit observed");
                        break Some(TeardownReason::WorkerExited);
                    }
                    None => break Some(TeardownReason::WorkerExited),
                },
            }
        };

        drop(stream_tx);
        drop(worker_rx);
        if let Some(reason) = reason {
            self.teardown(&session.id, reason).await;
        }
    }
}

async fn forward_line(
    session: &Session,
    stream_tx: &mpsc::Sender<StreamEvent>,
    line: &str,
    cancel: &CancellationToken,
) -> Flow {
    let value = match parse_line(line) {
        Ok(value) => value,
        Err(e) => {
            debug!(session_id = %session.id, error = %e, "Dropping non-JSON worker output");
            return Flow::Continue;
        }
    };

    tokio::select! {
        sent = stream_tx.send(StreamEvent::Message(value)) => {
            if sent.is_ok() {
                session.touch();
                Flow::Continue
            } else {
                Flow::Stop(Some(TeardownReason::ClientDisconnected))
            }
        }
        () = cancel.cancelled() => Flow::Stop(None),
    }
}
