//! Worker process lifecycle manager.
//!
//! Spawns one process per session and wires its stdio into tasks:
//! - a stdin writer fed by an `mpsc` channel,
//! - a stdout reader forwarding raw chunks as [`WorkerEvent::Stdout`],
//! - a stderr reader that only logs,
//! - a supervisor that owns the [`Child`] and reports its exit.
//!
//! The supervisor is the only code that signals the process, so a worker is
//! terminated at most once no matter how many teardown paths race.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Variables copied from the gateway's own environment into every worker.
pub const BASE_ENV_KEYS: &[&str] = &["PATH", "HOME", "LANG", "TERM", "TMPDIR", "USER", "SHELL"];

/// Variables that steer the hosting runtime and are never taken from overrides.
pub const RESERVED_ENV_KEYS: &[&str] = &["PATH", "HOME", "RUST_LOG", "RUST_BACKTRACE"];

/// Prefix reserved for the gateway's own configuration.
pub const RESERVED_ENV_PREFIX: &str = "PIPEGATE_";

const STDOUT_CHUNK_BYTES: usize = 8 * 1024;
const STDIN_QUEUE: usize = 32;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// What a worker reports back to its session.
#[derive(Debug)]
pub enum WorkerEvent {
    /// Raw stdout bytes, in arrival order, with arbitrary boundaries.
    Stdout(Vec<u8>),
    /// Writing to stdin failed; the input channel is unusable.
    InputFailed(String),
    /// The process is gone. Sent after all stdout has been forwarded.
    Exited(WorkerExit),
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Whether the process had to be force-killed after the grace period.
    pub forced: bool,
}

/// Parameters for one worker spawn.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Session the worker belongs to (for logging).
    pub session_id: String,
    /// Allow-listed command line, run through the shell.
    pub command: String,
    /// Sanitized environment overrides.
    pub env: HashMap<String, String>,
}

/// Handle to a running worker. Owned by exactly one session.
#[derive(Debug)]
pub struct WorkerHandle {
    pid: Option<u32>,
    stdin_tx: mpsc::Sender<String>,
    terminate_tx: Mutex<Option<oneshot::Sender<()>>>,
    exit_rx: watch::Receiver<Option<WorkerExit>>,
}

impl WorkerHandle {
    /// OS process id at spawn time.
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue one already-terminated line for the worker's stdin.
    pub async fn send(&self, line: String) -> Result<(), WorkerError> {
        self.stdin_tx
            .send(line)
            .await
            .map_err(|_| WorkerError::InputClosed)
    }

    /// Queue a line without waiting. Fails with [`WorkerError::InputBusy`]
    /// when the worker is not draining its stdin.
    pub fn try_send(&self, line: String) -> Result<(), WorkerError> {
        self.stdin_tx.try_send(line).map_err(|e| match e {
            TrySendError::Full(_) => WorkerError::InputBusy,
            TrySendError::Closed(_) => WorkerError::InputClosed,
        })
    }

    /// Whether the process has already exited.
    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Exit information, if the process has exited.
    pub fn exit_status(&self) -> Option<WorkerExit> {
        *self.exit_rx.borrow()
    }

    /// Ask the supervisor to stop the process (SIGTERM, grace, SIGKILL) and
    /// wait until it is gone. Only the first call sends the request; later
    /// calls just wait.
    pub async fn terminate(&self) -> Option<WorkerExit> {
        let request = self
            .terminate_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = request {
            let _ = tx.send(());
        }
        self.wait().await
    }

    /// Wait for the process to exit without requesting termination.
    pub async fn wait(&self) -> Option<WorkerExit> {
        let mut rx = self.exit_rx.clone();
        rx.wait_for(Option::is_some).await.ok().and_then(|exit| *exit)
    }
}

/// Spawns and supervises worker processes.
#[derive(Debug)]
pub struct WorkerManager {
    shell: PathBuf,
    base_env: Vec<(String, String)>,
    terminate_grace: Duration,
    spawned: AtomicU64,
}

impl WorkerManager {
    /// Create a manager whose base environment is captured from this process.
    pub fn new(terminate_grace: Duration) -> Self {
        let base_env = BASE_ENV_KEYS
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| ((*key).to_string(), v)))
            .collect();
        Self::with_base_env(terminate_grace, base_env)
    }

    /// Create a manager with an explicit base environment.
    pub fn with_base_env(terminate_grace: Duration, base_env: Vec<(String, String)>) -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
            base_env,
            terminate_grace,
            spawned: AtomicU64::new(0),
        }
    }

    /// Number of processes spawned since startup.
    pub fn spawned_count(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    pub const fn terminate_grace(&self) -> Duration {
        self.terminate_grace
    }

    /// Environment a worker starts with: the base environment overlaid with
    /// the overrides, minus reserved keys.
    pub fn build_env(&self, overrides: &HashMap<String, String>) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = self.base_env.iter().cloned().collect();
        for (key, value) in overrides {
            if is_reserved_env_key(key) {
                warn!(
                    security_event = "reserved_env_override",
                    variable = %key,
                    "Ignoring override of reserved environment variable"
                );
                continue;
            }
            env.insert(key.clone(), value.clone());
        }
        env
    }

    /// Spawn a worker. Output and lifecycle events are delivered on `events`.
    pub fn spawn(
        &self,
        config: SpawnConfig,
        events: mpsc::Sender<WorkerEvent>,
    ) -> Result<WorkerHandle, WorkerError> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&config.command)
            .env_clear()
            .envs(self.build_env(&config.env))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so termination reaches the shell's children too.
        #[cfg(unix)]
        cmd.process_group(0);

        info!(
            session_id = %config.session_id,
            command = %config.command,
            overrides = config.env.len(),
            "Spawning worker"
        );
        let mut child = cmd.spawn().map_err(|e| WorkerError::SpawnFailed {
            reason: e.to_string(),
        })?;
        self.spawned.fetch_add(1, Ordering::Relaxed);
        let pid = child.id();

        let stdin = child.stdin.take().ok_or_else(|| WorkerError::SpawnFailed {
            reason: "Failed to capture stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| WorkerError::SpawnFailed {
            reason: "Failed to capture stdout".to_string(),
        })?;

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(STDIN_QUEUE);
        tokio::spawn(write_stdin(
            config.session_id.clone(),
            stdin,
            stdin_rx,
            events.clone(),
        ));

        let stdout_task = tokio::spawn(read_stdout(
            config.session_id.clone(),
            stdout,
            events.clone(),
        ));

        if let Some(stderr) = child.stderr.take() {
            let sid = config.session_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(session_id = %sid, "worker stderr: {}", line);
                }
                debug!(session_id = %sid, "stderr reader finished");
            });
        }

        let (terminate_tx, terminate_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(supervise(
            config.session_id,
            child,
            terminate_rx,
            exit_tx,
            events,
            stdout_task,
            self.terminate_grace,
        ));

        Ok(WorkerHandle {
            pid,
            stdin_tx,
            terminate_tx: Mutex::new(Some(terminate_tx)),
            exit_rx,
        })
    }
}

/// Whether a worker-side variable is reserved for the hosting runtime.
pub fn is_reserved_env_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    RESERVED_ENV_KEYS.contains(&upper.as_str()) || upper.starts_with(RESERVED_ENV_PREFIX)
}

async fn write_stdin(
    session_id: String,
    mut stdin: ChildStdin,
    mut lines: mpsc::Receiver<String>,
    events: mpsc::Sender<WorkerEvent>,
) {
    while let Some(line) = lines.recv().await {
        let result = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(session_id = %session_id, error = %e, "Failed to write to worker stdin");
            let _ = events.send(WorkerEvent::InputFailed(e.to_string())).await;
            break;
        }
    }
    debug!(session_id = %session_id, "stdin writer finished");
}

async fn read_stdout(session_id: String, mut stdout: ChildStdout, events: mpsc::Sender<WorkerEvent>) {
    let mut buf = vec![0u8; STDOUT_CHUNK_BYTES];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if events.send(WorkerEvent::Stdout(buf[..n].to_vec())).await.is_err() {
                    debug!(session_id = %session_id, "worker event channel closed");
                    break;
                }
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to read worker stdout");
                break;
            }
        }
    }
    debug!(session_id = %session_id, "stdout reader finished");
}

async fn supervise(
    session_id: String,
    mut child: Child,
    mut terminate_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<WorkerExit>>,
    events: mpsc::Sender<WorkerEvent>,
    stdout_task: JoinHandle<()>,
    grace: Duration,
) {
    let exit = tokio::select! {
        status = child.wait() => {
            let code = status.ok().and_then(|s| s.code());
            info!(session_id = %session_id, ?code, "Worker exited");
            WorkerExit { code, forced: false }
        }
        // A dropped handle counts as a termination request.
        _ = &mut terminate_rx => stop_child(&session_id, &mut child, grace).await,
    };

    // Grandchildren may keep the pipe open, so the drain is bounded.
    let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, stdout_task).await;

    let _ = exit_tx.send(Some(exit));
    let _ = events.send(WorkerEvent::Exited(exit)).await;
}

async fn stop_child(session_id: &str, child: &mut Child, grace: Duration) -> WorkerExit {
    if let Ok(Some(status)) = child.try_wait() {
        return WorkerExit {
            code: status.code(),
            forced: false,
        };
    }

    debug!(session_id, pid = ?child.id(), "Terminating worker");
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        signal_group(pid, libc::SIGTERM);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(session_id, ?status, "Worker exited gracefully");
            WorkerExit {
                code: status.code(),
                forced: false,
            }
        }
        Ok(Err(e)) => {
            warn!(session_id, error = %e, "Error waiting for worker");
            force_kill(child).await;
            WorkerExit {
                code: None,
                forced: true,
            }
        }
        Err(_) => {
            warn!(session_id, "Timeout waiting for graceful shutdown, killing");
            force_kill(child).await;
            WorkerExit {
                code: None,
                forced: true,
            }
        }
    }
}

async fn force_kill(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        signal_group(pid, libc::SIGKILL);
    }
    child.kill().await.ok();
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: the group id comes from our own Child, spawned with
    // process_group(0), so the group leader pid equals the group id.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(-pgid, signal) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        debug!(pid, signal, error = %err, "Failed to signal worker process group");
    }
}

/// Errors from worker operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {reason}")]
    SpawnFailed { reason: String },

    #[error("Worker input channel closed")]
    InputClosed,

    #[error("Worker input queue is full")]
    InputBusy,
}

impl From<WorkerError> for pipegate_core::Error {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::SpawnFailed { reason } => Self::Spawn(reason),
            WorkerError::InputClosed | WorkerError::InputBusy => {
                Self::SessionUnavailable(err.to_string())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn manager() -> WorkerManager {
        WorkerManager::with_base_env(
            Duration::from_secs(2),
            vec![("PATH".into(), "/usr/bin:/bin".into())],
        )
    }

    fn spawn_config(command: &str) -> SpawnConfig {
        SpawnConfig {
            session_id: "test".into(),
            command: command.into(),
            env: HashMap::new(),
        }
    }

    async fn collect_stdout(events: &mut mpsc::Receiver<WorkerEvent>) -> (String, WorkerExit) {
        let mut out = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("worker event timeout")
            {
                Some(WorkerEvent::Stdout(chunk)) => out.extend(chunk),
                Some(WorkerEvent::Exited(exit)) => {
                    return (String::from_utf8(out).unwrap(), exit);
                }
                Some(WorkerEvent::InputFailed(e)) => panic!("unexpected input failure: {e}"),
                None => panic!("event channel closed before exit"),
            }
        }
    }

    #[test]
    fn overrides_cannot_touch_reserved_keys() {
        let mgr = manager();
        let overrides: HashMap<String, String> = [
            ("PATH".to_string(), "/evil".to_string()),
            ("PIPEGATE_AUTH_TOKEN".to_string(), "x".to_string()),
            ("API_KEY".to_string(), "k".to_string()),
        ]
        .into_iter()
        .collect();

        let env = mgr.build_env(&overrides);
        assert_eq!(env["PATH"], "/usr/bin:/bin");
        assert_eq!(env["API_KEY"], "k");
        assert!(!env.contains_key("PIPEGATE_AUTH_TOKEN"));
    }

    #[tokio::test]
    async fn echoes_stdin_to_stdout() {
        let mgr = manager();
        let (tx, mut rx) = mpsc::channel(16);
        let handle = mgr.spawn(spawn_config("head -n 1"), tx).unwrap();
        assert_eq!(mgr.spawned_count(), 1);

        handle.send("{\"hello\":1}\n".into()).await.unwrap();
        let (out, exit) = collect_stdout(&mut rx).await;
        assert_eq!(out, "{\"hello\":1}\n");
        assert_eq!(exit.code, Some(0));
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn worker_sees_overrides_and_restricted_env() {
        let mgr = manager();
        let (tx, mut rx) = mpsc::channel(16);
        let mut config = spawn_config("printf '%s|%s' \"$GREETING\" \"${SECRET_HOME_VAR:-unset}\"");
        config.env.insert("GREETING".into(), "hi".into());

        let _handle = mgr.spawn(config, tx).unwrap();
        let (out, _) = collect_stdout(&mut rx).await;
        assert_eq!(out, "hi|unset");
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let mgr = manager();
        let (tx, _rx) = mpsc::channel(16);
        let handle = mgr.spawn(spawn_config("sleep 30"), tx).unwrap();
        assert!(!handle.has_exited());

        let first = handle.terminate().await.unwrap();
        assert!(!first.forced);
        let second = handle.terminate().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn stubborn_worker_is_force_killed() {
        let mgr = WorkerManager::with_base_env(
            Duration::from_millis(200),
            vec![("PATH".into(), "/usr/bin:/bin".into())],
        );
        let (tx, _rx) = mpsc::channel(16);
        let handle = mgr
            .spawn(spawn_config("trap '' TERM; while :; do sleep 1; done"), tx)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let exit = handle.terminate().await.unwrap();
        assert!(exit.forced);
    }

    #[tokio::test]
    async fn try_send_reports_busy_when_worker_stops_reading() {
        let mgr = manager();
        let (tx, _rx) = mpsc::channel(16);
        let handle = mgr.spawn(spawn_config("sleep 30"), tx).unwrap();

        let line = format!("\"{}\"\n", "x".repeat(60 * 1024));
        let mut busy = None;
        for attempt in 0..200 {
            match handle.try_send(line.clone()) {
                Ok(()) => tokio::task::yield_now().await,
                Err(e) => {
                    busy = Some((attempt, e));
                    break;
                }
            }
        }
        let (attempt, err) = busy.expect("stdin queue never filled");
        assert!(matches!(err, WorkerError::InputBusy), "{err:?}");
        assert!(attempt >= STDIN_QUEUE);
        assert!(!handle.has_exited());

        handle.terminate().await;
        assert!(handle.try_send("{}\n".into()).is_err());
    }

    #[tokio::test]
    async fn closed_stdin_reports_input_failure() {
        let mgr = manager();
        let (tx, mut rx) = mpsc::channel(16);
        let handle = mgr.spawn(spawn_config("exec 0<&-; sleep 5"), tx).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The first write may land in the pipe buffer; keep writing until the
        // broken pipe surfaces.
        let mut failed = false;
        for _ in 0..50 {
            if handle.send("{}\n".into()).await.is_err() {
                failed = true;
                break;
            }
            if let Ok(Some(WorkerEvent::InputFailed(_))) =
                tokio::time::timeout(Duration::from_millis(50), rx.recv()).await
            {
                failed = true;
                break;
            }
        }
        assert!(failed, "write to closed stdin never failed");
        handle.terminate().await;
    }
}
