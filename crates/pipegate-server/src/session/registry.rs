//! In-memory registry of live sessions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use pipegate_core::{Error, Result};

use super::Session;

/// Thread-safe map from session id to session.
///
/// The registry is the single owner of session lookup; removal is the
/// linearization point for teardown, so at most one caller wins it.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session if its id is free and fewer than `max_sessions`
    /// sessions are live.
    pub async fn insert(&self, session: Arc<Session>, max_sessions: usize) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(Error::Internal(format!(
                "duplicate session id {}",
                session.id
            )));
        }
        if sessions.len() >= max_sessions {
            return Err(Error::SessionUnavailable(format!(
                "session limit of {max_sessions} reached"
            )));
        }
        info!(session_id = %session.id, command = %session.command, "Session registered");
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    /// Remove a session. Returns `None` if another caller already removed it.
    pub async fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(session_id);
        if removed.is_some() {
            debug!(session_id, "Session unregistered");
        }
        removed
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Ids of all live sessions at the time of the call.
    pub async fn snapshot_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Live sessions at the time of the call.
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::worker::{SpawnConfig, WorkerManager};

    fn session(manager: &WorkerManager, id: &str) -> Arc<Session> {
        let (events_tx, _events_rx) = mpsc::channel(4);
        let worker = manager
            .spawn(
                SpawnConfig {
                    session_id: id.to_string(),
                    command: "cat".to_string(),
                    env: HashMap::new(),
                },
                events_tx,
            )
            .unwrap();
        let (stream_tx, _stream_rx) = mpsc::channel(4);
        Arc::new(Session::new(
            id.to_string(),
            "cat".to_string(),
            HashMap::new(),
            worker,
            stream_tx,
        ))
    }

    fn manager() -> WorkerManager {
        WorkerManager::with_base_env(
            Duration::from_secs(1),
            vec![("PATH".into(), "/usr/bin:/bin".into())],
        )
    }

    #[tokio::test]
    async fn insert_get_remove() {
        let mgr = manager();
        let registry = SessionRegistry::new();
        let s = session(&mgr, "a");
        registry.insert(Arc::clone(&s), 10).await.unwrap();

        assert!(registry.contains("a").await);
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get("a").await.unwrap().id, "a");

        assert!(registry.remove("a").await.is_some());
        assert!(registry.remove("a").await.is_none());
        assert!(registry.is_empty().await);
        s.worker.terminate().await;
    }

    #[tokio::test]
    async fn rejects_duplicates_and_overflow() {
        let mgr = manager();
        let registry = SessionRegistry::new();
        let a = session(&mgr, "a");
        let b = session(&mgr, "b");

        registry.insert(Arc::clone(&a), 1).await.unwrap();
        assert!(registry.insert(Arc::clone(&a), 10).await.is_err());

        let err = registry.insert(Arc::clone(&b), 1).await.unwrap_err();
        assert_eq!(err.kind(), pipegate_core::ErrorKind::SessionUnavailable);
        assert_eq!(registry.snapshot_ids().await, vec!["a".to_string()]);

        a.worker.terminate().await;
        b.worker.terminate().await;
    }
}
