//! The Session Manager: process-wide registry mapping session id to a live
//! `Session`, plus the idle sweep that reclaims abandoned ones.
//!
//! The registry is a `DashMap`, the same structure `oqto::ws::hub::WsHub`
//! uses for its connection map. The create-time TOCTOU race this guards
//! against (two callers both miss the registry and each spawn an interpreter
//! for the same id) is the same one `PiSessionManager::get_or_create_session`
//! calls out by name in `oqto/src/runner/pi_manager.rs`; the fix here is the
//! same `creating: Mutex<HashSet<SessionId>>` guard.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{CesError, CesResult};
use crate::session::{Session, SessionId, SessionInfo};

/// Configuration the manager needs to start new sessions and run its sweep.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub workspace_root: PathBuf,
    pub interpreter_command: String,
    pub interpreter_args: Vec<String>,
    pub startup_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub sweep_interval: Duration,
}

/// Owns every live `Session` in the process.
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<Session>>,
    creating: Mutex<HashSet<SessionId>>,
    config: ManagerConfig,
}

impl SessionManager {
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            creating: Mutex::new(HashSet::new()),
            config,
        })
    }

    /// Spawn the idle-sweep background task. The returned handle is detached;
    /// it stops when the manager (and thus this `Arc`) has no other owners
    /// and the weak upgrade starts failing — callers that want deterministic
    /// shutdown should call `shutdown()` instead of dropping the manager.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match manager.upgrade() {
                    Some(manager) => manager.sweep().await,
                    None => return,
                }
            }
        })
    }

    /// Allocate a session id (if not supplied), create its cwd, and start its
    /// interpreter. Rolls back the cwd on startup failure.
    pub async fn create(&self, session_id: Option<String>) -> CesResult<Arc<Session>> {
        let id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        if self.sessions.contains_key(&id) {
            return Err(CesError::AlreadyExists(id));
        }
        {
            let mut creating = self.creating.lock().await;
            if creating.contains(&id) || self.sessions.contains_key(&id) {
                return Err(CesError::AlreadyExists(id));
            }
            creating.insert(id.clone());
        }

        let result = async {
            let cwd = self.config.workspace_root.join(&id);
            let session = Session::start(
                id.clone(),
                cwd.clone(),
                &self.config.interpreter_command,
                &self.config.interpreter_args,
                self.config.startup_timeout,
            )
            .await;
            match session {
                Ok(session) => Ok(session),
                Err(e) => {
                    if tokio::fs::remove_dir_all(&cwd).await.is_err() {
                        warn!(session_id = %id, "failed to roll back session cwd after startup failure");
                    }
                    Err(e)
                }
            }
        }
        .await;

        {
            let mut creating = self.creating.lock().await;
            creating.remove(&id);
        }

        let session = Arc::new(result?);
        self.sessions.insert(id.clone(), session.clone());
        info!(session_id = %id, "session created");
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> CesResult<Arc<Session>> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| CesError::NotFound(session_id.to_string()))
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos
    }

    /// Stop a session's interpreter and remove it from the registry.
    pub async fn delete(&self, session_id: &str) -> CesResult<()> {
        let session = self.get(session_id)?;
        session.stop().await;
        self.sessions.remove(session_id);
        info!(session_id, "session deleted");
        Ok(())
    }

    /// Stop every session whose `last_activity_at` is older than the
    /// configured idle timeout. A `None` timeout disables sweeping.
    pub async fn sweep(&self) {
        let Some(idle_timeout) = self.config.idle_timeout else {
            return;
        };
        let now = chrono::Utc::now();
        let stale: Vec<SessionId> = {
            let mut ids = Vec::new();
            for entry in self.sessions.iter() {
                let info = entry.value().info().await;
                let idle_for = now.signed_duration_since(info.last_activity_at);
                if idle_for
                    .to_std()
                    .map(|d| d > idle_timeout)
                    .unwrap_or(false)
                {
                    ids.push(entry.key().clone());
                }
            }
            ids
        };
        for id in stale {
            info!(session_id = %id, "sweeping idle session");
            if let Err(e) = self.delete(&id).await {
                warn!(session_id = %id, error = %e, "failed to sweep idle session");
            }
        }
    }

    /// Stop every session in parallel, within a bounded deadline per session.
    pub async fn shutdown(&self, per_session_deadline: Duration) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let stops = ids.into_iter().map(|id| async move {
            if let Some((_, session)) = self.sessions.remove(&id) {
                if tokio::time::timeout(per_session_deadline, session.stop())
                    .await
                    .is_err()
                {
                    warn!(session_id = %id, "session did not stop within shutdown deadline");
                }
            }
        });
        futures::future::join_all(stops).await;
        info!("session manager shut down");
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
