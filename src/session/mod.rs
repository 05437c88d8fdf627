//! The Session aggregate: one interpreter sandbox, owned by a single
//! dedicated task (the "serializer") that drains a command queue and is the
//! only thing in the process allowed to touch the underlying
//! `InterpreterHandle`.
//!
//! Modeled on the command-channel / single-owner-task shape of
//! `PiSessionCommand` and `command_processor_task` in
//! `oqto::runner::pi_manager`: every operation a `Session` exposes becomes a
//! message sent down an `mpsc::Sender<SessionOp>`, answered through a
//! bundled `oneshot::Sender`. The serializer task processes one op at a
//! time, which is what guarantees executions within a session never
//! overlap, for free.

pub mod model;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::info;

use crate::engine::{self, ExecutionResult};
use crate::error::{CesError, CesResult};
use crate::interpreter::InterpreterHandle;
use crate::protocol::{Directive, Payload, RawMessage};
use crate::stream_hub::StreamHub;

pub use model::{Extension, SessionId, SessionInfo, SessionStatus};

/// Bound on the serializer's inbox. Callers backpressure (via the bounded
/// channel's `send().await`) rather than the queue growing without limit.
const OP_QUEUE_CAPACITY: usize = 64;

/// How long the serializer waits for a non-execution directive (extension
/// load, variable update, interrupt ack) to return to idle.
const DIRECTIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// State shared between the `Session` handle and its serializer task.
struct Shared {
    status: RwLock<SessionStatus>,
    last_activity_at: RwLock<chrono::DateTime<Utc>>,
    execution_count: AtomicU64,
    extensions: RwLock<Vec<Extension>>,
}

/// One operation the serializer task can be asked to perform. Each variant
/// carries its own reply channel(s); the serializer never replies out of
/// band.
enum SessionOp {
    LoadExtension {
        name: String,
        source: String,
        config: HashMap<String, String>,
        resp: oneshot::Sender<CesResult<()>>,
    },
    Execute {
        exec_id: String,
        code: String,
        index: u64,
        exec_timeout: Duration,
        hub: Arc<StreamHub>,
        /// Fires as soon as the op is popped off the queue, before the
        /// round-trip runs, so an admitted-but-not-finished execution can
        /// already be streamed from.
        admitted: oneshot::Sender<()>,
        done: oneshot::Sender<CesResult<ExecutionResult>>,
    },
    UpdateVariables {
        bindings: HashMap<String, String>,
        resp: oneshot::Sender<CesResult<()>>,
    },
    Interrupt {
        resp: oneshot::Sender<CesResult<()>>,
    },
}

/// A running sandbox: one interpreter subprocess, its registered extensions,
/// and the execution history's Stream Hubs.
pub struct Session {
    pub id: SessionId,
    pub created_at: chrono::DateTime<Utc>,
    pub cwd: PathBuf,
    shared: Arc<Shared>,
    used_exec_ids: Mutex<HashSet<String>>,
    hubs: RwLock<HashMap<String, Arc<StreamHub>>>,
    op_tx: mpsc::Sender<SessionOp>,
    /// Out-of-band stop signal, kept separate from `op_tx` so a `stop()`
    /// call can preempt an execution the serializer is already awaiting
    /// instead of queuing up behind it.
    stop_tx: Mutex<Option<oneshot::Sender<oneshot::Sender<()>>>>,
}

impl Session {
    /// Spawn the interpreter and its serializer task, blocking until the
    /// interpreter has completed its readiness handshake.
    pub async fn start(
        id: SessionId,
        cwd: PathBuf,
        interpreter_command: &str,
        interpreter_args: &[String],
        startup_timeout: Duration,
    ) -> CesResult<Self> {
        tokio::fs::create_dir_all(&cwd)
            .await
            .map_err(|e| CesError::StartupFailed(format!("failed to create session cwd: {e}")))?;

        let handle = InterpreterHandle::start(
            interpreter_command,
            interpreter_args,
            &cwd,
            &id,
            startup_timeout,
        )
        .await?;

        let shared = Arc::new(Shared {
            status: RwLock::new(SessionStatus::Running),
            last_activity_at: RwLock::new(Utc::now()),
            execution_count: AtomicU64::new(0),
            extensions: RwLock::new(Vec::new()),
        });

        let (op_tx, op_rx) = mpsc::channel(OP_QUEUE_CAPACITY);
        let (stop_tx, stop_rx) = oneshot::channel();
        let serializer_shared = shared.clone();
        let serializer_id = id.clone();
        let serializer_cwd = cwd.clone();
        tokio::spawn(async move {
            run_serializer(serializer_id, serializer_cwd, handle, op_rx, stop_rx, serializer_shared).await;
        });

        Ok(Self {
            id,
            created_at: Utc::now(),
            cwd,
            shared,
            used_exec_ids: Mutex::new(HashSet::new()),
            hubs: RwLock::new(HashMap::new()),
            op_tx,
            stop_tx: Mutex::new(Some(stop_tx)),
        })
    }

    pub async fn status(&self) -> SessionStatus {
        *self.shared.status.read().await
    }

    pub async fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            created_at: self.created_at,
            last_activity_at: *self.shared.last_activity_at.read().await,
            execution_count: self.shared.execution_count.load(Ordering::SeqCst),
            status: *self.shared.status.read().await,
        }
    }

    pub async fn extensions(&self) -> Vec<Extension> {
        self.shared.extensions.read().await.clone()
    }

    /// Register and load an extension. Rejects a name already registered,
    /// since extensions are immutable once loaded.
    pub async fn load_extension(
        &self,
        name: String,
        source: String,
        config: HashMap<String, String>,
    ) -> CesResult<()> {
        self.reject_if_stopped().await?;
        {
            let existing = self.shared.extensions.read().await;
            if existing.iter().any(|e| e.name == name) {
                return Err(CesError::AlreadyExists(format!(
                    "extension already registered: {name}"
                )));
            }
        }
        let (resp_tx, resp_rx) = oneshot::channel();
        self.op_tx
            .send(SessionOp::LoadExtension {
                name,
                source,
                config,
                resp: resp_tx,
            })
            .await
            .map_err(|_| CesError::Internal("session serializer is gone".to_string()))?;
        self.touch().await;
        resp_rx
            .await
            .map_err(|_| CesError::Internal("session serializer dropped the reply".to_string()))?
    }

    /// Begin an execution. Returns the `StreamHub` as soon as the op has been
    /// admitted to the serializer (not when it completes), so HTTP callers
    /// that only need `{exec_id, stream_url}` don't block on the full
    /// round-trip. The execution itself still runs strictly after every
    /// earlier op and strictly before every later one.
    pub async fn begin_execute(
        &self,
        exec_id: String,
        code: String,
        exec_timeout: Duration,
    ) -> CesResult<(Arc<StreamHub>, oneshot::Receiver<CesResult<ExecutionResult>>)> {
        self.reject_if_stopped().await?;
        {
            let mut used = self.used_exec_ids.lock().expect("used_exec_ids poisoned");
            if !used.insert(exec_id.clone()) {
                return Err(CesError::DuplicateExecution(exec_id));
            }
        }

        let index = self.shared.execution_count.fetch_add(1, Ordering::SeqCst);
        let hub = Arc::new(StreamHub::new());
        self.hubs.write().await.insert(exec_id.clone(), hub.clone());

        let (admitted_tx, admitted_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        self.op_tx
            .send(SessionOp::Execute {
                exec_id,
                code,
                index,
                exec_timeout,
                hub: hub.clone(),
                admitted: admitted_tx,
                done: done_tx,
            })
            .await
            .map_err(|_| CesError::Internal("session serializer is gone".to_string()))?;
        self.touch().await;

        admitted_rx
            .await
            .map_err(|_| CesError::Internal("session serializer dropped the reply".to_string()))?;
        Ok((hub, done_rx))
    }

    /// Run an execution to completion and return its result, for callers
    /// that don't need a live stream (`stream=false`).
    pub async fn execute(
        &self,
        exec_id: String,
        code: String,
        exec_timeout: Duration,
    ) -> CesResult<ExecutionResult> {
        let (_hub, done_rx) = self.begin_execute(exec_id, code, exec_timeout).await?;
        done_rx
            .await
            .map_err(|_| CesError::Internal("session serializer dropped the reply".to_string()))?
    }

    /// Fetch the Stream Hub for a previously started execution, for the SSE
    /// endpoint to subscribe to.
    pub async fn hub_for(&self, exec_id: &str) -> Option<Arc<StreamHub>> {
        self.hubs.read().await.get(exec_id).cloned()
    }

    pub async fn update_variables(&self, bindings: HashMap<String, String>) -> CesResult<()> {
        self.reject_if_stopped().await?;
        let (resp_tx, resp_rx) = oneshot::channel();
        self.op_tx
            .send(SessionOp::UpdateVariables { bindings, resp: resp_tx })
            .await
            .map_err(|_| CesError::Internal("session serializer is gone".to_string()))?;
        self.touch().await;
        resp_rx
            .await
            .map_err(|_| CesError::Internal("session serializer dropped the reply".to_string()))?
    }

    pub async fn interrupt(&self) -> CesResult<()> {
        self.reject_if_stopped().await?;
        let (resp_tx, resp_rx) = oneshot::channel();
        self.op_tx
            .send(SessionOp::Interrupt { resp: resp_tx })
            .await
            .map_err(|_| CesError::Internal("session serializer is gone".to_string()))?;
        resp_rx
            .await
            .map_err(|_| CesError::Internal("session serializer dropped the reply".to_string()))?
    }

    /// Orderly shutdown: signals the serializer to kill the interpreter and
    /// exit, waits for it to acknowledge, then best-effort removes the
    /// session's cwd. Idempotent.
    pub async fn stop(&self) {
        {
            let mut status = self.shared.status.write().await;
            if *status == SessionStatus::Stopped {
                return;
            }
            *status = SessionStatus::Stopping;
        }

        let stop_tx = self.stop_tx.lock().expect("stop_tx poisoned").take();
        if let Some(stop_tx) = stop_tx {
            let (ack_tx, ack_rx) = oneshot::channel();
            if stop_tx.send(ack_tx).is_ok() {
                let _ = ack_rx.await;
            }
        }

        let _ = tokio::fs::remove_dir_all(&self.cwd).await;
        *self.shared.status.write().await = SessionStatus::Stopped;
    }

    async fn reject_if_stopped(&self) -> CesResult<()> {
        match *self.shared.status.read().await {
            SessionStatus::Stopped | SessionStatus::Stopping => {
                Err(CesError::SessionStopped(self.id.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn touch(&self) {
        *self.shared.last_activity_at.write().await = Utc::now();
    }
}

/// The serializer task body: the only place in the process that calls into
/// an `InterpreterHandle`.
///
/// `stop_rx` is raced against the op queue while idle, and handed to
/// `engine::execute` for the duration of an `Execute` op so a stop request
/// preempts a long-running (or hung) execution instead of sitting queued
/// behind it until that execution's own timeout.
async fn run_serializer(
    session_id: String,
    cwd: PathBuf,
    mut handle: InterpreterHandle,
    mut op_rx: mpsc::Receiver<SessionOp>,
    mut stop_rx: oneshot::Receiver<oneshot::Sender<()>>,
    shared: Arc<Shared>,
) {
    loop {
        tokio::select! {
            biased;
            stop_ack = &mut stop_rx => {
                handle.kill(crate::interpreter::DEFAULT_KILL_GRACE).await;
                if let Ok(ack) = stop_ack {
                    let _ = ack.send(());
                }
                break;
            }
            maybe_op = op_rx.recv() => {
                let Some(op) = maybe_op else { break };
                match op {
                    SessionOp::LoadExtension { name, source, config, resp } => {
                        let result = async {
                            handle
                                .submit(&Payload::Directive(Directive::ExtRegister {
                                    name: name.clone(),
                                    source: source.clone(),
                                }))
                                .await?;
                            await_idle_or_error(&mut handle).await?;
                            handle
                                .submit(&Payload::Directive(Directive::ExtLoad {
                                    name: name.clone(),
                                    config: config.clone(),
                                }))
                                .await?;
                            await_idle_or_error(&mut handle).await
                        }
                        .await
                        // A directive error here means the extension itself is
                        // bad (syntax error, failed init, ...), not that the
                        // service is unhealthy, so it surfaces as a client error.
                        .map_err(|e| match e {
                            CesError::StartupFailed(message) => CesError::BadRequest(message),
                            other => other,
                        });
                        if result.is_ok() {
                            shared.extensions.write().await.push(Extension {
                                name,
                                source_code: source,
                                config,
                            });
                        }
                        let _ = resp.send(result);
                    }
                    SessionOp::Execute {
                        exec_id,
                        code,
                        index,
                        exec_timeout,
                        hub,
                        admitted,
                        done,
                    } => {
                        let _ = admitted.send(());
                        let result = engine::execute(
                            &mut handle,
                            &hub,
                            &cwd,
                            &exec_id,
                            index,
                            &code,
                            exec_timeout,
                            &mut stop_rx,
                        )
                        .await;
                        // `execute` itself races every interpreter round trip
                        // against `stop_rx`, killing the interpreter and
                        // acknowledging the stop request the moment one
                        // arrives rather than after this whole call returns.
                        let interpreter_gone = handle.is_exited();
                        let _ = done.send(result);
                        if interpreter_gone {
                            *shared.status.write().await = SessionStatus::Stopped;
                            info!(session_id, "interpreter exited during execution, session stopped");
                            return;
                        }
                    }
                    SessionOp::UpdateVariables { bindings, resp } => {
                        let result = async {
                            handle
                                .submit(&Payload::Directive(Directive::VarUpdate { bindings }))
                                .await?;
                            await_idle_or_error(&mut handle).await
                        }
                        .await;
                        let _ = resp.send(result);
                    }
                    SessionOp::Interrupt { resp } => {
                        let result = async {
                            handle.submit(&Payload::Directive(Directive::Interrupt)).await?;
                            await_idle_or_error(&mut handle).await
                        }
                        .await;
                        let _ = resp.send(result);
                    }
                }
            }
        }
    }
    info!(session_id, "session serializer exiting");
}

async fn await_idle_or_error(handle: &mut InterpreterHandle) -> CesResult<()> {
    loop {
        match handle.next_event(DIRECTIVE_TIMEOUT).await {
            Ok(msg) if msg.is_idle() => return Ok(()),
            Ok(RawMessage::Error { message }) => return Err(CesError::StartupFailed(message)),
            Ok(_) => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn fixture_path() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures")
            .join("fake_interpreter.sh")
    }

    async fn start_session(id: &str, dir: &std::path::Path) -> Session {
        Session::start(
            id.to_string(),
            dir.to_path_buf(),
            "sh",
            &[fixture_path().to_string_lossy().to_string()],
            StdDuration::from_secs(5),
        )
        .await
        .expect("fixture session should start")
    }

    #[tokio::test]
    async fn duplicate_exec_id_is_rejected_without_touching_the_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let session = start_session("sess-a", dir.path()).await;

        let result = session
            .execute("e1".to_string(), "x = 1".to_string(), StdDuration::from_secs(5))
            .await
            .unwrap();
        assert!(result.success);

        let dup = session
            .execute("e1".to_string(), "x = 2".to_string(), StdDuration::from_secs(5))
            .await;
        assert!(matches!(dup, Err(CesError::DuplicateExecution(_))));
        session.stop().await;
    }

    #[tokio::test]
    async fn executions_are_serialized_and_info_reflects_activity() {
        let dir = tempfile::tempdir().unwrap();
        let session = start_session("sess-b", dir.path()).await;

        session
            .execute("e1".to_string(), "x = 1".to_string(), StdDuration::from_secs(5))
            .await
            .unwrap();
        session
            .execute("e2".to_string(), "x = 2".to_string(), StdDuration::from_secs(5))
            .await
            .unwrap();

        let info = session.info().await;
        assert_eq!(info.execution_count, 2);
        assert_eq!(info.status, SessionStatus::Running);
        session.stop().await;
        assert_eq!(session.status().await, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn operations_are_rejected_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let session = start_session("sess-c", dir.path()).await;
        session.stop().await;

        let result = session
            .execute("e1".to_string(), "x = 1".to_string(), StdDuration::from_secs(5))
            .await;
        assert!(matches!(result, Err(CesError::SessionStopped(_))));
    }
}
