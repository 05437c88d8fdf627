//! The Interpreter Handle: a thin supervisor around one interpreter
//! subprocess, speaking the newline-delimited control protocol defined in
//! `crate::protocol`.
//!
//! Modeled on the reader-task / command-channel split in
//! `oqto::runner::pi_manager` (`stdout_reader_task` feeding an mpsc channel
//! consumed by the owning task), generalized from Pi's JSON-RPC framing to
//! the CES control protocol.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{CesError, CesResult};
use crate::protocol::{Directive, Payload, RawMessage};

/// Default time to wait for the interpreter's first idle status.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default grace period between orderly and forced shutdown.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// An event read off the interpreter's output channels.
#[derive(Debug)]
enum HandleEvent {
    Message(RawMessage),
    /// The process exited (stdout closed / wait() resolved) before the
    /// handle asked it to.
    ProcessExited,
}

/// Supervises one interpreter subprocess.
///
/// `InterpreterHandle` is exclusively owned by its `Session`; all access goes
/// through the session's serializer, so the handle itself does not need
/// internal locking beyond the exited flag (read from the reader tasks,
/// written once).
pub struct InterpreterHandle {
    child: Child,
    stdin: Option<ChildStdin>,
    events_rx: mpsc::UnboundedReceiver<HandleEvent>,
    exited: Arc<AtomicBool>,
    pid: Option<u32>,
}

impl InterpreterHandle {
    /// Launch the interpreter, wait for its readiness handshake, and install
    /// the control adapter via `session-init`.
    ///
    /// `command` and `args` select the interpreter binary (configurable so
    /// tests can point at a scripted fixture instead of a real interpreter).
    pub async fn start(
        command: &str,
        args: &[String],
        workdir: &Path,
        session_id: &str,
        startup_timeout: Duration,
    ) -> CesResult<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            CesError::StartupFailed(format!("failed to spawn interpreter: {e}"))
        })?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CesError::StartupFailed("no stdin handle".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CesError::StartupFailed("no stdout handle".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CesError::StartupFailed("no stderr handle".to_string()))?;

        let exited = Arc::new(AtomicBool::new(false));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        spawn_stdout_reader(stdout, events_tx.clone(), exited.clone());
        spawn_stderr_reader(stderr, events_tx.clone());

        let mut handle = Self {
            child,
            stdin: Some(stdin),
            events_rx,
            exited,
            pid,
        };

        // Wait for the interpreter's first idle status before we trust it
        // enough to send the bootstrap directive.
        handle.await_idle(startup_timeout).await.map_err(|e| {
            CesError::StartupFailed(format!("interpreter did not become ready: {e}"))
        })?;

        handle
            .submit(&Payload::Directive(Directive::SessionInit {
                session_id: session_id.to_string(),
                cwd: workdir.to_string_lossy().to_string(),
            }))
            .await?;
        handle.await_idle(startup_timeout).await.map_err(|e| {
            CesError::StartupFailed(format!("session-init did not complete: {e}"))
        })?;

        Ok(handle)
    }

    /// The interpreter's OS process id, if it was obtained at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// True once the handle has observed the interpreter's output channel
    /// close, or the handle killed it.
    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Write a payload (code or directive) to the interpreter's stdin.
    pub async fn submit(&mut self, payload: &Payload) -> CesResult<()> {
        if self.is_exited() {
            return Err(CesError::PeerGone(
                "interpreter already exited".to_string(),
            ));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| CesError::PeerGone("interpreter stdin already closed".to_string()))?;
        let line = payload.to_line();
        stdin.write_all(line.as_bytes()).await.map_err(|e| {
            self.exited.store(true, Ordering::SeqCst);
            CesError::PeerGone(format!("failed to write to interpreter stdin: {e}"))
        })?;
        stdin.flush().await.map_err(|e| {
            self.exited.store(true, Ordering::SeqCst);
            CesError::PeerGone(format!("failed to flush interpreter stdin: {e}"))
        })?;
        Ok(())
    }

    /// Read the next structured message from the interpreter's output,
    /// failing with `Timeout` if `deadline` elapses first or `PeerGone` if
    /// the process has exited.
    pub async fn next_event(&mut self, deadline: Duration) -> CesResult<RawMessage> {
        match timeout(deadline, self.events_rx.recv()).await {
            Ok(Some(HandleEvent::Message(msg))) => Ok(msg),
            Ok(Some(HandleEvent::ProcessExited)) | Ok(None) => {
                self.exited.store(true, Ordering::SeqCst);
                Err(CesError::PeerGone(
                    "interpreter output channel closed".to_string(),
                ))
            }
            Err(_) => Err(CesError::Timeout(
                "timed out waiting for interpreter output".to_string(),
            )),
        }
    }

    /// Block until a `Status { state: "idle" }` message arrives.
    async fn await_idle(&mut self, deadline: Duration) -> CesResult<()> {
        let start = tokio::time::Instant::now();
        loop {
            let remaining = deadline
                .checked_sub(start.elapsed())
                .unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                return Err(CesError::Timeout("idle wait exceeded deadline".to_string()));
            }
            let msg = self.next_event(remaining).await?;
            if msg.is_idle() {
                return Ok(());
            }
        }
    }

    /// Orderly shutdown, escalating to a forced kill after `grace_period`.
    /// Idempotent.
    pub async fn kill(&mut self, grace_period: Duration) {
        if self.is_exited() {
            let _ = self.child.start_kill();
            return;
        }
        // Closing stdin asks well-behaved interpreters to shut down; we
        // don't have a dedicated "shutdown" directive because dropping the
        // write side is universally recognized as EOF by any interpreter
        // adapter, unlike a bespoke control line.
        self.stdin.take();

        match timeout(grace_period, self.child.wait()).await {
            Ok(Ok(_)) => {
                debug!(pid = ?self.pid, "interpreter exited after orderly shutdown");
            }
            _ => {
                warn!(pid = ?self.pid, "interpreter did not exit in time, forcing kill");
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
        }
        self.exited.store(true, Ordering::SeqCst);
    }
}

fn spawn_stdout_reader(
    stdout: tokio::process::ChildStdout,
    tx: mpsc::UnboundedSender<HandleEvent>,
    exited: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match RawMessage::parse_line(&line) {
                        Ok(msg) => {
                            if tx.send(HandleEvent::Message(msg)).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(%line, error = %e, "failed to parse interpreter output line");
                        }
                    }
                }
                Ok(None) => {
                    exited.store(true, Ordering::SeqCst);
                    let _ = tx.send(HandleEvent::ProcessExited);
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "error reading interpreter stdout");
                    exited.store(true, Ordering::SeqCst);
                    let _ = tx.send(HandleEvent::ProcessExited);
                    return;
                }
            }
        }
    });
}

fn spawn_stderr_reader(
    stderr: tokio::process::ChildStderr,
    tx: mpsc::UnboundedSender<HandleEvent>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let _ = tx.send(HandleEvent::Message(RawMessage::Stderr { payload: line }));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn fixture_path() -> std::path::PathBuf {
        std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures")
            .join("fake_interpreter.sh")
    }

    #[tokio::test]
    async fn start_and_kill_round_trip_against_the_fixture() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = InterpreterHandle::start(
            "sh",
            &[fixture_path().to_string_lossy().to_string()],
            dir.path(),
            "sess-1",
            Duration::from_secs(5),
        )
        .await
        .expect("fixture interpreter should start");

        assert!(!handle.is_exited());
        handle.kill(Duration::from_secs(2)).await;
        assert!(handle.is_exited());
    }

    #[tokio::test]
    async fn next_event_times_out_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = InterpreterHandle::start(
            "sh",
            &[fixture_path().to_string_lossy().to_string()],
            dir.path(),
            "sess-2",
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let result = handle.next_event(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(CesError::Timeout(_))));
        handle.kill(Duration::from_secs(2)).await;
    }

    #[test]
    fn fixture_script_exists_and_is_executable_by_sh() {
        // Keep this as a cheap smoke test documenting the test fixture
        // contract; writes nothing.
        let path = fixture_path();
        let mut f = std::fs::File::open(&path).expect("fixture should exist");
        let mut buf = String::new();
        std::io::Read::read_to_string(&mut f, &mut buf).unwrap();
        assert!(buf.contains("channel"));
        let _ = write!(std::io::sink(), "{}", buf.len());
    }
}
