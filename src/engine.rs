//! The Execution Engine: drives one execution round-trip through the
//! control protocol, demultiplexing interpreter output into an
//! `ExecutionResult` while fanning the same events out to the Stream Hub.

use std::path::Path;
use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::warn;

use crate::error::{CesError, CesResult};
use crate::interpreter::InterpreterHandle;
use crate::protocol::{Directive, Payload, RawMessage, SurfacedVariable};
use crate::stream_hub::{OutputKind, StreamHub};

/// Grace period granted to an interpreter to return to idle after an
/// interrupt before it is killed outright.
pub const INTERRUPT_GRACE: Duration = Duration::from_secs(5);

/// A structured log line captured separately from stdout/stderr.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: String,
    pub tag: String,
    pub text: String,
}

/// A file produced by user code during an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub logical_name: String,
    pub mime_type: String,
    pub file_name: String,
}

/// The final aggregate of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub code: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub output: String,
    pub stdout_chunks: Vec<String>,
    pub stderr_chunks: Vec<String>,
    pub log_entries: Vec<LogEntry>,
    pub artifacts: Vec<Artifact>,
    pub surfaced_variables: Vec<SurfacedVariable>,
}

impl ExecutionResult {
    fn new(execution_id: &str, code: &str) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            code: code.to_string(),
            success: true,
            error_message: None,
            output: String::new(),
            stdout_chunks: Vec::new(),
            stderr_chunks: Vec::new(),
            log_entries: Vec::new(),
            artifacts: Vec::new(),
            surfaced_variables: Vec::new(),
        }
    }

    fn mark_peer_gone(&mut self, detail: &str) {
        self.success = false;
        self.error_message = Some(detail.to_string());
    }

    fn mark_timeout(&mut self) {
        self.success = false;
        self.error_message = Some("timeout".to_string());
    }
}

/// Drive one execution to completion: `pre-exec` → user code → read loop →
/// `post-exec` → terminal event. Interpreter death and timeout are folded
/// into an unsuccessful `ExecutionResult` rather than propagated as errors:
/// the service stays healthy even when the code (or its interpreter) did
/// not.
///
/// `stop_rx` carries a session-level stop request. Every interpreter
/// round trip below races against it, so a caller blocked on (or killing)
/// a hung or long-running execution is interrupted promptly rather than
/// waiting out the full execution timeout.
pub async fn execute(
    handle: &mut InterpreterHandle,
    hub: &StreamHub,
    cwd: &Path,
    exec_id: &str,
    index: u64,
    code: &str,
    exec_timeout: Duration,
    stop_rx: &mut oneshot::Receiver<oneshot::Sender<()>>,
) -> CesResult<ExecutionResult> {
    let mut result = ExecutionResult::new(exec_id, code);

    if let Err(e) = handle
        .submit(&Payload::Directive(Directive::PreExec {
            exec_id: exec_id.to_string(),
            index,
        }))
        .await
    {
        return finish_on_peer_gone(hub, &mut result, &e);
    }

    match await_idle(handle, hub, &mut result, exec_timeout, stop_rx).await {
        Ok(()) => {}
        Err(AwaitIdleError::PeerGone(e)) => return finish_on_peer_gone(hub, &mut result, &e),
        Err(AwaitIdleError::Timeout) => {
            return Err(CesError::Internal(
                "pre-exec did not return to idle: the per-session serializer invariant was violated"
                    .to_string(),
            ));
        }
        Err(AwaitIdleError::Stopped(ack)) => return finish_on_stop(handle, hub, &mut result, ack).await,
    }

    if let Err(e) = handle
        .submit(&Payload::Code {
            code: code.to_string(),
        })
        .await
    {
        return finish_on_peer_gone(hub, &mut result, &e);
    }

    let deadline = Instant::now() + exec_timeout;
    'read: loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            handle_timeout(handle, hub, &mut result).await;
            return finalize(hub, result);
        }
        tokio::select! {
            biased;
            stop_ack = &mut *stop_rx => {
                return finish_on_stop(handle, hub, &mut result, stop_ack.ok()).await;
            }
            event = handle.next_event(remaining) => {
                match event {
                    Ok(msg) => {
                        if let Some(reply) = apply_message(msg, cwd, index, &mut result, hub).await {
                            if !reply {
                                result.success = false;
                            }
                            break 'read;
                        }
                    }
                    Err(CesError::Timeout(_)) => {
                        handle_timeout(handle, hub, &mut result).await;
                        return finalize(hub, result);
                    }
                    Err(e) => return finish_on_peer_gone(hub, &mut result, &e),
                }
            }
        }
    }

    if let Err(e) = handle
        .submit(&Payload::Directive(Directive::PostExec {
            exec_id: exec_id.to_string(),
            index,
        }))
        .await
    {
        return finish_on_peer_gone(hub, &mut result, &e);
    }

    'post: loop {
        tokio::select! {
            biased;
            stop_ack = &mut *stop_rx => {
                return finish_on_stop(handle, hub, &mut result, stop_ack.ok()).await;
            }
            event = handle.next_event(exec_timeout) => {
                match event {
                    Ok(RawMessage::Status { state }) if state == "idle" => {
                        hub.publish(OutputKind::Status, serde_json::json!({ "state": "idle" }), false);
                        break 'post;
                    }
                    Ok(msg) => {
                        apply_message(msg, cwd, index, &mut result, hub).await;
                    }
                    Err(CesError::Timeout(_)) => {
                        result.mark_timeout();
                        return finalize(hub, result);
                    }
                    Err(e) => return finish_on_peer_gone(hub, &mut result, &e),
                }
            }
        }
    }

    finalize(hub, result)
}

enum AwaitIdleError {
    Timeout,
    PeerGone(CesError),
    Stopped(Option<oneshot::Sender<()>>),
}

async fn await_idle(
    handle: &mut InterpreterHandle,
    hub: &StreamHub,
    result: &mut ExecutionResult,
    deadline: Duration,
    stop_rx: &mut oneshot::Receiver<oneshot::Sender<()>>,
) -> Result<(), AwaitIdleError> {
    let start = Instant::now();
    loop {
        let remaining = deadline.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Err(AwaitIdleError::Timeout);
        }
        tokio::select! {
            biased;
            stop_ack = &mut *stop_rx => {
                return Err(AwaitIdleError::Stopped(stop_ack.ok()));
            }
            event = handle.next_event(remaining) => {
                match event {
                    Ok(RawMessage::Status { state }) if state == "idle" => {
                        hub.publish(OutputKind::Status, serde_json::json!({ "state": "idle" }), false);
                        return Ok(());
                    }
                    Ok(msg) => {
                        apply_message(msg, Path::new("."), 0, result, hub).await;
                    }
                    Err(CesError::Timeout(_)) => return Err(AwaitIdleError::Timeout),
                    Err(e) => return Err(AwaitIdleError::PeerGone(e)),
                }
            }
        }
    }
}

async fn handle_timeout(handle: &mut InterpreterHandle, hub: &StreamHub, result: &mut ExecutionResult) {
    let _ = handle.submit(&Payload::Directive(Directive::Interrupt)).await;
    match handle.next_event(INTERRUPT_GRACE).await {
        Ok(msg) if msg.is_idle() => {
            hub.publish(OutputKind::Status, serde_json::json!({ "state": "idle" }), false);
        }
        _ => {
            handle.kill(INTERRUPT_GRACE).await;
        }
    }
    result.mark_timeout();
}

fn finish_on_peer_gone(
    hub: &StreamHub,
    result: &mut ExecutionResult,
    error: &CesError,
) -> CesResult<ExecutionResult> {
    result.mark_peer_gone(&error.to_string());
    finalize(hub, result.clone())
}

/// A session stop arrived while this execution was in flight: kill the
/// interpreter, acknowledge the stop request, and finish the execution as a
/// synthetic `PeerGone`.
async fn finish_on_stop(
    handle: &mut InterpreterHandle,
    hub: &StreamHub,
    result: &mut ExecutionResult,
    ack: Option<oneshot::Sender<()>>,
) -> CesResult<ExecutionResult> {
    handle.kill(crate::interpreter::DEFAULT_KILL_GRACE).await;
    if let Some(ack) = ack {
        let _ = ack.send(());
    }
    result.mark_peer_gone("session was stopped while the execution was in flight");
    finalize(hub, result.clone())
}

fn finalize(hub: &StreamHub, result: ExecutionResult) -> CesResult<ExecutionResult> {
    let payload = serde_json::to_value(&result)
        .map_err(|e| CesError::Internal(format!("failed to serialize execution result: {e}")))?;
    hub.publish(OutputKind::Result, payload, true);
    Ok(result)
}

/// Apply one interpreter message to the accumulating result and publish it
/// to the Stream Hub. Returns `Some(success)` iff this message was the
/// execute-reply ending the primary read loop.
async fn apply_message(
    msg: RawMessage,
    cwd: &Path,
    index: u64,
    result: &mut ExecutionResult,
    hub: &StreamHub,
) -> Option<bool> {
    match msg {
        RawMessage::Stdout { payload } => {
            hub.publish(OutputKind::Stdout, serde_json::json!({ "text": payload }), false);
            result.output.push_str(&payload);
            result.stdout_chunks.push(payload);
            None
        }
        RawMessage::Stderr { payload } => {
            hub.publish(OutputKind::Stderr, serde_json::json!({ "text": payload }), false);
            result.stderr_chunks.push(payload);
            None
        }
        RawMessage::Status { state } => {
            hub.publish(OutputKind::Status, serde_json::json!({ "state": state }), false);
            None
        }
        RawMessage::Log { level, tag, text } => {
            hub.publish(
                OutputKind::Log,
                serde_json::json!({ "level": level, "tag": tag, "text": text }),
                false,
            );
            result.log_entries.push(LogEntry { level, tag, text });
            None
        }
        RawMessage::Display {
            mime_type,
            data_base64,
            ext,
        } => {
            let file_name = format!("{}-{}.{}", result.execution_id, index, ext);
            if let Err(e) = write_display_artifact(cwd, &file_name, &data_base64).await {
                warn!(error = %e, file_name, "failed to write display artifact to cwd");
            }
            hub.publish(
                OutputKind::Display,
                serde_json::json!({ "file_name": file_name, "mime_type": mime_type }),
                false,
            );
            result.artifacts.push(Artifact {
                logical_name: file_name.clone(),
                mime_type,
                file_name,
            });
            None
        }
        RawMessage::Artifact { file_name, mime_type } => {
            hub.publish(
                OutputKind::Artifact,
                serde_json::json!({ "file_name": file_name, "mime_type": mime_type }),
                false,
            );
            result.artifacts.push(Artifact {
                logical_name: file_name.clone(),
                mime_type,
                file_name,
            });
            None
        }
        RawMessage::Variables { vars } => {
            hub.publish(OutputKind::Variables, serde_json::json!({ "vars": vars }), false);
            result.surfaced_variables = vars;
            None
        }
        RawMessage::Error { message } => {
            hub.publish(OutputKind::Error, serde_json::json!({ "message": message }), false);
            result.success = false;
            result.error_message = Some(match result.error_message.take() {
                Some(existing) => format!("{existing}\n{message}"),
                None => message,
            });
            None
        }
        RawMessage::ExecuteReply { success, error } => {
            if let Some(message) = error {
                result.error_message = Some(match result.error_message.take() {
                    Some(existing) => format!("{existing}\n{message}"),
                    None => message,
                });
            }
            Some(success)
        }
    }
}

async fn write_display_artifact(cwd: &Path, file_name: &str, data_base64: &str) -> std::io::Result<()> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data_base64)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    tokio::fs::write(cwd.join(file_name), bytes).await
}
