//! The control protocol: the vocabulary CES speaks to the interpreter's
//! companion adapter, and the typed replies the adapter speaks back.
//!
//! The wire encoding is newline-delimited JSON in both directions. A single
//! parser (`RawMessage::parse_line`) and a single encoder
//! (`Payload::to_line`) own the format; no other module constructs or
//! inspects a protocol line directly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One line written to the interpreter's stdin: either a fragment of user
/// code or a control directive. Tagged so the adapter can tell them apart.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// A unit of user code to execute.
    Code { code: String },
    /// A control directive understood by the adapter.
    Directive(Directive),
}

impl Payload {
    /// Encode as a single NDJSON line, including the trailing newline.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).expect("Payload always serializes");
        line.push('\n');
        line
    }
}

/// A control directive understood by the in-interpreter adapter.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "directive", rename_all = "kebab-case")]
pub enum Directive {
    /// Establish session identity and working directory.
    SessionInit { session_id: String, cwd: String },
    /// Store extension source in the adapter's registry.
    ExtRegister { name: String, source: String },
    /// Instantiate a registered extension and bind it in the namespace.
    ExtLoad {
        name: String,
        config: HashMap<String, String>,
    },
    /// Marker framing the start of a user code execution.
    PreExec { exec_id: String, index: u64 },
    /// Trigger variable-snapshot and artifact-scan for an execution.
    PostExec { exec_id: String, index: u64 },
    /// Overwrite user-namespace bindings from outside.
    VarUpdate { bindings: HashMap<String, String> },
    /// Ask a busy interpreter to abandon its current execution.
    Interrupt,
}

/// One structured message read from the interpreter's output.
///
/// This is the raw, adapter-tagged shape as it appears on the wire; the
/// execution engine (`crate::engine`) turns these into `OutputEvent`s with
/// sequence numbers and a terminal flag for the Stream Hub.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum RawMessage {
    /// A chunk of standard output text.
    Stdout { payload: String },
    /// A chunk of standard error text.
    Stderr { payload: String },
    /// Interpreter state transition: `idle` or `busy`.
    Status { state: String },
    /// The interpreter has finished (or raised on) the current code unit.
    ExecuteReply {
        success: bool,
        #[serde(default)]
        error: Option<String>,
    },
    /// A rich display payload (e.g. an image) produced by user code.
    Display {
        mime_type: String,
        data_base64: String,
        ext: String,
    },
    /// The result of a `post-exec` variable snapshot diff.
    Variables { vars: Vec<SurfacedVariable> },
    /// A file written under the session cwd since the last scan.
    Artifact { file_name: String, mime_type: String },
    /// A structured log line emitted by an extension.
    Log {
        level: String,
        tag: String,
        text: String,
    },
    /// An adapter- or interpreter-level error (e.g. a failed `ext-load`, or
    /// a traceback from user code).
    Error { message: String },
}

impl RawMessage {
    /// Parse one NDJSON line from the interpreter's output.
    ///
    /// Blank lines are not valid messages; callers should skip them before
    /// calling this (see `crate::interpreter`).
    pub fn parse_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// True if this message is an idle status transition.
    pub fn is_idle(&self) -> bool {
        matches!(self, RawMessage::Status { state } if state == "idle")
    }
}

/// A user-defined, non-internal name bound after an execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SurfacedVariable {
    pub name: String,
    pub type_repr: String,
}
