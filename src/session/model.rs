//! Plain data types owned by the session aggregate.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque session identifier, unique within the process lifetime.
pub type SessionId = String;

/// Lifecycle state of a `Session`. Monotone: once `Stopped`, never leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// A named, versioned user-provided code blob with a configuration mapping.
/// Immutable once registered: loading a second extension under the same
/// name is rejected rather than replacing the first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extension {
    pub name: String,
    pub source_code: String,
    pub config: HashMap<String, String>,
}

/// Snapshot of session metadata, as returned by `SessionManager::list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub execution_count: u64,
    pub status: SessionStatus,
}
