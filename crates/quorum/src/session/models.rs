//! Session records.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::sandbox::ResourceLimits;

/// One user's live binding to a remote protocol session.
///
/// Keyed by user id in the orchestrator's registry; the user is the
/// natural key, so re-creating a session for an already-connected user
/// returns the existing record.
pub(crate) struct UserSession {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    /// Monotonic idle clock, refreshed on every interaction.
    pub last_activity: std::sync::Mutex<Instant>,
}

impl UserSession {
    pub fn new(session_id: String) -> Self {
        Self {
            session_id,
            created_at: Utc::now(),
            last_activity: std::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.lock().unwrap().elapsed()
    }
}

/// Serializable session view for compat callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    /// Best connection state across the user's pool.
    pub connection_state: String,
    pub created_at: DateTime<Utc>,
    /// Milliseconds since the last interaction.
    pub idle_ms: u64,
}

/// The per-user sandbox binding.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSession {
    pub user_id: String,
    /// Deterministic: a pure function of the user id.
    pub container_name: String,
    pub workspace_dir: String,
    pub resource_limits: ResourceLimits,
}
