//! Session data model and lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a session.
///
/// ```text
/// Created -> Provisioning -> Active -> Terminating -> Destroyed
///                 |             |
///                 +-> Failed <--+   (terminal)
/// ```
///
/// Teardown is defined to always succeed (signals escalate, unmounts are
/// forced), so `Destroyed` is always reachable from `Terminating`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Provisioning,
    Active,
    Terminating,
    Destroyed,
    Failed,
}

impl SessionState {
    /// Whether the session's display is reachable through the proxy. A
    /// routing entry exists if and only if this holds.
    pub fn is_reachable(&self) -> bool {
        matches!(self, SessionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Destroyed | SessionState::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Provisioning => "provisioning",
            SessionState::Active => "active",
            SessionState::Terminating => "terminating",
            SessionState::Destroyed => "destroyed",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A provisioned (or provisioning) session and its assigned resources.
///
/// The display id, VNC port, and routing token are owned exclusively by
/// this session until they are released.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub display: Option<u32>,
    pub vnc_port: Option<u16>,
    pub token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            state: SessionState::Created,
            display: None,
            vnc_port: None,
            token: None,
            created_at: now,
            last_active: now,
        }
    }
}

/// What the API layer hands to clients: the routing token and the
/// externally-reachable URL through the shared proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub token: String,
    pub url: String,
}
