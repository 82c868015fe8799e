//! Supervisor lifecycle state
//!
//! ```text
//! Idle ──► Starting ──► Running ──► Stopping ──► Stopped
//!              │                       │
//!              └──────► Failed ◄───────┘
//! ```

use serde::Serialize;

/// Lifecycle state of the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    /// No backend started yet
    Idle,
    /// Backend start in progress
    Starting,
    /// Backend is enforcing
    Running,
    /// Backend teardown in progress
    Stopping,
    /// Teardown finished
    Stopped,
    /// Backend failed to start, or teardown overran its deadline
    Failed,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Stopped => "stopped",
            SupervisorState::Failed => "failed",
        };
        f.write_str(name)
    }
}
