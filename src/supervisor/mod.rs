//! Service supervisor adapter.
//!
//! ```text
//! ┌──────────────┐   Supervisor trait   ┌──────────────────┐
//! │  lifecycle / │ ───────────────────▶ │ SystemdSupervisor│──▶ systemctl / journalctl
//! │  pipeline    │                      │  (units, status) │      (CommandRunner)
//! └──────────────┘                      └──────────────────┘
//! ```

pub mod command;
pub mod systemd;
pub mod units;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::infection::{Infection, InfectionState};

pub use command::{CommandOutput, CommandRunner, TokioCommandRunner};
pub use systemd::SystemdSupervisor;

/// Point-in-time view of a supervised unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatus {
    pub active_state: String,
    pub sub_state: String,
    pub pid: Option<u32>,
    /// Bytes.
    pub memory_usage: Option<u64>,
    /// Nanoseconds of CPU time.
    pub cpu_usage: Option<u64>,
    /// Seconds since the unit last became active.
    pub uptime: Option<u64>,
    pub restart_count: u32,
}

impl SupervisorStatus {
    pub fn is_active(&self) -> bool {
        self.active_state == "active"
    }

    /// Infection state this status corresponds to, if any.
    pub fn observed_state(&self) -> Option<InfectionState> {
        map_state(&self.active_state, &self.sub_state)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: String,
    pub message: String,
    pub pid: Option<u32>,
}

#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Render and register the unit for `infection`. Returns whether any
    /// file changed; identical inputs leave the unit directory untouched.
    async fn create_service(&self, infection: &Infection) -> Result<bool>;

    /// Idempotent: starting an active unit does nothing.
    async fn start(&self, service: &str) -> Result<()>;

    /// Idempotent: stopping an inactive unit does nothing. `force` kills
    /// the main process with SIGKILL first.
    async fn stop(&self, service: &str, force: bool) -> Result<()>;

    async fn restart(&self, service: &str) -> Result<()>;

    async fn status(&self, service: &str) -> Result<SupervisorStatus>;

    async fn logs(&self, service: &str, lines: usize, since: Option<&str>) -> Result<Vec<LogEntry>>;

    /// Stop, disable and delete the generated unit files.
    async fn remove_service(&self, service: &str) -> Result<()>;
}

/// Supervisor states to infection states. Anything not listed yields `None`
/// and must not cause a transition.
pub fn map_state(active_state: &str, sub_state: &str) -> Option<InfectionState> {
    match (active_state, sub_state) {
        ("active", _) | ("reloading", _) => Some(InfectionState::Running),
        ("activating", _) => Some(InfectionState::Starting),
        ("deactivating", _) => Some(InfectionState::Stopping),
        ("inactive", _) => Some(InfectionState::Stopped),
        ("failed", _) => Some(InfectionState::Failed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_supervisor_states() {
        assert_eq!(map_state("active", "running"), Some(InfectionState::Running));
        assert_eq!(map_state("activating", "auto-restart"), Some(InfectionState::Starting));
        assert_eq!(map_state("deactivating", "stop-sigterm"), Some(InfectionState::Stopping));
        assert_eq!(map_state("inactive", "dead"), Some(InfectionState::Stopped));
        assert_eq!(map_state("failed", "failed"), Some(InfectionState::Failed));
        assert_eq!(map_state("maintenance", ""), None);
        assert_eq!(map_state("", ""), None);
    }
}
