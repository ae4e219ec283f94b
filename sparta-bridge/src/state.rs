//! Worker supervision state as seen from outside the supervisor.

use serde::{Deserialize, Serialize};

/// Lifecycle state of the supervised worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// No worker process
    #[default]
    Absent,
    /// Process launched, readiness signal not yet received
    Spawning,
    /// Readiness signal received; invocations forward directly
    Ready,
    /// Process exit requested (respawn budget exhausted or binary unavailable)
    Halted,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absent => "ABSENT",
            Self::Spawning => "SPAWNING",
            Self::Ready => "READY",
            Self::Halted => "HALTED",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSnapshot {
    pub state: WorkerState,
    pub respawn_count: u32,
    pub pending: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_pid: Option<u32>,
}
