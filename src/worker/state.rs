//! Pool state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a worker pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    /// Created, no pass started yet.
    #[default]
    Idle,
    /// A pass is admitting work.
    Running,
    /// Admission has ceased; in-flight work is draining.
    Stopping,
    /// The last pass has fully drained.
    Stopped,
}

impl PoolState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: PoolState) -> bool {
        use PoolState::*;

        matches!(
            (self, target),
            (Idle, Running)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Stopping, Stopped)
                // A finished pool may run another pass
                | (Stopped, Running)
        )
    }

    /// True while a pass is in progress.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Stopping)
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}
