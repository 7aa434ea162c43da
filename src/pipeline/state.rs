//! Supervisor state management

/// Supervisor state machine
///
/// Represents where the control loop is in the pipeline lifecycle. State
/// transitions are validated to keep the loop on the documented edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupervisorState {
    /// Nothing running yet
    Idle,

    /// Launching capture and publish processes for the current mode
    BuildingPipeline,

    /// Both processes up, polling once per tick
    Running,

    /// Replacing the capture process while publish keeps running
    RestartingCapture,

    /// Tearing the whole pipeline down before a rebuild
    RebuildingForModeChange,

    /// Stopping everything; terminal
    ShuttingDown,
}

impl SupervisorState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &SupervisorState) -> bool {
        use SupervisorState::*;

        match (self, target) {
            // A stop request wins from anywhere but the terminal state
            (ShuttingDown, _) => false,
            (_, ShuttingDown) => true,

            (Idle, BuildingPipeline) => true,

            // Failed attempts retry the build
            (BuildingPipeline, BuildingPipeline) => true,
            (BuildingPipeline, Running) => true,

            (Running, Running) => true,
            (Running, RestartingCapture) => true,
            (Running, RebuildingForModeChange) => true,

            (RestartingCapture, Running) => true,
            // A replacement capture that never comes up forces a full rebuild
            (RestartingCapture, RebuildingForModeChange) => true,

            (RebuildingForModeChange, BuildingPipeline) => true,

            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            SupervisorState::Idle => "Idle",
            SupervisorState::BuildingPipeline => "BuildingPipeline",
            SupervisorState::Running => "Running",
            SupervisorState::RestartingCapture => "RestartingCapture",
            SupervisorState::RebuildingForModeChange => "RebuildingForModeChange",
            SupervisorState::ShuttingDown => "ShuttingDown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SupervisorState::ShuttingDown)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, SupervisorState::Running)
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
