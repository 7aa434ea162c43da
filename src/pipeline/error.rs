use std::time::Duration;
use thiserror::Error;

use super::channel::ChannelError;
use super::process::ProcessError;
use super::types::ProcessRole;
use crate::solar::ScheduleError;

/// Failures the supervisor recovers from.
///
/// None of these end the control loop; only a stop request does.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("schedule fetch failed: {0}")]
    ScheduleFetchFailure(#[from] ScheduleError),
    #[error("process spawn failed: {0}")]
    ProcessSpawnFailure(#[source] ProcessError),
    #[error("process readiness timed out: {0}")]
    ProcessReadinessTimeout(#[source] ProcessError),
    #[error("process crashed: {0}")]
    ProcessCrash(#[source] ProcessError),
    #[error("data channel creation failed: {0}")]
    ChannelCreationFailure(#[from] ChannelError),
    #[error("{role} process {pid} ignored SIGTERM for {grace:?} and was killed")]
    GracefulTerminationTimeout {
        role: ProcessRole,
        pid: u32,
        grace: Duration,
    },
    #[error("stop requested")]
    StopRequested,
}

impl From<ProcessError> for SupervisorError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::Spawn { .. } => SupervisorError::ProcessSpawnFailure(err),
            ProcessError::Timeout { .. } => SupervisorError::ProcessReadinessTimeout(err),
            ProcessError::Exited { .. } | ProcessError::Io { .. } => {
                SupervisorError::ProcessCrash(err)
            }
        }
    }
}
