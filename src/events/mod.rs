//! Status events emitted by the supervisor
//!
//! The control loop reports every transition, process lifecycle change and
//! recoverable failure as a [`SupervisorEvent`]. Where the events end up is
//! decided by the [`StatusSink`] handed to the supervisor; [`LogSink`] writes
//! them to the log.

use chrono::NaiveTime;
use log::{error, info, warn};
use std::time::Duration;

use crate::pipeline::error::SupervisorError;
use crate::pipeline::health::HealthSummary;
use crate::pipeline::process::{ExitKind, HandleId, Termination};
use crate::pipeline::state::SupervisorState;
use crate::pipeline::types::{Mode, ProcessRole};
use crate::solar::{ScheduleError, SolarWindow};

/// Why the supervisor left `Running`.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    ModeChanged { from: Mode, to: Mode },
    PublishExited(ExitKind),
    CaptureExited(ExitKind),
    CaptureStalled(Duration),
    SegmentExpired(Duration),
    CaptureRestartFailed(String),
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::ModeChanged { from, to } => write!(f, "mode changed {} -> {}", from, to),
            Trigger::PublishExited(status) => write!(f, "publish process exited ({})", status),
            Trigger::CaptureExited(status) => write!(f, "capture process exited ({})", status),
            Trigger::CaptureStalled(silence) => {
                write!(f, "no capture output for {:.1}s", silence.as_secs_f64())
            }
            Trigger::SegmentExpired(age) => {
                write!(f, "capture segment reached {:.0}s", age.as_secs_f64())
            }
            Trigger::CaptureRestartFailed(reason) => {
                write!(f, "replacement capture failed: {}", reason)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    StateChanged {
        from: SupervisorState,
        to: SupervisorState,
    },
    ScheduleRefreshed {
        window: SolarWindow,
        source: &'static str,
    },
    ScheduleStale {
        error: ScheduleError,
        window: SolarWindow,
    },
    ModeClassified {
        mode: Mode,
        at: NaiveTime,
        window: SolarWindow,
    },
    ProcessLaunched {
        role: ProcessRole,
        handle: HandleId,
        pid: u32,
        command: String,
    },
    ProcessReady {
        role: ProcessRole,
        pid: u32,
        after: Duration,
    },
    /// A process died on its own while the pipeline was running
    ProcessExited {
        role: ProcessRole,
        pid: u32,
        status: ExitKind,
        uptime: Duration,
    },
    ProcessTerminated {
        role: ProcessRole,
        pid: u32,
        outcome: Termination,
    },
    Triggered {
        trigger: Trigger,
        mode: Mode,
        segment: Duration,
    },
    BuildFailed {
        attempt: u32,
        mode: Mode,
        error: String,
        retry_in: Duration,
    },
    PipelineRunning {
        mode: Mode,
        capture_pid: u32,
        publish_pid: u32,
        generation: u64,
    },
    CaptureRestarted {
        mode: Mode,
        pid: u32,
        generation: u64,
    },
    Health(HealthSummary),
    Stopped {
        uptime: Duration,
    },
}

/// Receiver of supervisor events.
pub trait StatusSink: Send + Sync {
    fn emit(&self, event: SupervisorEvent);
}

/// Writes events to the log facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl StatusSink for LogSink {
    fn emit(&self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::StateChanged { from, to } => info!("State: {} -> {}", from, to),
            SupervisorEvent::ScheduleRefreshed { window, source } => {
                info!("Solar schedule refreshed from {} source: {}", source, window)
            }
            SupervisorEvent::ScheduleStale { error, window } => warn!(
                "{}; keeping {}",
                SupervisorError::ScheduleFetchFailure(error),
                window
            ),
            SupervisorEvent::ModeClassified { mode, at, window } => {
                info!("{} classified as {} ({})", at.format("%H:%M"), mode, window)
            }
            SupervisorEvent::ProcessLaunched {
                role,
                handle,
                pid,
                command,
            } => info!("Launched {} process {} (pid {}): {}", role, handle, pid, command),
            SupervisorEvent::ProcessReady { role, pid, after } => {
                info!("{} process {} ready after {:.1}s", role, pid, after.as_secs_f64())
            }
            SupervisorEvent::ProcessExited {
                role,
                pid,
                status,
                uptime,
            } => {
                if status.is_crash() {
                    warn!(
                        "{} process {} crashed after {:.0}s: {}",
                        role,
                        pid,
                        uptime.as_secs_f64(),
                        status
                    )
                } else {
                    info!(
                        "{} process {} stopped cleanly after {:.0}s",
                        role,
                        pid,
                        uptime.as_secs_f64()
                    )
                }
            }
            SupervisorEvent::ProcessTerminated { role, pid, outcome } => {
                info!("{} process {} {}", role, pid, outcome)
            }
            SupervisorEvent::Triggered {
                trigger,
                mode,
                segment,
            } => info!(
                "{} (mode {}, segment {:.0}s)",
                trigger,
                mode,
                segment.as_secs_f64()
            ),
            SupervisorEvent::BuildFailed {
                attempt,
                mode,
                error,
                retry_in,
            } => error!(
                "Build attempt {} for {} mode failed: {}; retrying in {:.1}s",
                attempt,
                mode,
                error,
                retry_in.as_secs_f64()
            ),
            SupervisorEvent::PipelineRunning {
                mode,
                capture_pid,
                publish_pid,
                generation,
            } => info!(
                "Pipeline running in {} mode (capture {}, publish {}, channel {})",
                mode, capture_pid, publish_pid, generation
            ),
            SupervisorEvent::CaptureRestarted {
                mode,
                pid,
                generation,
            } => info!(
                "Capture restarted in {} mode as pid {} on channel {}",
                mode, pid, generation
            ),
            SupervisorEvent::Health(summary) => info!("{}", summary),
            SupervisorEvent::Stopped { uptime } => {
                info!("Supervisor stopped after {:.0}s", uptime.as_secs_f64())
            }
        }
    }
}
