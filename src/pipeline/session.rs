//! The active capture + publish pair

use std::time::{Duration, Instant};

use super::channel::{DataChannel, PublishSink};
use super::process::ProcessHandle;
use super::types::{CaptureParams, Mode, PublishParams};

/// Everything belonging to one built pipeline.
///
/// The publish handle and sink survive capture-only restarts; the capture
/// handle and channel are replaced on each one.
pub struct StreamSession {
    pub capture: ProcessHandle,
    pub publish: ProcessHandle,
    pub channel: DataChannel,
    pub sink: PublishSink,
    pub mode: Mode,
    pub capture_params: CaptureParams,
    pub publish_params: PublishParams,
    pub started_at: Instant,
    pub last_capture_restart: Instant,
}

impl StreamSession {
    /// Time the current capture process has been feeding the session
    pub fn segment_age(&self) -> Duration {
        self.last_capture_restart.elapsed()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
