//! Health metrics for the stream pipeline

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Health metrics for a running supervisor
///
/// Shared between the control loop and the data channel relay.
/// All fields use atomic operations for thread-safe access.
pub struct PipelineHealth {
    /// Bytes moved from the capture process to the publish process
    pub bytes_relayed: AtomicU64,

    /// Read chunks moved across the data channel
    pub chunks_relayed: AtomicU64,

    /// Microseconds since `epoch` at which data last crossed the channel
    pub last_data_time: AtomicU64,

    /// Capture-only restarts, whatever their cause
    pub capture_restarts: AtomicU64,

    /// Capture processes found dead while the session was running
    pub capture_crashes: AtomicU64,

    /// Full pipeline teardowns followed by a rebuild
    pub pipeline_rebuilds: AtomicU64,

    /// Build attempts that did not reach a running pipeline
    pub failed_builds: AtomicU64,

    /// Monotonic base for `last_data_time`, immune to wall-clock steps
    epoch: Instant,
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self {
            bytes_relayed: AtomicU64::new(0),
            chunks_relayed: AtomicU64::new(0),
            last_data_time: AtomicU64::new(0),
            capture_restarts: AtomicU64::new(0),
            capture_crashes: AtomicU64::new(0),
            pipeline_rebuilds: AtomicU64::new(0),
            failed_builds: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    fn now_micros(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Record a chunk of stream data relayed to the publisher
    pub fn record_chunk(&self, size: usize) {
        self.last_data_time.store(self.now_micros(), Ordering::Relaxed);
        self.chunks_relayed.fetch_add(1, Ordering::Relaxed);
        self.bytes_relayed.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Restart the stall clock, used when a new capture process starts
    pub fn reset_stall_clock(&self) {
        self.last_data_time.store(self.now_micros(), Ordering::Relaxed);
    }

    pub fn record_capture_restart(&self) {
        self.capture_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capture_crash(&self) {
        self.capture_crashes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuild(&self) {
        self.pipeline_rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_build(&self) {
        self.failed_builds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_relayed.load(Ordering::Relaxed)
    }

    pub fn chunks_relayed(&self) -> u64 {
        self.chunks_relayed.load(Ordering::Relaxed)
    }

    /// Microseconds after construction at which data was last seen
    pub fn last_data_time(&self) -> u64 {
        self.last_data_time.load(Ordering::Relaxed)
    }

    pub fn capture_restarts(&self) -> u64 {
        self.capture_restarts.load(Ordering::Relaxed)
    }

    pub fn capture_crashes(&self) -> u64 {
        self.capture_crashes.load(Ordering::Relaxed)
    }

    pub fn pipeline_rebuilds(&self) -> u64 {
        self.pipeline_rebuilds.load(Ordering::Relaxed)
    }

    pub fn failed_builds(&self) -> u64 {
        self.failed_builds.load(Ordering::Relaxed)
    }

    /// Time since data last crossed the channel
    pub fn data_silence(&self) -> Duration {
        Duration::from_micros(self.now_micros().saturating_sub(self.last_data_time()))
    }

    /// Check if the capture has stalled (no data for given duration)
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        self.data_silence() > threshold
    }

    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            bytes_relayed: self.bytes_relayed(),
            chunks_relayed: self.chunks_relayed(),
            data_silence: self.data_silence(),
            capture_restarts: self.capture_restarts(),
            capture_crashes: self.capture_crashes(),
            pipeline_rebuilds: self.pipeline_rebuilds(),
            failed_builds: self.failed_builds(),
        }
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSummary {
    pub bytes_relayed: u64,
    pub chunks_relayed: u64,
    pub data_silence: Duration,
    pub capture_restarts: u64,
    pub capture_crashes: u64,
    pub pipeline_rebuilds: u64,
    pub failed_builds: u64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} bytes in {} chunks (last data {:.1}s ago), {} capture restarts ({} crashes), {} rebuilds, {} failed builds",
            self.bytes_relayed,
            self.chunks_relayed,
            self.data_silence.as_secs_f64(),
            self.capture_restarts,
            self.capture_crashes,
            self.pipeline_rebuilds,
            self.failed_builds
        )
    }
}
