//! Stream pipeline supervision
//!
//! The pipeline is two external processes joined by a byte channel:
//! - Capture: the camera encoder, writing H.264 to its stdout
//! - Publish: the muxer, reading video from stdin, adding the audio bed and
//!   pushing FLV to the ingest endpoint
//!
//! # Architecture
//!
//! - `builder` maps a [`Mode`] onto parameter sets and process specs
//! - `process` spawns, watches and stops individual processes
//! - `channel` relays bytes between them, one generation per capture
//! - `supervisor` runs the state machine deciding when to restart what
//! - `health` tracks relay throughput and restart counters

pub mod builder;
pub mod channel;
pub mod error;
pub mod health;
pub mod process;
pub mod session;
pub mod state;
pub mod supervisor;
pub mod types;

pub use builder::PipelineBuilder;
pub use channel::{DataChannel, PublishSink};
pub use error::SupervisorError;
pub use health::{HealthSummary, PipelineHealth};
pub use process::{ProcessHandle, ProcessLauncher, ProcessSpec, SystemLauncher};
pub use session::StreamSession;
pub use state::SupervisorState;
pub use supervisor::StreamSupervisor;
pub use types::{CaptureParams, DenoiseMode, Mode, ProcessRole, PublishParams};
