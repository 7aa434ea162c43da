//! Core types for the pipeline system

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use crate::solar::Mode;

/// Sensor denoise setting handed to the capture process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenoiseMode {
    Off,
    Auto,
    CdnOff,
    CdnFast,
    CdnHq,
}

impl DenoiseMode {
    pub fn as_arg(&self) -> &'static str {
        match self {
            DenoiseMode::Off => "off",
            DenoiseMode::Auto => "auto",
            DenoiseMode::CdnOff => "cdn_off",
            DenoiseMode::CdnFast => "cdn_fast",
            DenoiseMode::CdnHq => "cdn_hq",
        }
    }
}

/// Which side of the pipeline a process sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    /// Camera process producing the encoded video elementary stream
    Capture,
    /// Muxer pushing audio and video to the broadcast endpoint
    Publish,
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessRole::Capture => write!(f, "capture"),
            ProcessRole::Publish => write!(f, "publish"),
        }
    }
}

/// Parameters of the capture process for one mode.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureParams {
    pub width: u32,
    pub height: u32,
    pub frame_rate_fps: u32,
    /// Fixed exposure time, `None` leaves exposure automatic
    pub shutter_micros: Option<u32>,
    /// Analogue gain, `None` leaves gain automatic
    pub gain: Option<f32>,
    pub bitrate_bps: u32,
    pub keyframe_interval_frames: u32,
    pub denoise_mode: DenoiseMode,
    pub mode: Mode,
}

/// Parameters of the publish process for one mode.
///
/// Without transcoding the video is copied through untouched, so the input
/// and output frame rates are the same.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishParams {
    pub input_frame_rate_fps: u32,
    pub output_frame_rate_fps: u32,
    pub video_transcode: bool,
    pub bitrate_bps: u32,
    pub keyframe_interval_frames: u32,
    pub audio_source_path: PathBuf,
    pub audio_bitrate_bps: u32,
    pub endpoint_url: String,
    pub stream_key: String,
}

impl PublishParams {
    /// Full ingest URL including the stream key.
    pub fn destination(&self) -> String {
        if self.stream_key.is_empty() {
            return self.endpoint_url.clone();
        }
        format!(
            "{}/{}",
            self.endpoint_url.trim_end_matches('/'),
            self.stream_key
        )
    }
}
