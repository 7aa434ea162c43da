//! Mode → parameter sets → spawn specifications

use crate::config::{CommandConfig, Config, PublishConfig, VideoConfig};

use super::process::{ChannelEnd, ProcessSpec};
use super::types::{CaptureParams, Mode, ProcessRole, PublishParams};

/// Maps a [`Mode`] onto capture and publish parameters.
///
/// Holds only the immutable base configuration; building performs no I/O.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    video: VideoConfig,
    publish: PublishConfig,
    commands: CommandConfig,
}

impl PipelineBuilder {
    pub fn new(config: &Config) -> Self {
        Self {
            video: config.video.clone(),
            publish: config.publish.clone(),
            commands: config.commands.clone(),
        }
    }

    pub fn build(&self, mode: Mode) -> (CaptureParams, PublishParams) {
        let v = &self.video;

        let capture = match mode {
            Mode::Day => CaptureParams {
                width: v.width,
                height: v.height,
                frame_rate_fps: v.day_fps,
                shutter_micros: None,
                gain: None,
                bitrate_bps: v.bitrate_bps,
                keyframe_interval_frames: v.keyframe_frames(v.day_fps),
                denoise_mode: v.day_denoise,
                mode,
            },
            Mode::Night => CaptureParams {
                width: v.width,
                height: v.height,
                frame_rate_fps: v.night_fps,
                // Exposure cannot outlast the frame period
                shutter_micros: Some(v.night_shutter_us.min(1_000_000 / v.night_fps.max(1))),
                gain: Some(v.night_gain),
                bitrate_bps: v.bitrate_bps,
                keyframe_interval_frames: v.keyframe_frames(v.night_fps),
                denoise_mode: v.night_denoise,
                mode,
            },
        };

        let (output_fps, transcode) = match mode {
            Mode::Day => (capture.frame_rate_fps, false),
            Mode::Night => (v.night_output_fps, true),
        };

        let publish = PublishParams {
            input_frame_rate_fps: capture.frame_rate_fps,
            output_frame_rate_fps: output_fps,
            video_transcode: transcode,
            bitrate_bps: v.bitrate_bps,
            keyframe_interval_frames: v.keyframe_frames(output_fps),
            audio_source_path: self.publish.audio_path.clone(),
            audio_bitrate_bps: self.publish.audio_bitrate_bps,
            endpoint_url: self.publish.endpoint_url.clone(),
            stream_key: self.publish.stream_key.clone(),
        };

        (capture, publish)
    }

    /// Camera invocation writing H.264 to stdout.
    pub fn capture_spec(&self, params: &CaptureParams) -> ProcessSpec {
        let mut spec = ProcessSpec::new(
            ProcessRole::Capture,
            &self.commands.capture_program,
            ChannelEnd::Writer,
        )
        .args(["-t", "0", "--nopreview", "--codec", "h264", "--inline", "--flush"])
        .args(["--width".to_string(), params.width.to_string()])
        .args(["--height".to_string(), params.height.to_string()])
        .args(["--framerate".to_string(), params.frame_rate_fps.to_string()])
        .args(["--bitrate".to_string(), params.bitrate_bps.to_string()])
        .args(["--intra".to_string(), params.keyframe_interval_frames.to_string()])
        .args(["--denoise", params.denoise_mode.as_arg()]);

        if let Some(shutter) = params.shutter_micros {
            spec = spec.args(["--shutter".to_string(), shutter.to_string()]);
        }
        if let Some(gain) = params.gain {
            spec = spec.args(["--gain".to_string(), format!("{:.1}", gain)]);
        }

        spec.args(["-o", "-"])
    }

    /// Muxer invocation reading video from stdin and looping the audio bed.
    pub fn publish_spec(&self, params: &PublishParams) -> ProcessSpec {
        let mut spec = ProcessSpec::new(
            ProcessRole::Publish,
            &self.commands.publish_program,
            ChannelEnd::Reader,
        )
        .args(["-hide_banner", "-loglevel", "warning", "-nostdin"])
        .args(["-thread_queue_size", "1024", "-f", "h264"])
        .args(["-framerate".to_string(), params.input_frame_rate_fps.to_string()])
        .args(["-i", "pipe:0"])
        .args(["-stream_loop", "-1", "-re", "-i"])
        .arg(params.audio_source_path.to_string_lossy())
        .args(["-map", "0:v:0", "-map", "1:a:0"]);

        if params.video_transcode {
            let bitrate = params.bitrate_bps;
            spec = spec
                .args(["-c:v", "libx264", "-preset", "veryfast", "-pix_fmt", "yuv420p"])
                .args(["-r".to_string(), params.output_frame_rate_fps.to_string()])
                .args(["-b:v".to_string(), bitrate.to_string()])
                .args(["-maxrate".to_string(), bitrate.to_string()])
                .args(["-bufsize".to_string(), (bitrate.saturating_mul(2)).to_string()])
                .args(["-g".to_string(), params.keyframe_interval_frames.to_string()]);
        } else {
            spec = spec.args(["-c:v", "copy"]);
        }

        spec.args(["-c:a", "aac", "-ar", "44100"])
            .args(["-b:a".to_string(), params.audio_bitrate_bps.to_string()])
            .args(["-f", "flv"])
            .arg(params.destination())
            .secret(params.stream_key.clone())
    }
}
