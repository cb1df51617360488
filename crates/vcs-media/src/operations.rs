//! FFmpeg commands for each operation.

use std::path::Path;

use vcs_models::JobParameters;

use crate::command::FfmpegCommand;
use crate::probe::VideoInfo;

const HD_PIXELS: u64 = 1280 * 720;
const FULL_HD_PIXELS: u64 = 1920 * 1080;

/// GIF frame rate and width.
const GIF_FILTER: &str = "fps=10,scale=320:-1:flags=lanczos";

/// x264 settings for `compress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionSettings {
    pub crf: u8,
    pub preset: &'static str,
}

/// Choose CRF and preset from the source resolution and bitrate.
///
/// High-bitrate sources get a lower CRF so detail survives; 4K and above
/// use a slower preset.
pub fn compression_settings(info: &VideoInfo) -> CompressionSettings {
    let pixels = info.pixels();
    let bitrate = info.bitrate;

    let crf = if pixels <= HD_PIXELS {
        if bitrate > 2_000_000 { 23 } else { 26 }
    } else if pixels <= FULL_HD_PIXELS {
        if bitrate > 4_000_000 { 22 } else { 24 }
    } else if bitrate > 8_000_000 {
        20
    } else {
        22
    };

    let preset = if pixels > FULL_HD_PIXELS { "slower" } else { "medium" };

    CompressionSettings { crf, preset }
}

/// Build the FFmpeg command for a job.
///
/// `info` is only consulted by `compress`; without it the 1080p defaults apply.
pub fn build_command(
    parameters: &JobParameters,
    input: &Path,
    output: &Path,
    info: Option<&VideoInfo>,
) -> FfmpegCommand {
    let cmd = FfmpegCommand::new(input, output);

    match parameters {
        JobParameters::Compress => {
            let settings = info
                .map(compression_settings)
                .unwrap_or(CompressionSettings {
                    crf: 24,
                    preset: "medium",
                });
            cmd.video_codec("libx264")
                .crf(settings.crf)
                .preset(settings.preset)
                .audio_codec("aac")
                .audio_bitrate("128k")
                .output_args(["-movflags", "+faststart"])
        }
        JobParameters::Resolution { width, height } => cmd
            .video_filter(format!(
                "scale={width}:{height}:force_original_aspect_ratio=decrease,pad={width}:{height}:(ow-iw)/2:(oh-ih)/2"
            ))
            .video_codec("libx264")
            .crf(23)
            .audio_codec("copy"),
        JobParameters::AspectRatio { aspect_ratio } => cmd
            .video_filter(format!(
                "setdar={}/{}",
                aspect_ratio.width, aspect_ratio.height
            ))
            .video_codec("libx264")
            .crf(23)
            .audio_codec("copy"),
        JobParameters::ExtractAudio => cmd
            .no_video()
            .audio_codec("libmp3lame")
            .output_args(["-q:a", "2"]),
        JobParameters::Gif(window) => cmd
            .seek(window.start_time)
            .duration(window.duration)
            // Palette generated and applied in one pass
            .filter_complex(format!(
                "{GIF_FILTER},split[s0][s1];[s0]palettegen[p];[s1][p]paletteuse"
            ))
            .output_args(["-loop", "0"]),
        JobParameters::Webm(window) => cmd
            .seek(window.start_time)
            .duration(window.duration)
            .video_codec("libvpx-vp9")
            .crf(30)
            .output_args(["-b:v", "0"])
            .audio_codec("libopus"),
    }
}

/// Output duration in milliseconds, used to turn encoded time into a percentage.
pub fn expected_duration_ms(parameters: &JobParameters, info: Option<&VideoInfo>) -> Option<i64> {
    let source = info.map(|i| i.duration).filter(|d| *d > 0.0);

    let seconds = match parameters.clip_window() {
        Some(window) => match source {
            Some(total) => window.duration.min((total - window.start_time).max(0.0)),
            None => window.duration,
        },
        None => source?,
    };

    let ms = (seconds * 1000.0) as i64;
    (ms > 0).then_some(ms)
}
