//! FFmpeg progress parsing.
//!
//! FFmpeg run with `-progress pipe:2` writes `key=value` lines and closes
//! each block with `progress=continue` or `progress=end`.

use serde::{Deserialize, Serialize};

/// Progress information from FFmpeg.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FfmpegProgress {
    /// Current frame number
    pub frame: u64,
    /// Output time in milliseconds
    pub out_time_ms: i64,
    /// Encoding speed (e.g., 1.5 = 1.5x realtime)
    pub speed: f64,
    /// Whether encoding is complete
    pub is_complete: bool,
}

impl FfmpegProgress {
    /// Percentage of `total_duration_ms` encoded so far, in [0, 100].
    pub fn percentage(&self, total_duration_ms: i64) -> f64 {
        if self.is_complete {
            return 100.0;
        }
        if total_duration_ms <= 0 || self.out_time_ms <= 0 {
            return 0.0;
        }
        ((self.out_time_ms as f64 / total_duration_ms as f64) * 100.0).min(100.0)
    }
}

/// Outcome of feeding one stderr line to the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressLine {
    /// A progress block ended; carries the accumulated state
    Block(FfmpegProgress),
    /// A `key=value` field inside a block
    Field,
    /// Anything else (diagnostics)
    Other,
}

/// Parse a line from FFmpeg's `-progress` output into `current`.
pub fn parse_progress_line(line: &str, current: &mut FfmpegProgress) -> ProgressLine {
    let line = line.trim();
    let Some((key, value)) = line.split_once('=') else {
        return ProgressLine::Other;
    };

    match key {
        // FFmpeg reports microseconds under both names
        "out_time_us" | "out_time_ms" => {
            if let Ok(us) = value.parse::<i64>() {
                current.out_time_ms = us / 1000;
            }
        }
        "frame" => {
            if let Ok(frame) = value.parse() {
                current.frame = frame;
            }
        }
        "speed" => {
            if let Some(speed) = value.strip_suffix('x').and_then(|s| s.trim().parse().ok()) {
                current.speed = speed;
            }
        }
        "progress" => {
            if value == "end" {
                current.is_complete = true;
            }
            return ProgressLine::Block(current.clone());
        }
        "fps" | "bitrate" | "total_size" | "out_time" | "dup_frames" | "drop_frames" => {}
        _ if key.starts_with("stream_") => {}
        _ => return ProgressLine::Other,
    }

    ProgressLine::Field
}
