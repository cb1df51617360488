//! Operation and aspect ratio definitions.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Processing operations a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Re-encode with a quality-preserving CRF
    Compress,
    /// Scale (and pad) to a target width and height
    Resolution,
    /// Change the display aspect ratio
    AspectRatio,
    /// Extract the audio track to MP3
    ExtractAudio,
    /// Clip a time window into an animated GIF
    Gif,
    /// Clip a time window into WebM
    Webm,
}

impl Operation {
    pub const ALL: &'static [Operation] = &[
        Operation::Compress,
        Operation::Resolution,
        Operation::AspectRatio,
        Operation::ExtractAudio,
        Operation::Gif,
        Operation::Webm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Compress => "compress",
            Operation::Resolution => "resolution",
            Operation::AspectRatio => "aspect_ratio",
            Operation::ExtractAudio => "extract_audio",
            Operation::Gif => "gif",
            Operation::Webm => "webm",
        }
    }

    /// File extension (and media type sent on download) of the produced output.
    pub fn output_extension(&self) -> &'static str {
        match self {
            Operation::Compress | Operation::Resolution | Operation::AspectRatio => "mp4",
            Operation::ExtractAudio => "mp3",
            Operation::Gif => "gif",
            Operation::Webm => "webm",
        }
    }

    /// Whether the operation works on a time window of the input.
    pub fn is_clip(&self) -> bool {
        matches!(self, Operation::Gif | Operation::Webm)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Operation {
    type Err = OperationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "compress" => Ok(Operation::Compress),
            "resolution" => Ok(Operation::Resolution),
            "aspect_ratio" => Ok(Operation::AspectRatio),
            "extract_audio" => Ok(Operation::ExtractAudio),
            "gif" => Ok(Operation::Gif),
            "webm" => Ok(Operation::Webm),
            _ => Err(OperationParseError(s.to_string())),
        }
    }
}

#[derive(Debug, Error)]
#[error("Unknown operation: {0}")]
pub struct OperationParseError(String);

/// Aspect ratio specification (`W:H`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(into = "String", try_from = "String")]
#[schemars(with = "String")]
pub struct AspectRatio {
    pub width: u32,
    pub height: u32,
}

impl AspectRatio {
    /// Widescreen (16:9)
    pub const WIDESCREEN: AspectRatio = AspectRatio {
        width: 16,
        height: 9,
    };

    /// Create a new aspect ratio.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns the aspect ratio as a decimal.
    pub fn as_f64(&self) -> f64 {
        self.width as f64 / self.height as f64
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.width, self.height)
    }
}

impl FromStr for AspectRatio {
    type Err = AspectRatioParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 2 {
            return Err(AspectRatioParseError::InvalidFormat(s.to_string()));
        }

        let width = parts[0]
            .parse()
            .map_err(|_| AspectRatioParseError::InvalidNumber(parts[0].to_string()))?;
        let height = parts[1]
            .parse()
            .map_err(|_| AspectRatioParseError::InvalidNumber(parts[1].to_string()))?;

        if width == 0 || height == 0 {
            return Err(AspectRatioParseError::ZeroValue);
        }

        Ok(AspectRatio { width, height })
    }
}

impl From<AspectRatio> for String {
    fn from(ratio: AspectRatio) -> Self {
        ratio.to_string()
    }
}

impl TryFrom<String> for AspectRatio {
    type Error = AspectRatioParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Error)]
pub enum AspectRatioParseError {
    #[error("Invalid aspect ratio format: {0}, expected 'W:H'")]
    InvalidFormat(String),
    #[error("Invalid number in aspect ratio: {0}, expected a positive integer")]
    InvalidNumber(String),
    #[error("Aspect ratio cannot have zero values")]
    ZeroValue,
}
