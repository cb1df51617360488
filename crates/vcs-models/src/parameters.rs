//! Operation parameters and their validation.
//!
//! Raw parameters arrive as an arbitrary JSON mapping. [`JobParameters::parse`]
//! turns them into a typed value or a description of the violated constraint.
//! Unknown keys are ignored so transport-level keys (e.g. `source`) can share
//! the mapping.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use validator::{Validate, ValidationErrors};

use crate::operation::{AspectRatio, Operation};

/// Largest accepted output dimension in pixels.
pub const MAX_DIMENSION: i64 = 16_384;

/// Time window for clip operations (gif / webm), in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct ClipWindow {
    #[serde(alias = "start-time", alias = "startTime")]
    #[validate(range(min = 0.0, message = "start_time must be non-negative"))]
    pub start_time: f64,
    #[validate(range(exclusive_min = 0.0, message = "duration must be positive"))]
    pub duration: f64,
}

#[derive(Debug, Deserialize, Validate)]
struct ResolutionInput {
    #[validate(range(min = 1, message = "width must be a positive integer"))]
    width: i64,
    #[validate(range(min = 1, message = "height must be a positive integer"))]
    height: i64,
}

impl ResolutionInput {
    fn check_upper_bound(&self) -> Result<(), String> {
        for (field, value) in [("width", self.width), ("height", self.height)] {
            if value > MAX_DIMENSION {
                return Err(format!("{field} must be at most {MAX_DIMENSION} pixels"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct AspectRatioInput {
    #[serde(alias = "ratio", alias = "aspectRatio")]
    aspect_ratio: String,
}

/// Validated, operation-specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobParameters {
    Compress,
    Resolution { width: u32, height: u32 },
    AspectRatio { aspect_ratio: AspectRatio },
    ExtractAudio,
    Gif(ClipWindow),
    Webm(ClipWindow),
}

impl JobParameters {
    /// Validate raw parameters for an operation.
    ///
    /// `null` is treated as an empty mapping.
    pub fn parse(operation: Operation, raw: &Value) -> Result<Self, ParameterError> {
        let raw = match raw {
            Value::Null => Value::Object(Default::default()),
            Value::Object(_) => raw.clone(),
            _ => return Err(ParameterError::NotAMapping),
        };

        match operation {
            Operation::Compress => Ok(JobParameters::Compress),
            Operation::ExtractAudio => Ok(JobParameters::ExtractAudio),
            Operation::Resolution => {
                let input: ResolutionInput = decode(operation, raw)?;
                input
                    .validate()
                    .map_err(|e| ParameterError::invalid(operation, describe(&e)))?;
                input
                    .check_upper_bound()
                    .map_err(|reason| ParameterError::invalid(operation, reason))?;
                Ok(JobParameters::Resolution {
                    width: input.width as u32,
                    height: input.height as u32,
                })
            }
            Operation::AspectRatio => {
                let input: AspectRatioInput = decode(operation, raw)?;
                let aspect_ratio = input
                    .aspect_ratio
                    .parse()
                    .map_err(|e| ParameterError::invalid(operation, format!("{e}")))?;
                Ok(JobParameters::AspectRatio { aspect_ratio })
            }
            Operation::Gif | Operation::Webm => {
                let window: ClipWindow = decode(operation, raw)?;
                window
                    .validate()
                    .map_err(|e| ParameterError::invalid(operation, describe(&e)))?;
                if operation == Operation::Gif {
                    Ok(JobParameters::Gif(window))
                } else {
                    Ok(JobParameters::Webm(window))
                }
            }
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            JobParameters::Compress => Operation::Compress,
            JobParameters::Resolution { .. } => Operation::Resolution,
            JobParameters::AspectRatio { .. } => Operation::AspectRatio,
            JobParameters::ExtractAudio => Operation::ExtractAudio,
            JobParameters::Gif(_) => Operation::Gif,
            JobParameters::Webm(_) => Operation::Webm,
        }
    }

    /// Clip window for gif / webm jobs.
    pub fn clip_window(&self) -> Option<ClipWindow> {
        match self {
            JobParameters::Gif(w) | JobParameters::Webm(w) => Some(*w),
            _ => None,
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    operation: Operation,
    raw: Value,
) -> Result<T, ParameterError> {
    serde_json::from_value(raw).map_err(|e| ParameterError::invalid(operation, e.to_string()))
}

/// Flatten validator errors into a stable, human-readable description.
fn describe(errors: &ValidationErrors) -> String {
    let mut messages: Vec<String> = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |err| match &err.message {
                Some(msg) => msg.to_string(),
                None => format!("{field} is invalid"),
            })
        })
        .collect();
    messages.sort();
    messages.join("; ")
}

/// Parameter validation failure.
#[derive(Debug, Error, PartialEq)]
pub enum ParameterError {
    #[error("parameters must be a JSON object")]
    NotAMapping,

    #[error("invalid parameters for {operation}: {reason}")]
    Invalid { operation: Operation, reason: String },
}

impl ParameterError {
    pub fn invalid(operation: Operation, reason: impl Into<String>) -> Self {
        Self::Invalid {
            operation,
            reason: reason.into(),
        }
    }
}
