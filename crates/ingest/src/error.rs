use crate::frame::SourceId;
use std::io;
use thiserror::Error;

/// Failures of the capture primitive behind a source.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to open stream {target}: {reason}")]
    Open { target: String, reason: String },

    #[error("Failed to read frame: {0}")]
    Read(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl CaptureError {
    pub fn open(target: impl Into<String>, reason: impl ToString) -> Self {
        CaptureError::Open {
            target: target.into(),
            reason: reason.to_string(),
        }
    }
}

/// Why an envelope could not be placed on the shared channel.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishError {
    #[error("Channel stayed full for the whole publish timeout")]
    Timeout,

    #[error("Channel closed")]
    Closed,
}

/// Invalid pipeline description, reported before any worker starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("At least one source is required")]
    NoSources,

    #[error("Source {index}: unknown kind `{kind}` (expected `device` or `file`)")]
    UnknownKind { index: usize, kind: String },

    #[error("Source {index}: invalid target `{target}`: {reason}")]
    InvalidTarget {
        index: usize,
        target: String,
        reason: String,
    },

    #[error("Source {index}: fps must be a finite number no greater than 1000, got {fps}")]
    InvalidFps { index: usize, fps: f64 },

    #[error("Duplicate source id `{0}`")]
    DuplicateSource(SourceId),

    #[error("Channel capacity must be greater than zero")]
    ZeroCapacity,
}
