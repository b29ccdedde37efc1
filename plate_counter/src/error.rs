use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures that stop a run before it produces a summary.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("frame source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("could not connect to {uri} within {timeout:?}")]
    ConnectionTimeout { uri: String, timeout: Duration },
    #[error("invalid run configuration: {0}")]
    InvalidConfig(String),
    #[error("{} is {bytes} bytes, the limit is {limit} bytes", path.display())]
    SourceTooLarge {
        path: PathBuf,
        bytes: u64,
        limit: u64,
    },
}

impl PipelineError {
    pub fn source_unavailable(message: impl Into<String>) -> Self {
        Self::SourceUnavailable(message.into())
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

/// A single frame could not be turned into a usable image.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame {frame_index} could not be decoded: {reason}")]
    Decode { frame_index: u64, reason: String },
    #[error("buffer of {actual} bytes does not match {width}x{height}x{channels}")]
    InvalidBuffer {
        width: u32,
        height: u32,
        channels: u8,
        actual: usize,
    },
}

impl FrameError {
    pub fn decode(frame_index: u64, reason: impl ToString) -> Self {
        Self::Decode {
            frame_index,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("plate detector failed: {0}")]
    Detector(String),
    #[error("plate recognizer failed: {0}")]
    Recognizer(String),
    #[error("model could not be loaded from {path}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },
}

impl InferenceError {
    pub fn detector(reason: impl ToString) -> Self {
        Self::Detector(reason.to_string())
    }

    pub fn recognizer(reason: impl ToString) -> Self {
        Self::Recognizer(reason.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("counter store {path} is not valid json: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("counter store lock poisoned")]
    Poisoned,
}
