//! Error types for the acquisition pipeline.
//!
//! Only source failures are fatal. Per-frame anomalies (sequence gaps, size
//! mismatches, broken payloads) are counted by the processor and never surface
//! as errors, and recorder I/O failures stay on the writer thread.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Unrecoverable failure reported by a [`DataSource`](crate::source::DataSource).
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("data source unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("data source exhausted")]
    Exhausted,

    #[error("data source I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Errors raised while decoding a wire header.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame header truncated: {len} bytes, need {needed}")]
    Truncated { len: usize, needed: usize },
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level pipeline error.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("acquisition failed: {0}")]
    Source(#[from] SourceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn {stage} thread")]
    Spawn {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("{stage} thread panicked")]
    Panicked { stage: &'static str },
}

impl PipelineError {
    pub(crate) fn spawn(stage: &'static str, source: std::io::Error) -> Self {
        Self::Spawn { stage, source }
    }

    /// Whether this error came from the data source and ended acquisition.
    pub fn is_source_failure(&self) -> bool {
        matches!(self, Self::Source(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_error_display() {
        let err = SourceError::unavailable("device unplugged");
        assert_eq!(err.to_string(), "data source unavailable: device unplugged");
    }

    #[test]
    fn pipeline_error_wraps_source() {
        let err: PipelineError = SourceError::Exhausted.into();
        assert!(err.is_source_failure());
        assert_eq!(err.to_string(), "acquisition failed: data source exhausted");
    }

    #[test]
    fn invalid_state_message() {
        let err = PipelineError::InvalidState {
            operation: "start",
            state: "stopped",
        };
        assert_eq!(err.to_string(), "cannot start while stopped");
        assert!(!err.is_source_failure());
    }

    #[test]
    fn truncated_header_message() {
        let err = FrameError::Truncated { len: 3, needed: 12 };
        assert!(err.to_string().contains("3 bytes"));
    }
}
