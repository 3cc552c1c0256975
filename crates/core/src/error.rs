//! Error types for DepthRelay Core

use thiserror::Error;

/// Result type alias for DepthRelay Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the relay core
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (zero capacity, zero framerate, ...)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Frame does not satisfy its own layout (size mismatch, odd YUV dimensions)
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// The transform collaborator returned an error
    #[error("Transform failed: {0}")]
    TransformFailed(String),

    /// The transform collaborator exceeded its deadline
    #[error("Transform timeout after {timeout_ms}ms")]
    TransformTimeout {
        /// Deadline that was exceeded, in milliseconds
        timeout_ms: u64,
    },

    /// An earlier invocation of the transform collaborator is still running
    #[error("Transform busy: {0}")]
    TransformBusy(String),

    /// The transform collaborator panicked
    #[error("Transform panicked: {0}")]
    TransformPanicked(String),

    /// A received track ended or failed while reading
    #[error("Track ended: {0}")]
    TrackEnded(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether this error came out of the transform collaborator
    pub fn is_transform_error(&self) -> bool {
        matches!(
            self,
            Error::TransformFailed(_)
                | Error::TransformTimeout { .. }
                | Error::TransformBusy(_)
                | Error::TransformPanicked(_)
        )
    }
}
