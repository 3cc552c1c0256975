//! Error types for the DepthRelay WebRTC transport

/// Result type alias using the transport Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while signaling, negotiating or relaying
///
/// The first group mirrors how failures propagate: `ConnectionError` is
/// process-fatal, negotiation-class errors abort one session, `TimeoutError`
/// and `TransformError` degrade a session without closing it, and
/// `TrackError` marks a normal end of media.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Signaling transport unreachable or lost
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Malformed offer or answer, or a step taken in the wrong state
    #[error("Negotiation error: {0}")]
    NegotiationError(String),

    /// Offer declared an originator other than the authorized peer
    #[error("Unauthorized offer from '{offerer}' (expected '{expected}')")]
    UnauthorizedOffer {
        /// Declared originator
        offerer: String,
        /// Authorized originator
        expected: String,
    },

    /// Signaling acknowledgment not received in time
    #[error("Operation timeout: {0}")]
    TimeoutError(String),

    /// Inbound track ended or failed
    #[error("Media track error: {0}")]
    TrackError(String),

    /// Transform collaborator failed
    #[error("Transform error: {0}")]
    TransformError(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling protocol error (bad payload, unexpected response)
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Session limit reached
    #[error("Session limit exceeded: {0}")]
    SessionLimitExceeded(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<depthrelay_core::Error> for Error {
    fn from(err: depthrelay_core::Error) -> Self {
        use depthrelay_core::Error as CoreError;

        match err {
            CoreError::InvalidConfig(msg) => Error::InvalidConfig(msg),
            CoreError::TrackEnded(msg) => Error::TrackError(msg),
            CoreError::InvalidFrame(msg) => Error::TrackError(format!("invalid frame: {}", msg)),
            CoreError::Io(e) => Error::IoError(e),
            CoreError::Other(e) => Error::Other(e),
            other => Error::TransformError(other.to_string()),
        }
    }
}

impl Error {
    /// Errors that should stop the whole process (signaling lost)
    pub fn is_process_fatal(&self) -> bool {
        matches!(self, Error::ConnectionError(_))
    }

    /// Errors that abort the session they occur in, and only that session
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::NegotiationError(_)
                | Error::UnauthorizedOffer { .. }
                | Error::SdpError(_)
                | Error::IceCandidateError(_)
                | Error::WebRtcError(_)
        )
    }

    /// Errors after which the session continues in a degraded mode
    pub fn is_degraded(&self) -> bool {
        matches!(self, Error::TimeoutError(_) | Error::TransformError(_))
    }

    /// Errors that signal an expected end of media rather than a failure
    pub fn is_normal_termination(&self) -> bool {
        matches!(self, Error::TrackError(_))
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("test".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: test");

        let err = Error::UnauthorizedOffer {
            offerer: "intruder".to_string(),
            expected: "camera-module".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Unauthorized offer from 'intruder' (expected 'camera-module')"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::ConnectionError("down".into()).is_process_fatal());
        assert!(!Error::NegotiationError("bad".into()).is_process_fatal());

        assert!(Error::NegotiationError("bad".into()).is_session_fatal());
        assert!(!Error::TimeoutError("ack".into()).is_session_fatal());

        assert!(Error::TimeoutError("ack".into()).is_degraded());
        assert!(Error::TransformError("model".into()).is_degraded());

        assert!(Error::TrackError("ended".into()).is_normal_termination());
        assert!(!Error::TrackError("ended".into()).is_session_fatal());
    }

    #[test]
    fn test_core_error_conversion() {
        let err: Error = depthrelay_core::Error::TransformTimeout { timeout_ms: 5 }.into();
        assert!(matches!(err, Error::TransformError(_)));

        let err: Error = depthrelay_core::Error::TrackEnded("eof".into()).into();
        assert!(err.is_normal_termination());

        let err: Error = depthrelay_core::Error::InvalidConfig("cap".into()).into();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::IoError(_)));
    }
}
