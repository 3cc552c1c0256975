//! Relay sessions
//!
//! A session pairs one receiver and one forwarder negotiator with the relay
//! queues between them. [`SessionOrchestrator`] runs one session;
//! [`SessionRouter`] demultiplexes the shared signaling channel across
//! sessions.

pub mod orchestrator;
pub mod router;

pub use orchestrator::{
    SessionCommand, SessionHandle, SessionOrchestrator, SessionReport, SessionSnapshot,
    ORIGINAL_TRACK_ID, TRANSFORMED_TRACK_ID,
};
pub use router::SessionRouter;

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::negotiation::NegotiatorRole;

/// Unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form keeps log lines readable
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Receiver negotiating, or waiting for the first video track
    Negotiating,
    /// Outbound offer published, frames flowing
    Forwarding,
    /// Tearing down
    Closing,
    /// Both connections closed
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Negotiating => "negotiating",
            SessionState::Forwarding => "forwarding",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Externally observable session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// See [`SessionState::Negotiating`]
    Negotiating,
    /// See [`SessionState::Forwarding`]
    Forwarding,
    /// See [`SessionState::Closing`]
    Closing,
    /// See [`SessionState::Closed`]
    Closed,
    /// The session is closing because something failed
    Failed,
}

impl From<SessionState> for SessionStatus {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Negotiating => SessionStatus::Negotiating,
            SessionState::Forwarding => SessionStatus::Forwarding,
            SessionState::Closing => SessionStatus::Closing,
            SessionState::Closed => SessionStatus::Closed,
        }
    }
}

/// Status change published on the status channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Session the event belongs to
    pub session_id: SessionId,
    /// New status
    pub status: SessionStatus,
    /// When it happened
    pub at: SystemTime,
    /// Close reason or failure detail
    pub detail: Option<String>,
}

/// Why a session closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicit shutdown
    Shutdown,
    /// The inbound video track ended (producer went away)
    TrackEnded,
    /// A peer connection closed on its own
    RemoteClosed(NegotiatorRole),
    /// A peer connection reported failure
    TransportFailed(NegotiatorRole),
    /// Offer/answer handling failed
    NegotiationFailed(String),
    /// The signaling channel disconnected
    SignalingLost,
    /// A supervised task panicked or failed unexpectedly
    TaskFailed(String),
}

impl CloseReason {
    /// Reasons reported as `failed` rather than a plain close
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            CloseReason::TransportFailed(_)
                | CloseReason::NegotiationFailed(_)
                | CloseReason::TaskFailed(_)
        )
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::TrackEnded => write!(f, "track_ended"),
            CloseReason::RemoteClosed(role) => write!(f, "{}_closed", role),
            CloseReason::TransportFailed(role) => write!(f, "{}_failed", role),
            CloseReason::NegotiationFailed(e) => write!(f, "negotiation_failed: {}", e),
            CloseReason::SignalingLost => write!(f, "signaling_lost"),
            CloseReason::TaskFailed(e) => write!(f, "task_failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_display_is_short() {
        let id = SessionId::new();
        assert_eq!(id.to_string().len(), 8);
        assert_ne!(SessionId::new(), id);
    }

    #[test]
    fn test_close_reason_classification() {
        assert!(CloseReason::TransportFailed(NegotiatorRole::Receiver).is_failure());
        assert!(!CloseReason::TrackEnded.is_failure());
        assert!(!CloseReason::SignalingLost.is_failure());
        assert_eq!(
            CloseReason::TransportFailed(NegotiatorRole::Receiver).to_string(),
            "receiver_failed"
        );
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&SessionStatus::Forwarding).unwrap();
        assert_eq!(json, "\"forwarding\"");
    }
}
