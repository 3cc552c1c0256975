//! Offer/answer negotiation for one peer connection
//!
//! A session runs two [`SessionNegotiator`]s: the receiver answers the
//! producer's offer, the forwarder offers the relayed tracks to consumers.
//! Both share one state machine and differ only in [`NegotiatorRole`].

pub mod ice;
pub mod negotiator;

pub use ice::IceTrickleBuffer;
pub use negotiator::{CandidateOutcome, NegotiatorOutcome, SessionNegotiator};

use serde::{Deserialize, Serialize};

use crate::session::SessionId;

/// Which side of the relay a negotiator drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiatorRole {
    /// Inbound connection from the producer (answering)
    Receiver,
    /// Outbound connection to consumers (offering)
    Forwarder,
}

impl NegotiatorRole {
    /// Value of `didOffer` in `send-ice-candidate`
    pub fn did_offer(&self) -> bool {
        matches!(self, NegotiatorRole::Forwarder)
    }

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiatorRole::Receiver => "receiver",
            NegotiatorRole::Forwarder => "forwarder",
        }
    }
}

impl std::fmt::Display for NegotiatorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one negotiator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NegotiatorId {
    /// Owning session
    pub session_id: SessionId,
    /// Role within the session
    pub role: NegotiatorRole,
}

impl NegotiatorId {
    /// Create an id
    pub fn new(session_id: SessionId, role: NegotiatorRole) -> Self {
        Self { session_id, role }
    }
}

impl std::fmt::Display for NegotiatorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.session_id, self.role)
    }
}

/// Negotiation state of one peer connection
///
/// Answering path: `Idle -> HaveRemoteOffer -> HaveLocalAnswer -> Connected`.
/// Offering path: `Idle -> HaveLocalOffer -> AwaitingAnswer -> HaveRemoteAnswer -> Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    /// Nothing exchanged yet
    Idle,
    /// Remote offer applied
    HaveRemoteOffer,
    /// Local answer applied and ready to publish
    HaveLocalAnswer,
    /// Local offer applied
    HaveLocalOffer,
    /// Local offer published, waiting for the answer
    AwaitingAnswer,
    /// Remote answer applied
    HaveRemoteAnswer,
    /// Transport reports connected
    Connected,
    /// Transport or negotiation failed
    Failed,
    /// Torn down
    Closed,
}

impl NegotiationState {
    /// `Failed` and `Closed` accept no further transitions except close
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}
