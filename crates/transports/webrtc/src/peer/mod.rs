//! Peer connection seam
//!
//! The negotiator never touches webrtc-rs directly. It drives a
//! [`PeerTransport`] and consumes the transport's callbacks as a stream of
//! [`TransportEvent`]s, which keeps the state machine testable without a
//! network.

pub mod connection;

pub use connection::{RtcPeerTransport, RtcTransportFactory};

use std::sync::Arc;

use async_trait::async_trait;
use depthrelay_core::{FrameSource, SyntheticTrack, TrackKind};
use tokio::sync::mpsc;

use crate::signaling::{IceCandidate, SessionDescription};
use crate::Result;

/// Peer connection state as seen by the negotiator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Initial state, connection not yet started
    New,
    /// Connection negotiation (or ICE recovery) in progress
    Connecting,
    /// Connection established successfully
    Connected,
    /// Connection failed
    Failed,
    /// Connection closed
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Callback from the underlying transport
pub enum TransportEvent {
    /// A local ICE candidate was gathered
    IceCandidate(IceCandidate),
    /// Local ICE gathering finished
    IceGatheringComplete,
    /// Connection state changed
    StateChanged(ConnectionState),
    /// The remote side added a track
    RemoteTrack(Box<dyn FrameSource>),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            TransportEvent::IceGatheringComplete => f.write_str("IceGatheringComplete"),
            TransportEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            TransportEvent::RemoteTrack(track) => f
                .debug_struct("RemoteTrack")
                .field("id", &track.id())
                .field("kind", &track.kind())
                .finish(),
        }
    }
}

/// Receiving half of a transport's callbacks
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Operations the negotiator needs from a peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Label used in logs and signaling (e.g. "server-in")
    fn label(&self) -> &str;

    /// Apply the remote offer or answer
    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()>;

    /// Generate a local offer (not yet applied)
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Generate a local answer to the applied remote offer (not yet applied)
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a locally generated description
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()>;

    /// Apply a remote ICE candidate; only valid once a remote description is set
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Attach a synthetic track so it is declared in the next offer
    async fn add_track(&self, track: Arc<SyntheticTrack>) -> Result<()>;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// A freshly created transport together with its callback stream
pub struct PeerHandle {
    /// The transport
    pub transport: Arc<dyn PeerTransport>,
    /// Callbacks from the transport
    pub events: TransportEvents,
}

/// Creates one transport per negotiator
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    /// Create a transport labelled `label`
    async fn create(&self, label: &str) -> Result<PeerHandle>;
}

/// Whether a remote track should be relayed
pub fn is_relayable(kind: TrackKind) -> bool {
    kind == TrackKind::Video
}
