//! WebRTC relay sessions for DepthRelay
//!
//! This crate accepts a video stream from an authorized offerer, runs every
//! frame through a transform and republishes both the original and the
//! transformed stream on a second peer connection.
//!
//! # Features
//!
//! - **Dual negotiation**: one state machine, instantiated as receiver
//!   (answers the camera's offer) and forwarder (offers to downstream viewers)
//! - **Trickle ICE**: candidates arriving before the remote description are
//!   buffered per negotiator and flushed in order
//! - **Bounded relay**: drop-oldest frame queues decouple the inbound and
//!   outbound clocks
//! - **JSON-RPC 2.0 signaling**: WebSocket adapter plus an in-memory adapter
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │  SignalingChannel (WebSocket JSON-RPC / in-memory)     │
//! │  ↓                                                     │
//! │  SessionRouter (one per process)                       │
//! │  └─ SessionOrchestrator (one per authorized offer)     │
//! │     ├─ SessionNegotiator [receiver]  ← camera          │
//! │     ├─ TransformStage → FrameRelayQueue ×2             │
//! │     └─ SessionNegotiator [forwarder] → viewers         │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use depthrelay_webrtc::RelayConfig;
//!
//! let config = RelayConfig {
//!     signaling_url: "ws://localhost:8181".to_string(),
//!     max_sessions: 2,
//!     ..Default::default()
//! };
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.queue_capacity, 60);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use depthrelay_core::InvertTransform;
//! use depthrelay_webrtc::{
//!     MediaCodecFactory, RelayConfig, RtcTransportFactory, SessionRouter, WebSocketSignaling,
//! };
//!
//! # async fn example(codecs: Arc<dyn MediaCodecFactory>) -> depthrelay_webrtc::Result<()> {
//! let config = RelayConfig::default();
//! let signaling = WebSocketSignaling::connect(
//!     &config.signaling_url,
//!     &config.credentials,
//!     config.ack_timeout(),
//! )
//! .await?;
//! let factory = RtcTransportFactory::new(&config, codecs)?;
//!
//! let router = SessionRouter::new(
//!     config,
//!     Arc::new(signaling),
//!     Arc::new(factory),
//!     Arc::new(InvertTransform),
//! );
//! let reports = router.run().await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod session;
pub mod signaling;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{Credentials, RelayConfig, TurnServerConfig, VideoCodec, VideoCodecPreference};
pub use error::{Error, Result};
pub use media::{FrameDecoder, FrameEncoder, MediaCodecFactory};
pub use negotiation::{
    IceTrickleBuffer, NegotiationState, NegotiatorId, NegotiatorRole, SessionNegotiator,
};
pub use peer::{
    ConnectionState, PeerTransport, PeerTransportFactory, RtcPeerTransport, RtcTransportFactory,
    TransportEvent,
};
pub use session::{
    CloseReason, SessionHandle, SessionId, SessionOrchestrator, SessionReport, SessionRouter,
    SessionState, SessionStatus, StatusEvent,
};
pub use signaling::{InMemorySignaling, SignalingChannel, WebSocketSignaling};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
