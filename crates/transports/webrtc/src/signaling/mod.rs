//! Signaling channel to the rendezvous service
//!
//! [`SignalingChannel`] is the only process-wide shared object: every session
//! emits through it and the router demultiplexes its inbound events.
//! Two adapters are provided:
//!
//! - [`WebSocketSignaling`]: JSON-RPC 2.0 over WebSocket
//! - [`InMemorySignaling`]: deterministic in-process channel for tests

pub mod dispatch;
pub mod memory;
pub mod protocol;
pub mod websocket;

pub use dispatch::{EventDispatcher, EventStream};
pub use memory::{CallBehavior, InMemorySignaling};
pub use protocol::{
    events, AnswerReceived, IceCandidate, IceCandidateReceived, InboundEvent, OfferAvailable,
    PublishAnswer, SdpType, SendIceCandidate, SessionDescription,
};
pub use websocket::WebSocketSignaling;

use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// Bidirectional event transport to the rendezvous service
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Fire-and-forget emit
    ///
    /// Fails with `ConnectionError` once the channel is disconnected.
    async fn emit(&self, event: &str, payload: serde_json::Value) -> Result<()>;

    /// Emit and wait for the remote acknowledgment
    ///
    /// Fails with `TimeoutError` when no acknowledgment arrives within
    /// `timeout`, and with `ConnectionError` if the channel drops meanwhile.
    async fn call(
        &self,
        event: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value>;

    /// Lazy, unbounded sequence of payloads delivered under `event`
    ///
    /// The stream ends when the channel disconnects and cannot be restarted;
    /// subscribing after disconnect yields an already-ended stream.
    fn subscribe(&self, event: &str) -> EventStream;

    /// Whether the channel is still connected
    fn is_connected(&self) -> bool;

    /// Close the channel; idempotent
    async fn disconnect(&self) -> Result<()>;
}
