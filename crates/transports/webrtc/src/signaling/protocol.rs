//! Signaling event names, payloads and the JSON-RPC 2.0 envelope
//!
//! Payload field names follow the rendezvous service's camelCase wire format.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Event names exchanged with the rendezvous service
pub mod events {
    /// Inbound: one or more offers waiting for an answer
    pub const OFFER_AVAILABLE: &str = "offer-available";
    /// Inbound: a single offer published after we connected
    pub const NEW_OFFER: &str = "new-offer";
    /// Inbound: answer to an offer we published
    pub const ANSWER_RECEIVED: &str = "answer-received";
    /// Inbound: trickled ICE candidate from a remote peer
    pub const ICE_CANDIDATE_RECEIVED: &str = "ice-candidate-received";

    /// Outbound: ask for every offer currently waiting
    pub const REQUEST_OFFERS: &str = "request-offers";
    /// Outbound: publish our outbound offer
    pub const PUBLISH_OFFER: &str = "publish-offer";
    /// Outbound (acknowledged): publish an answer, ack carries offerer ICE candidates
    pub const PUBLISH_ANSWER: &str = "publish-answer";
    /// Outbound: trickle a local ICE candidate
    pub const SEND_ICE_CANDIDATE: &str = "send-ice-candidate";

    /// Outbound (acknowledged): present credentials after connecting
    pub const AUTHENTICATE: &str = "authenticate";
}

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// SDP blob plus its type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// SDP text
    pub sdp: String,

    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
}

impl SessionDescription {
    /// Offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Offer,
        }
    }

    /// Answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Answer,
        }
    }
}

/// Payload of `offer-available` and `new-offer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferAvailable {
    /// Declared originator of the offer
    pub offerer_id: String,

    /// The offer
    pub offer: SessionDescription,
}

/// Payload of `publish-answer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishAnswer {
    /// Offerer this answer responds to
    pub offerer_id: String,

    /// The answer
    pub answer: SessionDescription,
}

/// Payload of `answer-received`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerReceived {
    /// Peer that answered our offer
    pub answerer_id: String,

    /// The answer
    pub answer: SessionDescription,
}

/// ICE candidate as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,

    /// Media line index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate without routing tags
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Payload of `ice-candidate-received`
///
/// `peerId` is optional; when present it names the offerer whose session the
/// candidate belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateReceived {
    /// The candidate
    #[serde(flatten)]
    pub candidate: IceCandidate,

    /// Optional session routing hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
}

/// Payload of `send-ice-candidate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendIceCandidate {
    /// Whether the candidate belongs to the offering side
    pub did_offer: bool,

    /// Our peer id for that side
    pub peer_id: String,

    /// The candidate
    pub ice_candidate: IceCandidate,
}

/// Credentials presented in `authenticate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateParams {
    /// User name
    pub user_name: String,

    /// Password
    pub password: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckCandidates {
    #[serde(default)]
    ice_candidates: Vec<IceCandidate>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AckShape {
    Bare(Vec<IceCandidate>),
    Wrapped(AckCandidates),
}

/// Typed inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// `offer-available` or `new-offer`
    Offers(Vec<OfferAvailable>),
    /// `answer-received`
    Answer(AnswerReceived),
    /// `ice-candidate-received`
    IceCandidate(IceCandidateReceived),
}

impl InboundEvent {
    /// Parse a payload delivered under `event`
    pub fn parse(event: &str, payload: serde_json::Value) -> Result<Self> {
        match event {
            events::OFFER_AVAILABLE | events::NEW_OFFER => {
                let offers: OneOrMany<OfferAvailable> = from_value(event, payload)?;
                Ok(InboundEvent::Offers(match offers {
                    OneOrMany::Many(v) => v,
                    OneOrMany::One(o) => vec![o],
                }))
            }
            events::ANSWER_RECEIVED => Ok(InboundEvent::Answer(from_value(event, payload)?)),
            events::ICE_CANDIDATE_RECEIVED => {
                Ok(InboundEvent::IceCandidate(from_value(event, payload)?))
            }
            other => Err(Error::SignalingError(format!(
                "Unexpected inbound event: {}",
                other
            ))),
        }
    }
}

/// Extract the offerer ICE candidates carried by a `publish-answer` ack
///
/// Accepts `null`, a bare candidate array, or `{ "iceCandidates": [...] }`.
pub fn parse_answer_ack(payload: serde_json::Value) -> Result<Vec<IceCandidate>> {
    if payload.is_null() {
        return Ok(Vec::new());
    }

    let shape: AckShape = from_value(events::PUBLISH_ANSWER, payload)?;
    Ok(match shape {
        AckShape::Bare(v) => v,
        AckShape::Wrapped(w) => w.ice_candidates,
    })
}

/// Serialize a payload struct into a JSON value
pub fn to_value<T: Serialize>(payload: &T) -> Result<serde_json::Value> {
    serde_json::to_value(payload).map_err(|e| {
        Error::SerializationError(format!("Failed to serialize signaling payload: {}", e))
    })
}

fn from_value<T: serde::de::DeserializeOwned>(event: &str, payload: serde_json::Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|e| Error::SerializationError(format!("Invalid {} payload: {}", event, e)))
}

/// JSON-RPC 2.0 protocol version
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request (or notification when `id` is absent)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    /// Protocol version (must be "2.0")
    pub jsonrpc: String,

    /// Method name (the event name)
    pub method: String,

    /// Method parameters (the event payload)
    #[serde(default)]
    pub params: serde_json::Value,

    /// Request ID for matching with response (absent for notifications)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

/// JSON-RPC 2.0 response (success)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    /// Protocol version (must be "2.0")
    pub jsonrpc: String,

    /// Result data
    pub result: serde_json::Value,

    /// Request ID this response corresponds to
    pub id: serde_json::Value,
}

/// JSON-RPC 2.0 error response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    /// Protocol version (must be "2.0")
    pub jsonrpc: String,

    /// Error details
    pub error: ErrorObject,

    /// Request ID this error corresponds to
    pub id: serde_json::Value,
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    /// Error code
    pub code: i32,

    /// Human-readable error message
    pub message: String,

    /// Additional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Any message the rendezvous service may send us
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// Server-initiated event (or a request we do not answer)
    Request(JsonRpcRequest),
    /// Successful reply to one of our calls
    Response(JsonRpcResponse),
    /// Failed reply to one of our calls
    Error(JsonRpcError),
}

impl IncomingMessage {
    /// Classify a text frame
    pub fn from_json(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json).map_err(|e| {
            Error::SerializationError(format!("Failed to parse signaling message: {}", e))
        })?;

        let parsed = if value.get("method").is_some() {
            serde_json::from_value(value).map(IncomingMessage::Request)
        } else if value.get("error").is_some() {
            serde_json::from_value(value).map(IncomingMessage::Error)
        } else {
            serde_json::from_value(value).map(IncomingMessage::Response)
        };

        parsed.map_err(|e| {
            Error::SerializationError(format!("Malformed JSON-RPC message: {}", e))
        })
    }
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request
    pub fn new(method: impl Into<String>, params: serde_json::Value, id: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize JSON-RPC request: {}", e))
        })
    }
}

impl JsonRpcResponse {
    /// Create a new JSON-RPC response
    pub fn new(result: serde_json::Value, id: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result,
            id,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize JSON-RPC response: {}", e))
        })
    }
}
