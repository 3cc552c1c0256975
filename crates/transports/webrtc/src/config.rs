//! Configuration types for the relay

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Prefix for environment-variable overrides
pub const ENV_PREFIX: &str = "DEPTHRELAY_";

/// Main configuration for the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Rendezvous service URL (ws:// or wss://)
    pub signaling_url: String,

    /// Credentials presented when connecting to the rendezvous service
    pub credentials: Credentials,

    /// The only peer identity trusted as an offer source
    pub authorized_offerer: String,

    /// Peer id announced for the inbound (receiver) connection
    pub receiver_label: String,

    /// Peer id announced for the outbound (forwarder) connection
    pub forwarder_label: String,

    /// STUN server URLs
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Timeout for acknowledged signaling calls, in milliseconds (default: 10000)
    pub ack_timeout_ms: u64,

    /// Relay queue capacity per synthetic track (default: 60)
    pub queue_capacity: usize,

    /// Per-frame deadline for the transform collaborator, in milliseconds
    pub transform_timeout_ms: u64,

    /// Outgoing framerate for synthetic tracks (default: 30)
    pub outgoing_framerate: u32,

    /// Hold outgoing frames back to the outgoing framerate
    pub pace_outgoing: bool,

    /// Maximum concurrent sessions
    pub max_sessions: usize,

    /// Outbound video codec preference, most preferred first
    pub video_codecs: Vec<VideoCodecPreference>,
}

/// Username/password pair for the rendezvous service
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// User name (also the identity other peers see)
    pub user_name: String,

    /// Password
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user_name", &self.user_name)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Supported video codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    /// VP8, tunable bitrate
    VP8,
    /// H.264 constrained baseline
    H264,
}

impl VideoCodec {
    /// MIME type for webrtc-rs
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::VP8 => "video/VP8",
            VideoCodec::H264 => "video/H264",
        }
    }
}

/// One entry of the outbound codec preference list
///
/// These are declared capabilities; nothing in the relay enforces them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoCodecPreference {
    /// Codec
    pub codec: VideoCodec,

    /// RTP payload type
    pub payload_type: u8,

    /// SDP fmtp line
    pub sdp_fmtp_line: String,

    /// RTCP feedback mechanisms as `type` or `type parameter` strings
    pub rtcp_feedback: Vec<String>,
}

impl VideoCodecPreference {
    /// VP8 with bitrate hints and full feedback set
    pub fn vp8() -> Self {
        Self {
            codec: VideoCodec::VP8,
            payload_type: 96,
            sdp_fmtp_line:
                "x-google-start-bitrate=250;x-google-min-bitrate=100;x-google-max-bitrate=500"
                    .to_string(),
            rtcp_feedback: vec![
                "nack".to_string(),
                "nack pli".to_string(),
                "ccm fir".to_string(),
                "goog-remb".to_string(),
            ],
        }
    }

    /// H.264 constrained baseline fallback
    pub fn h264_constrained_baseline() -> Self {
        Self {
            codec: VideoCodec::H264,
            payload_type: 102,
            sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                .to_string(),
            rtcp_feedback: vec!["nack".to_string(), "nack pli".to_string()],
        }
    }

    /// Split each feedback entry into (type, parameter)
    pub fn feedback_pairs(&self) -> Vec<(String, String)> {
        self.rtcp_feedback
            .iter()
            .map(|fb| match fb.split_once(' ') {
                Some((typ, param)) => (typ.to_string(), param.to_string()),
                None => (fb.clone(), String::new()),
            })
            .collect()
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8181".to_string(),
            credentials: Credentials {
                user_name: "server".to_string(),
                password: "x".to_string(),
            },
            authorized_offerer: "camera-module".to_string(),
            receiver_label: "server-in".to_string(),
            forwarder_label: "server".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            ack_timeout_ms: 10_000,
            queue_capacity: depthrelay_core::relay::DEFAULT_QUEUE_CAPACITY,
            transform_timeout_ms: 1_000,
            outgoing_framerate: 30,
            pace_outgoing: true,
            max_sessions: 4,
            video_codecs: vec![
                VideoCodecPreference::vp8(),
                VideoCodecPreference::h264_constrained_baseline(),
            ],
        }
    }
}

impl RelayConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `signaling_url` is not a ws:// or wss:// URL
    /// - any timeout, `queue_capacity`, `outgoing_framerate` or `max_sessions` is zero
    /// - `video_codecs` is empty
    /// - a STUN/TURN url has the wrong scheme
    /// - `receiver_label` equals `forwarder_label`
    pub fn validate(&self) -> Result<()> {
        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        if self.authorized_offerer.is_empty() {
            return Err(Error::InvalidConfig(
                "authorized_offerer must not be empty".to_string(),
            ));
        }

        if self.receiver_label == self.forwarder_label {
            return Err(Error::InvalidConfig(format!(
                "receiver_label and forwarder_label must differ, both are '{}'",
                self.receiver_label
            )));
        }

        for url in &self.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "STUN url must start with stun: or stuns:, got {}",
                    url
                )));
            }
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN url must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        if self.ack_timeout_ms == 0 {
            return Err(Error::InvalidConfig("ack_timeout_ms must be > 0".to_string()));
        }
        if self.transform_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "transform_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig("queue_capacity must be > 0".to_string()));
        }
        if self.outgoing_framerate == 0 || self.outgoing_framerate > 240 {
            return Err(Error::InvalidConfig(format!(
                "outgoing_framerate must be in range 1-240, got {}",
                self.outgoing_framerate
            )));
        }
        if self.max_sessions == 0 {
            return Err(Error::InvalidConfig("max_sessions must be > 0".to_string()));
        }
        if self.video_codecs.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one video codec is required".to_string(),
            ));
        }

        Ok(())
    }

    /// Parse a YAML document; missing fields take their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|e| {
            Error::InvalidConfig(format!("Failed to parse relay config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Apply `DEPTHRELAY_*` overrides from the process environment
    pub fn apply_env_overrides(self) -> Result<Self> {
        self.apply_overrides(std::env::vars())
    }

    /// Apply overrides from `(KEY, value)` pairs
    ///
    /// Recognized keys (after the `DEPTHRELAY_` prefix): `SIGNALING_URL`,
    /// `USER_NAME`, `PASSWORD`, `AUTHORIZED_OFFERER`, `ACK_TIMEOUT_MS`,
    /// `QUEUE_CAPACITY`, `TRANSFORM_TIMEOUT_MS`, `OUTGOING_FRAMERATE`,
    /// `MAX_SESSIONS`. Unknown keys are ignored.
    pub fn apply_overrides<I, K, V>(mut self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value: String = value.into();

            match name {
                "SIGNALING_URL" => self.signaling_url = value,
                "USER_NAME" => self.credentials.user_name = value,
                "PASSWORD" => self.credentials.password = value,
                "AUTHORIZED_OFFERER" => self.authorized_offerer = value,
                "ACK_TIMEOUT_MS" => self.ack_timeout_ms = parse_override(name, &value)?,
                "QUEUE_CAPACITY" => self.queue_capacity = parse_override(name, &value)?,
                "TRANSFORM_TIMEOUT_MS" => {
                    self.transform_timeout_ms = parse_override(name, &value)?
                }
                "OUTGOING_FRAMERATE" => self.outgoing_framerate = parse_override(name, &value)?,
                "MAX_SESSIONS" => self.max_sessions = parse_override(name, &value)?,
                _ => {}
            }
        }

        self.validate()?;
        Ok(self)
    }

    /// Acknowledgment timeout as a Duration
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Transform deadline as a Duration
    pub fn transform_timeout(&self) -> Duration {
        Duration::from_millis(self.transform_timeout_ms)
    }

    /// Set the signaling URL
    pub fn with_signaling_url(mut self, url: impl Into<String>) -> Self {
        self.signaling_url = url.into();
        self
    }

    /// Set the authorized offer source
    pub fn with_authorized_offerer(mut self, offerer: impl Into<String>) -> Self {
        self.authorized_offerer = offerer.into();
        self
    }

    /// Set the acknowledgment timeout
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the relay queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the transform deadline
    pub fn with_transform_timeout(mut self, timeout: Duration) -> Self {
        self.transform_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enable or disable outgoing pacing
    pub fn with_pacing(mut self, pace: bool) -> Self {
        self.pace_outgoing = pace;
        self
    }

    /// Set the session bound
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Add TURN servers to this configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }
}

fn parse_override<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        Error::InvalidConfig(format!(
            "{}{} has invalid value '{}'",
            ENV_PREFIX, name, value
        ))
    })
}
