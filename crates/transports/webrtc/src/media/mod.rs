//! Media plumbing between webrtc-rs tracks and relay frames
//!
//! Encoding and decoding are external: the relay only sees the
//! [`FrameDecoder`]/[`FrameEncoder`] seam.

pub mod codec;
pub mod tracks;

pub use codec::{FrameDecoder, FrameEncoder, MediaCodecFactory};
pub use tracks::{RtpFrameSource, SamplePump};
