//! Codec seam

use bytes::Bytes;
use depthrelay_core::Frame;

use crate::config::VideoCodecPreference;
use crate::Result;

/// Turns depacketized RTP payloads into raw frames
pub trait FrameDecoder: Send {
    /// Feed one RTP payload
    ///
    /// Returns a frame once `marker` closes a complete access unit. `timestamp`
    /// is the RTP timestamp (90 kHz for video) and becomes the frame's pts.
    fn push_packet(&mut self, payload: &[u8], timestamp: u32, marker: bool)
        -> depthrelay_core::Result<Option<Frame>>;
}

/// Turns raw frames into an encoded bitstream for one sample
pub trait FrameEncoder: Send {
    /// Encode one frame
    fn encode(&mut self, frame: &Frame) -> depthrelay_core::Result<Bytes>;
}

/// Supplies codec instances per track
pub trait MediaCodecFactory: Send + Sync {
    /// Decoder for a received track with the given MIME type
    fn decoder(&self, mime_type: &str) -> Result<Box<dyn FrameDecoder>>;

    /// Encoder for an outbound track using `codec`
    fn encoder(&self, codec: &VideoCodecPreference) -> Result<Box<dyn FrameEncoder>>;
}
