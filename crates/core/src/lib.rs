//! DepthRelay Core
//!
//! Transport-agnostic building blocks for relaying live video through a
//! per-frame transform.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  FrameSource (received track)                            │
//! │  ↓ next_frame()                                          │
//! │  TransformStage ── FrameTransform (external, may fail)   │
//! │  ↓ apply() (passthrough on failure/timeout)             │
//! │  FrameRelayQueue × N (bounded, drop-oldest)              │
//! │  ↓ pull()                                                │
//! │  SyntheticTrack (restamped by OutgoingClock)             │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use depthrelay_core::data::{Frame, PixelFormat};
//! use depthrelay_core::relay::{FrameRelayQueue, PushOutcome};
//!
//! let queue = FrameRelayQueue::new("original", 2).unwrap();
//! for pts in 0..3 {
//!     let frame = Frame::filled(2, 2, PixelFormat::Gray8, pts, 0).unwrap();
//!     queue.push(frame);
//! }
//! // Oldest frame was evicted
//! assert_eq!(queue.try_pull().unwrap().pts(), 1);
//! ```

#![warn(clippy::all)]

pub mod data;
pub mod error;
pub mod relay;
pub mod transform;

pub use data::{Frame, PixelFormat, TrackKind, VIDEO_CLOCK_RATE};
pub use error::{Error, Result};
pub use relay::{
    FrameRelayQueue, FrameSource, OutgoingClock, PushOutcome, QueueStats, SyntheticTrack,
    DEFAULT_QUEUE_CAPACITY,
};
pub use transform::{
    FnTransform, FrameTransform, InvertTransform, PassthroughTransform, TransformStage,
    TransformStats,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
