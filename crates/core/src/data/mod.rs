//! Frame data model shared by every relay stage
//!
//! - Frame: immutable, timestamped raster image
//! - PixelFormat: raster layouts the relay understands
//! - TrackKind: media kind of a track (only video is relayed)

pub mod frame;

pub use frame::{Frame, PixelFormat, TrackKind, VIDEO_CLOCK_RATE};
