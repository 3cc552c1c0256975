//! Frame and pixel-format types
//!
//! A [`Frame`] is immutable once built: transforms allocate a new frame via
//! [`Frame::with_data`] rather than editing pixels in place. The pixel buffer
//! is a [`Bytes`], so cloning a frame (e.g. to feed both the "original" and
//! "transformed" queues) never copies pixel data.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// RTP clock rate for video tracks (90 kHz)
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Pixel format for raw video frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// YUV 4:2:0 planar
    /// Layout: Y plane (width*height), U plane (width/2 * height/2), V plane (width/2 * height/2)
    Yuv420p,

    /// NV12 (semi-planar, Y plane + interleaved UV)
    Nv12,

    /// Packed 24-bit RGB
    Rgb24,

    /// Packed 32-bit RGBA
    Rgba32,

    /// Single 8-bit channel (depth maps, luma-only frames)
    Gray8,
}

impl PixelFormat {
    /// Expected buffer size in bytes for a frame of the given dimensions
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Yuv420p | PixelFormat::Nv12 => pixels * 3 / 2,
            PixelFormat::Rgb24 => pixels * 3,
            PixelFormat::Rgba32 => pixels * 4,
            PixelFormat::Gray8 => pixels,
        }
    }

    /// Check if format requires even dimensions (chroma-subsampled formats)
    pub fn requires_even_dimensions(&self) -> bool {
        matches!(self, PixelFormat::Yuv420p | PixelFormat::Nv12)
    }
}

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Video track
    Video,
    /// Audio track
    Audio,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::Audio => write!(f, "audio"),
        }
    }
}

/// A timestamped raster image
///
/// `pts` is expressed in units of the owning track's clock (90 kHz for video).
/// Received frames carry the inbound clock; frames written to a synthetic
/// track are restamped by that track's outgoing clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    format: PixelFormat,
    pts: i64,
    data: Bytes,
}

impl Frame {
    /// Build a frame, validating that `data` matches the declared layout
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        pts: i64,
        data: impl Into<Bytes>,
    ) -> Result<Self> {
        let data = data.into();

        if width == 0 || height == 0 {
            return Err(Error::InvalidFrame(format!(
                "dimensions must be non-zero, got {}x{}",
                width, height
            )));
        }

        if format.requires_even_dimensions() && (width % 2 != 0 || height % 2 != 0) {
            return Err(Error::InvalidFrame(format!(
                "{:?} requires even dimensions, got {}x{}",
                format, width, height
            )));
        }

        let expected = format.buffer_size(width, height);
        if data.len() != expected {
            return Err(Error::InvalidFrame(format!(
                "{:?} {}x{} expects {} bytes, got {}",
                format,
                width,
                height,
                expected,
                data.len()
            )));
        }

        Ok(Self {
            width,
            height,
            format,
            pts,
            data,
        })
    }

    /// Frame of the given format with every byte set to `value`
    pub fn filled(width: u32, height: u32, format: PixelFormat, pts: i64, value: u8) -> Result<Self> {
        let size = format.buffer_size(width, height);
        Self::new(width, height, format, pts, vec![value; size])
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel format
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Presentation timestamp in track clock units
    pub fn pts(&self) -> i64 {
        self.pts
    }

    /// Raw pixel bytes
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// New frame with the same geometry and timestamp but different pixels
    ///
    /// Fails if `data` does not fit the geometry; a transform that changes
    /// dimensions should use [`Frame::new`] instead.
    pub fn with_data(&self, data: impl Into<Bytes>) -> Result<Self> {
        Self::new(self.width, self.height, self.format, self.pts, data)
    }

    /// Same pixels, different timestamp
    pub fn with_pts(&self, pts: i64) -> Self {
        Self {
            pts,
            ..self.clone()
        }
    }
}
