//! Received-track seam

use async_trait::async_trait;

use crate::data::{Frame, TrackKind};
use crate::Result;

/// A live, ordered sequence of frames owned by an inbound connection
///
/// `Ok(None)` means the track ended normally (producer went away). An `Err`
/// is a read failure; relays treat both as the end of the track.
#[async_trait]
pub trait FrameSource: Send {
    /// Track identifier
    fn id(&self) -> &str;

    /// Media kind
    fn kind(&self) -> TrackKind;

    /// Receive the next frame
    async fn next_frame(&mut self) -> Result<Option<Frame>>;
}
