//! Synthetic outbound track backed by a relay queue

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::clock::OutgoingClock;
use super::queue::FrameRelayQueue;
use crate::data::{Frame, TrackKind, VIDEO_CLOCK_RATE};
use crate::Result;

struct ClockState {
    clock: OutgoingClock,
    origin: Option<Instant>,
}

/// Track whose frames are pushed by the relay and drawn by the outbound
/// connection on demand
///
/// Each frame drawn via [`SyntheticTrack::recv`] is restamped with the
/// track's own [`OutgoingClock`]. With pacing enabled, `recv` also holds the
/// caller back so frames leave at the configured framerate.
pub struct SyntheticTrack {
    id: String,
    kind: TrackKind,
    queue: Arc<FrameRelayQueue>,
    state: Mutex<ClockState>,
    pace: bool,
}

impl SyntheticTrack {
    /// Create a video track drawing from `queue`
    pub fn video(
        id: impl Into<String>,
        queue: Arc<FrameRelayQueue>,
        framerate: u32,
        pace: bool,
    ) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            kind: TrackKind::Video,
            queue,
            state: Mutex::new(ClockState {
                clock: OutgoingClock::new(VIDEO_CLOCK_RATE, framerate)?,
                origin: None,
            }),
            pace,
        })
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Media kind
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Backing queue
    pub fn queue(&self) -> &Arc<FrameRelayQueue> {
        &self.queue
    }

    /// Duration of one outgoing frame
    pub fn frame_duration(&self) -> std::time::Duration {
        self.state.lock().clock.frame_duration()
    }

    /// Draw the next frame, restamped with the outgoing clock
    ///
    /// Returns `None` once the backing queue is closed.
    pub async fn recv(&self) -> Option<Frame> {
        let frame = self.queue.pull().await?;

        let (pts, deadline) = {
            let mut state = self.state.lock();
            let pts = state.clock.tick();
            let origin = *state.origin.get_or_insert_with(Instant::now);
            (pts, origin + state.clock.offset_of(pts))
        };

        if self.pace {
            tokio::time::sleep_until(deadline).await;
        }

        if pts == 0 {
            debug!(track = %self.id, "First frame drawn from synthetic track");
        }

        Some(frame.with_pts(pts))
    }
}

impl std::fmt::Debug for SyntheticTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntheticTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("pace", &self.pace)
            .finish()
    }
}
