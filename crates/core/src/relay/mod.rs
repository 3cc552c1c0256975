//! Frame relay primitives
//!
//! Frames flow from a received track ([`FrameSource`]) through the transform
//! stage into one [`FrameRelayQueue`] per downstream [`SyntheticTrack`]. The
//! synthetic track restamps every frame with its own [`OutgoingClock`], so the
//! outbound timeline is independent of upstream gaps and duplicates.

pub mod clock;
pub mod queue;
pub mod source;
pub mod synthetic;

pub use clock::OutgoingClock;
pub use queue::{FrameRelayQueue, PushOutcome, QueueStats, DEFAULT_QUEUE_CAPACITY};
pub use source::FrameSource;
pub use synthetic::SyntheticTrack;
