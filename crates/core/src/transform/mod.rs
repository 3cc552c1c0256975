//! Per-frame transform stage
//!
//! The transform itself (depth estimation, filters, ...) is an external
//! collaborator behind [`FrameTransform`]. [`TransformStage`] wraps it with
//! a deadline and a passthrough fallback so a broken or slow collaborator
//! never stalls the relay.

pub mod builtin;
pub mod stage;

pub use builtin::{FnTransform, InvertTransform, PassthroughTransform};
pub use stage::{TransformStage, TransformStats, DEFAULT_TRANSFORM_TIMEOUT};

use crate::data::Frame;
use crate::Result;

/// Maps one frame to a new frame
///
/// Implementations run on the blocking thread pool and may be slow. They
/// must not mutate the input; return a new frame instead.
pub trait FrameTransform: Send + Sync + 'static {
    /// Transform name (used in logs)
    fn name(&self) -> &str;

    /// Produce the transformed frame
    fn transform(&self, frame: &Frame) -> Result<Frame>;
}
