//! Bundled transforms

use super::FrameTransform;
use crate::data::Frame;
use crate::Result;

/// Returns a copy of the input
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughTransform;

impl FrameTransform for PassthroughTransform {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn transform(&self, frame: &Frame) -> Result<Frame> {
        Ok(frame.clone())
    }
}

/// Negates every byte of the frame
///
/// Cheap stand-in for a real model when checking that transformed frames
/// reach the outbound peer.
#[derive(Debug, Default, Clone, Copy)]
pub struct InvertTransform;

impl FrameTransform for InvertTransform {
    fn name(&self) -> &str {
        "invert"
    }

    fn transform(&self, frame: &Frame) -> Result<Frame> {
        let inverted: Vec<u8> = frame.data().iter().map(|b| 255 - b).collect();
        frame.with_data(inverted)
    }
}

/// Adapts a closure into a [`FrameTransform`]
pub struct FnTransform<F> {
    name: String,
    f: F,
}

impl<F> FnTransform<F>
where
    F: Fn(&Frame) -> Result<Frame> + Send + Sync + 'static,
{
    /// Create a named closure transform
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> FrameTransform for FnTransform<F>
where
    F: Fn(&Frame) -> Result<Frame> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(&self, frame: &Frame) -> Result<Frame> {
        (self.f)(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PixelFormat;

    #[test]
    fn test_invert_is_new_frame() {
        let input = Frame::new(2, 1, PixelFormat::Gray8, 5, vec![0u8, 200]).unwrap();
        let out = InvertTransform.transform(&input).unwrap();
        assert_eq!(out.data().as_ref(), &[255, 55]);
        assert_eq!(out.pts(), 5);
        assert_eq!(input.data().as_ref(), &[0, 200]);
    }

    #[test]
    fn test_passthrough() {
        let input = Frame::filled(2, 2, PixelFormat::Gray8, 0, 4).unwrap();
        assert_eq!(PassthroughTransform.transform(&input).unwrap(), input);
    }
}
