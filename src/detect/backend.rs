use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Object detection capability.
///
/// Each inference worker owns its own instance, so `detect` takes `&mut self`
/// and implementations need only be `Send`. Implementations must treat the
/// frame as read-only and must not retain pixels past the call.
pub trait Detector: Send {
    /// Run detection on one frame. Errors are treated by the caller as
    /// "no detections this frame".
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Backend identifier.
    fn name(&self) -> &'static str {
        "custom"
    }

    /// Optional warm-up hook, called once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<F> Detector for F
where
    F: FnMut(&Frame) -> Result<Vec<Detection>> + Send,
{
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        self(frame)
    }

    fn name(&self) -> &'static str {
        "closure"
    }
}
