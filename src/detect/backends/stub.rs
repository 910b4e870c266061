use anyhow::Result;

use crate::detect::backend::Detector;
use crate::detect::result::{BoundingBox, Detection, ObjectClass};
use crate::frame::Frame;

/// Frames for one full crossing of the frame.
const WALK_PERIOD_FRAMES: u64 = 300;

/// Deterministic synthetic detector for demos and wiring tests.
///
/// Reports one person walking the frame diagonal from top-left to
/// bottom-right, driven purely by the frame sequence number.
pub struct StubDetector {
    confidence: f32,
}

impl StubDetector {
    pub fn new() -> Self {
        Self { confidence: 0.9 }
    }
}

impl Default for StubDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let width = frame.width as f32;
        let height = frame.height as f32;
        let w = (width * 0.1).max(1.0);
        let h = (height * 0.25).max(1.0);

        let progress = (frame.seq % WALK_PERIOD_FRAMES) as f32 / WALK_PERIOD_FRAMES as f32;
        let x = progress * (width - w).max(0.0);
        let y = progress * (height - h).max(0.0);

        Ok(vec![Detection::new(
            ObjectClass::Person,
            self.confidence,
            BoundingBox::new(x, y, w, h),
        )])
    }
}
