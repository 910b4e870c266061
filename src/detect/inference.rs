use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use super::backend::Detector;
use super::result::{Detection, ObjectClass};
use crate::frame::Frame;

/// Which detections reach the rule engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionFilter {
    pub confidence_threshold: f32,
    pub classes: Vec<ObjectClass>,
}

impl DetectionFilter {
    pub fn admits(&self, detection: &Detection) -> bool {
        detection.confidence.is_finite()
            && (0.0..=1.0).contains(&detection.confidence)
            && detection.confidence >= self.confidence_threshold
            && detection.bbox.is_valid()
            && self.classes.contains(&detection.class)
    }
}

impl Default for DetectionFilter {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            classes: vec![ObjectClass::Person, ObjectClass::Vehicle],
        }
    }
}

#[derive(Debug)]
pub struct InferenceOutcome {
    pub detections: Vec<Detection>,
    pub latency: Duration,
    /// Detector returned an error or panicked; `detections` is empty.
    pub failed: bool,
}

/// Wraps one camera's detector: timing, filtering and error containment.
pub struct InferenceAdapter {
    detector: Box<dyn Detector>,
}

impl InferenceAdapter {
    pub fn new(mut detector: Box<dyn Detector>) -> Self {
        if let Err(err) = detector.warm_up() {
            log::warn!("detector '{}' warm-up failed: {err:#}", detector.name());
        }
        Self { detector }
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector.name()
    }

    pub fn run(&mut self, frame: &Frame, filter: &DetectionFilter) -> InferenceOutcome {
        let started = Instant::now();
        let result = self.detect_contained(frame);
        let latency = started.elapsed();

        match result {
            Ok(raw) => {
                let total = raw.len();
                let detections: Vec<Detection> =
                    raw.into_iter().filter(|d| filter.admits(d)).collect();
                if detections.len() < total {
                    log::debug!(
                        "camera {} frame {}: {} of {} detections filtered",
                        frame.camera_id,
                        frame.seq,
                        total - detections.len(),
                        total
                    );
                }
                InferenceOutcome {
                    detections,
                    latency,
                    failed: false,
                }
            }
            Err(err) => {
                log::warn!(
                    "camera {} frame {}: inference failed ({}): {err:#}",
                    frame.camera_id,
                    frame.seq,
                    self.detector.name()
                );
                InferenceOutcome {
                    detections: Vec::new(),
                    latency,
                    failed: true,
                }
            }
        }
    }

    /// A panicking detector is reported as a failed cycle instead of taking
    /// the inference thread down with it.
    fn detect_contained(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let detector = &mut self.detector;
        panic::catch_unwind(AssertUnwindSafe(|| detector.detect(frame)))
            .unwrap_or_else(|payload| Err(anyhow!("detector panicked: {}", panic_message(&*payload))))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
