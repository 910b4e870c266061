#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::Detector;
use crate::detect::result::{BoundingBox, Detection, ObjectClass};
use crate::frame::Frame;

/// Model input edge (YOLOv8 exports default to 640x640).
const INPUT_SIZE: usize = 640;
/// Raw score floor before the adapter applies the configured threshold.
const SCORE_FLOOR: f32 = 0.25;
const IOU_SUPPRESS: f32 = 0.45;

/// Tract-based ONNX detector for YOLOv8-style models.
///
/// Expects a single output of shape `[1, 4 + classes, anchors]` where the
/// first four rows are `cx, cy, w, h` in model input pixels. Frames are
/// nearest-neighbour resized to the model input; boxes are scaled back to
/// frame pixels.
pub struct TractDetector {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
}

impl TractDetector {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, INPUT_SIZE, INPUT_SIZE)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self { model })
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let width = frame.width as usize;
        let height = frame.height as usize;
        let expected_len = width
            .checked_mul(height)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        let pixels = frame.pixels();
        if width == 0 || height == 0 || pixels.len() != expected_len {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected_len,
                width,
                height,
                pixels.len()
            ));
        }

        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, INPUT_SIZE, INPUT_SIZE),
            |(_, channel, y, x)| {
                let src_x = x * width / INPUT_SIZE;
                let src_y = y * height / INPUT_SIZE;
                let idx = (src_y * width + src_x) * 3 + channel;
                pixels[idx] as f32 / 255.0
            },
        );
        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape();
        if shape.len() != 3 || shape[0] != 1 || shape[1] <= 4 {
            return Err(anyhow!("unexpected output shape {:?}", shape));
        }
        let rows = shape[1];
        let anchors = shape[2];
        let scale_x = frame.width as f32 / INPUT_SIZE as f32;
        let scale_y = frame.height as f32 / INPUT_SIZE as f32;

        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let mut best_class = 0usize;
            let mut best_score = f32::NEG_INFINITY;
            for row in 4..rows {
                let score = view[[0, row, anchor]];
                if score > best_score {
                    best_score = score;
                    best_class = row - 4;
                }
            }
            if best_score < SCORE_FLOOR {
                continue;
            }
            let Some(class) = coco_class(best_class) else {
                continue;
            };
            let cx = view[[0, 0, anchor]];
            let cy = view[[0, 1, anchor]];
            let w = view[[0, 2, anchor]];
            let h = view[[0, 3, anchor]];
            let bbox = BoundingBox::new(
                (cx - w / 2.0) * scale_x,
                (cy - h / 2.0) * scale_y,
                w * scale_x,
                h * scale_y,
            );
            candidates.push(Detection::new(class, best_score.min(1.0), bbox));
        }

        Ok(suppress_overlaps(candidates))
    }
}

impl Detector for TractDetector {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, frame)
    }
}

fn coco_class(id: usize) -> Option<ObjectClass> {
    match id {
        0 => Some(ObjectClass::Person),
        1..=8 => Some(ObjectClass::Vehicle),
        14..=23 => Some(ObjectClass::Animal),
        24 | 26 | 28 => Some(ObjectClass::Package),
        _ => None,
    }
}

/// Greedy per-class suppression, highest confidence first.
fn suppress_overlaps(mut candidates: Vec<Detection>) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for candidate in candidates {
        let overlaps = kept
            .iter()
            .any(|k| k.class == candidate.class && iou(&k.bbox, &candidate.bbox) > IOU_SUPPRESS);
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.w).min(b.x + b.w);
    let y2 = (a.y + a.h).min(b.y + b.h);
    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.w * a.h + b.w * b.h - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}
