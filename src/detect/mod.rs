mod backend;
mod backends;
mod inference;
mod registry;
mod result;

pub use backend::Detector;
pub use backends::StubDetector;
#[cfg(feature = "backend-tract")]
pub use backends::TractDetector;
pub use inference::{DetectionFilter, InferenceAdapter, InferenceOutcome};
pub use registry::{DetectorFactory, DetectorRegistry};
pub use result::{BoundingBox, Detection, ObjectClass};
