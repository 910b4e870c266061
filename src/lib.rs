//! SentinelSight core
//!
//! Camera ingestion and rule engine for multi-stream video analytics.
//!
//! # Architecture
//!
//! Each registered camera owns two workers:
//!
//! 1. **Capture**: a connection supervisor drives the stream lifecycle
//!    (`Disconnected → Connecting → Online → Error → Connecting …`) and pushes
//!    frames into a bounded, drop-oldest frame queue.
//! 2. **Inference**: pops the freshest frame, runs the detector, updates the
//!    presence tracker, evaluates zone rules and deduplicates candidates.
//!
//! Accepted events leave the camera through a bounded hand-off to the event
//! sink, which persists and publishes them best-effort.
//!
//! # Module Structure
//!
//! - `frame`: Frame and the per-camera FrameQueue
//! - `ingest`: Frame sources (synthetic, RTSP)
//! - `supervisor`: Connection lifecycle, backoff and no-frame watchdog
//! - `detect`: Detector trait, registry and inference adapter
//! - `tracker`, `zone`, `rules`, `dedup`: Per-frame event pipeline
//! - `metrics`: Periodic per-camera and process sampling
//! - `storage`, `sink`: Persistence and notification boundary
//! - `engine`: Registration/configuration coordination point

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod dedup;
pub mod detect;
pub mod engine;
pub mod frame;
pub mod ingest;
pub mod metrics;
pub mod rules;
pub mod sink;
pub mod storage;
pub mod supervisor;
pub mod tracker;
pub mod zone;

pub use config::{PipelineSettings, SentinelConfig};
pub use dedup::{DedupKey, Deduplicator};
pub use detect::{BoundingBox, Detection, Detector, DetectorRegistry, ObjectClass};
pub use engine::{Engine, EngineHealth};
pub use frame::{Frame, FrameQueue};
pub use ingest::{FrameSource, RtspSource, SourceFactory, StreamSourceFactory};
pub use metrics::{CameraMetrics, MetricsSnapshot, SystemMetrics};
pub use rules::{RuleConfig, RuleEngine};
pub use sink::{EventSink, MqttNotifier, Notifier};
pub use storage::{InMemoryStore, SqliteStore, Store};
pub use supervisor::{Backoff, CameraState, CameraStatus};
pub use tracker::PresenceTracker;
pub use zone::{Geometry, Point, Zone};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as u64)
}

// -------------------- Identities --------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct CameraId(pub i64);

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ZoneId(pub i64);

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct EventId(pub i64);

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// -------------------- Cameras --------------------

/// Registration record for one camera. Runtime status lives in
/// `supervisor::CameraStatus` and is written only by that camera's supervisor.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Camera {
    pub id: CameraId,
    pub name: String,
    pub stream_url: String,
    pub location_tag: Option<String>,
    /// Target sampling rate (frames per second).
    pub target_fps: u32,
}

// -------------------- Events --------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Intrusion,
    Loitering,
}

impl RuleType {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleType::Intrusion => "intrusion",
            RuleType::Loitering => "loitering",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    New,
    Acknowledged,
    Resolved,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::New => "new",
            EventStatus::Acknowledged => "acknowledged",
            EventStatus::Resolved => "resolved",
        }
    }
}

/// Output of the zone rule engine. Untrusted until it passes the deduplicator.
///
/// `priority` is assigned by the rule engine from the rule type and the zone's
/// configuration at emission time.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CandidateEvent {
    pub camera_id: CameraId,
    pub zone_id: ZoneId,
    pub rule_type: RuleType,
    pub object_type: ObjectClass,
    pub confidence: f32,
    /// Capture time of the frame that produced the detection.
    pub detected_at_ms: u64,
    pub snapshot_ref: String,
    pub priority: Priority,
    /// Dwell time inside the zone, loitering only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dwell_ms: Option<u64>,
    pub bbox: BoundingBox,
}

/// Accepted, persisted event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: EventId,
    #[serde(flatten)]
    pub candidate: CandidateEvent,
    pub status: EventStatus,
}

impl Event {
    pub fn persisted(id: EventId, candidate: CandidateEvent) -> Self {
        Self {
            id,
            candidate,
            status: EventStatus::New,
        }
    }
}

// -------------------- Validation --------------------

/// Rejected input at a write-time boundary (zone upsert, camera registration,
/// configuration). Carried inside `anyhow::Error`; callers can `downcast_ref`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Shorthand for returning a `ValidationError` wrapped in `anyhow::Error`.
pub(crate) fn invalid<T>(field: &'static str, message: impl Into<String>) -> Result<T> {
    Err(ValidationError::new(field, message).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_survives_anyhow_round_trip() {
        let err = invalid::<()>("zone.points", "polygon needs at least 3 points").unwrap_err();
        let validation = err.downcast_ref::<ValidationError>().expect("validation error");
        assert_eq!(validation.field, "zone.points");
        assert!(format!("{err}").contains("polygon"));
    }

    #[test]
    fn priorities_order_by_severity() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn event_serializes_flat_with_lowercase_enums() {
        let event = Event::persisted(
            EventId(7),
            CandidateEvent {
                camera_id: CameraId(1),
                zone_id: ZoneId(2),
                rule_type: RuleType::Intrusion,
                object_type: ObjectClass::Person,
                confidence: 0.9,
                detected_at_ms: 1_700_000_000_000,
                snapshot_ref: "snapshot:1:1:abcd".to_string(),
                priority: Priority::High,
                dwell_ms: None,
                bbox: BoundingBox::new(40.0, 40.0, 20.0, 20.0),
            },
        );
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["id"], 7);
        assert_eq!(json["rule_type"], "intrusion");
        assert_eq!(json["priority"], "high");
        assert_eq!(json["status"], "new");
        assert!(json.get("dwell_ms").is_none());
    }
}
