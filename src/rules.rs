//! Zone rule engine.
//!
//! Turns one cycle's tracked detections into candidate events. Membership is
//! tested with the centre of the detection's bounding box.
//!
//! - Intrusion: a detection inside a zone emits a candidate every cycle.
//! - Loitering: a track continuously inside a zone for at least the
//!   threshold emits a candidate every cycle; the deduplicator spaces them.
//!
//! One `RuleEngine` per camera, owned by that camera's inference worker.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::detect::ObjectClass;
use crate::frame::Frame;
use crate::tracker::{TrackId, TrackUpdate};
use crate::zone::Zone;
use crate::{invalid, CameraId, CandidateEvent, Priority, RuleType, ZoneId};

pub const DEFAULT_LOITERING_THRESHOLD_SECS: u64 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoiteringRule {
    pub threshold_secs: u64,
}

impl Default for LoiteringRule {
    fn default() -> Self {
        Self {
            threshold_secs: DEFAULT_LOITERING_THRESHOLD_SECS,
        }
    }
}

/// Rules attached to one zone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default = "default_true")]
    pub intrusion: bool,
    /// `None` disables loitering for the zone.
    #[serde(default)]
    pub loitering: Option<LoiteringRule>,
    /// Raise every event from this zone to `critical`.
    #[serde(default)]
    pub escalate_to_critical: bool,
    /// Classes this zone reacts to. Empty means every class.
    #[serde(default)]
    pub object_classes: Vec<ObjectClass>,
}

fn default_true() -> bool {
    true
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            intrusion: true,
            loitering: None,
            escalate_to_critical: false,
            object_classes: Vec::new(),
        }
    }
}

impl RuleConfig {
    pub fn intrusion_only() -> Self {
        Self::default()
    }

    pub fn with_loitering(mut self, threshold_secs: u64) -> Self {
        self.loitering = Some(LoiteringRule { threshold_secs });
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(loitering) = &self.loitering {
            if loitering.threshold_secs == 0 {
                return invalid("zone.rules.loitering.threshold_secs", "must be greater than zero");
            }
        }
        Ok(())
    }

    fn applies_to(&self, class: ObjectClass) -> bool {
        self.object_classes.is_empty() || self.object_classes.contains(&class)
    }
}

/// Fixed mapping from rule type and zone configuration to priority.
pub fn assign_priority(rule: RuleType, config: &RuleConfig) -> Priority {
    if config.escalate_to_critical {
        return Priority::Critical;
    }
    match rule {
        RuleType::Intrusion => Priority::High,
        RuleType::Loitering => Priority::Medium,
    }
}

pub struct RuleEngine {
    camera_id: CameraId,
    /// Entry time of each (track, zone) pair currently inside a loitering zone.
    dwell_started: HashMap<(TrackId, ZoneId), u64>,
    /// Malformed zones already reported, so the warning is logged once.
    warned: HashSet<ZoneId>,
}

impl RuleEngine {
    pub fn new(camera_id: CameraId) -> Self {
        Self {
            camera_id,
            dwell_started: HashMap::new(),
            warned: HashSet::new(),
        }
    }

    /// Evaluate one cycle against a consistent snapshot of the camera's zones.
    ///
    /// `now_ms` is the capture time of the frame the detections came from.
    pub fn evaluate(
        &mut self,
        zones: &[Zone],
        update: &TrackUpdate,
        frame: &Frame,
    ) -> Vec<CandidateEvent> {
        let now_ms = frame.captured_at_ms;
        self.forget_tracks(&update.expired);
        self.forget_missing_zones(zones);

        let mut snapshot_ref: Option<String> = None;
        let mut candidates = Vec::new();

        for zone in zones {
            if let Err(err) = zone.geometry.validate() {
                if self.warned.insert(zone.id) {
                    log::warn!(
                        "camera {}: skipping zone {} ('{}'): {err:#}",
                        self.camera_id,
                        zone.id,
                        zone.name
                    );
                }
                self.dwell_started.retain(|(_, z), _| *z != zone.id);
                continue;
            }
            self.warned.remove(&zone.id);

            for observation in &update.observations {
                let detection = &observation.detection;
                let key = (observation.track_id, zone.id);
                let inside = zone.contains(detection.bbox.center())
                    && zone.rules.applies_to(detection.class);

                if !inside {
                    self.dwell_started.remove(&key);
                    continue;
                }

                if zone.rules.intrusion {
                    candidates.push(self.candidate(
                        zone,
                        RuleType::Intrusion,
                        observation,
                        frame,
                        &mut snapshot_ref,
                        None,
                    ));
                }

                match zone.rules.loitering {
                    Some(loitering) => {
                        let entered = *self.dwell_started.entry(key).or_insert(now_ms);
                        let dwell_ms = now_ms.saturating_sub(entered);
                        if dwell_ms >= loitering.threshold_secs.saturating_mul(1_000) {
                            candidates.push(self.candidate(
                                zone,
                                RuleType::Loitering,
                                observation,
                                frame,
                                &mut snapshot_ref,
                                Some(dwell_ms),
                            ));
                        }
                    }
                    None => {
                        self.dwell_started.remove(&key);
                    }
                }
            }
        }

        candidates
    }

    fn candidate(
        &self,
        zone: &Zone,
        rule_type: RuleType,
        observation: &crate::tracker::Observation,
        frame: &Frame,
        snapshot_ref: &mut Option<String>,
        dwell_ms: Option<u64>,
    ) -> CandidateEvent {
        let snapshot_ref = snapshot_ref
            .get_or_insert_with(|| frame.snapshot_ref())
            .clone();
        CandidateEvent {
            camera_id: self.camera_id,
            zone_id: zone.id,
            rule_type,
            object_type: observation.detection.class,
            confidence: observation.detection.confidence,
            detected_at_ms: frame.captured_at_ms,
            snapshot_ref,
            priority: assign_priority(rule_type, &zone.rules),
            dwell_ms,
            bbox: observation.detection.bbox,
        }
    }

    fn forget_tracks(&mut self, expired: &[TrackId]) {
        if expired.is_empty() {
            return;
        }
        self.dwell_started
            .retain(|(track, _), _| !expired.contains(track));
    }

    fn forget_missing_zones(&mut self, zones: &[Zone]) {
        self.dwell_started
            .retain(|(_, zone), _| zones.iter().any(|z| z.id == *zone));
        self.warned.retain(|zone| zones.iter().any(|z| z.id == *zone));
    }

    /// Number of (track, zone) pairs with a running dwell timer.
    pub fn dwell_timers(&self) -> usize {
        self.dwell_started.len()
    }
}
