//! Event deduplication.
//!
//! A candidate is accepted only when no event with the same
//! (camera, zone, rule, object) key was accepted within the window. The
//! window slides: it restarts from each accepted event's timestamp, and
//! suppressed candidates do not extend it.

use std::collections::HashMap;

use crate::detect::ObjectClass;
use crate::{CameraId, CandidateEvent, RuleType, ZoneId};

pub const DEFAULT_DEDUP_WINDOW_MS: u64 = 5_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub camera_id: CameraId,
    pub zone_id: ZoneId,
    pub rule_type: RuleType,
    pub object_type: ObjectClass,
}

impl From<&CandidateEvent> for DedupKey {
    fn from(candidate: &CandidateEvent) -> Self {
        Self {
            camera_id: candidate.camera_id,
            zone_id: candidate.zone_id,
            rule_type: candidate.rule_type,
            object_type: candidate.object_type,
        }
    }
}

/// Last accepted timestamp per key. Owned by one camera's inference worker.
#[derive(Debug, Default)]
pub struct Deduplicator {
    last_accepted: HashMap<DedupKey, u64>,
    accepted: u64,
    suppressed: u64,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the candidate should be forwarded to the sink.
    pub fn accept(&mut self, candidate: &CandidateEvent, window_ms: u64) -> bool {
        let key = DedupKey::from(candidate);
        let at = candidate.detected_at_ms;
        if let Some(&last) = self.last_accepted.get(&key) {
            if at < last.saturating_add(window_ms) {
                self.suppressed += 1;
                return false;
            }
        }
        self.last_accepted.insert(key, at);
        self.accepted += 1;
        true
    }

    /// Drop keys whose window has lapsed; they can no longer suppress anything.
    pub fn prune(&mut self, now_ms: u64, window_ms: u64) {
        self.last_accepted
            .retain(|_, last| last.saturating_add(window_ms) > now_ms);
    }

    /// Forget every key for a zone (zone deleted or replaced).
    pub fn forget_zone(&mut self, zone_id: ZoneId) {
        self.last_accepted.retain(|key, _| key.zone_id != zone_id);
    }

    pub fn len(&self) -> usize {
        self.last_accepted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_accepted.is_empty()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;
    use crate::Priority;

    fn candidate(zone: i64, rule: RuleType, object: ObjectClass, at: u64) -> CandidateEvent {
        CandidateEvent {
            camera_id: CameraId(1),
            zone_id: ZoneId(zone),
            rule_type: rule,
            object_type: object,
            confidence: 0.8,
            detected_at_ms: at,
            snapshot_ref: String::new(),
            priority: Priority::High,
            dwell_ms: None,
            bbox: BoundingBox::default(),
        }
    }

    #[test]
    fn repeats_inside_window_are_suppressed() {
        let mut dedup = Deduplicator::new();
        let window = DEFAULT_DEDUP_WINDOW_MS;
        assert!(dedup.accept(&candidate(1, RuleType::Intrusion, ObjectClass::Person, 0), window));
        assert!(!dedup.accept(&candidate(1, RuleType::Intrusion, ObjectClass::Person, 4_999), window));
        assert!(dedup.accept(&candidate(1, RuleType::Intrusion, ObjectClass::Person, 5_000), window));
        assert_eq!(dedup.accepted(), 2);
        assert_eq!(dedup.suppressed(), 1);
    }

    #[test]
    fn suppressed_candidates_do_not_extend_the_window() {
        let mut dedup = Deduplicator::new();
        let window = 5_000;
        assert!(dedup.accept(&candidate(1, RuleType::Intrusion, ObjectClass::Person, 0), window));
        for at in (100..5_000).step_by(100) {
            assert!(!dedup.accept(&candidate(1, RuleType::Intrusion, ObjectClass::Person, at), window));
        }
        assert!(dedup.accept(&candidate(1, RuleType::Intrusion, ObjectClass::Person, 5_000), window));
    }

    #[test]
    fn distinct_keys_are_independent() {
        let mut dedup = Deduplicator::new();
        let window = 5_000;
        assert!(dedup.accept(&candidate(1, RuleType::Intrusion, ObjectClass::Person, 0), window));
        assert!(dedup.accept(&candidate(2, RuleType::Intrusion, ObjectClass::Person, 0), window));
        assert!(dedup.accept(&candidate(1, RuleType::Loitering, ObjectClass::Person, 0), window));
        assert!(dedup.accept(&candidate(1, RuleType::Intrusion, ObjectClass::Vehicle, 0), window));
        assert_eq!(dedup.len(), 4);
    }

    #[test]
    fn accepted_events_are_spaced_by_the_window() {
        let mut dedup = Deduplicator::new();
        let window = 5_000;
        let mut accepted_at = Vec::new();
        // Candidate every 150 ms for a minute.
        for at in (0..60_000).step_by(150) {
            if dedup.accept(&candidate(1, RuleType::Intrusion, ObjectClass::Person, at), window) {
                accepted_at.push(at);
            }
        }
        assert!(accepted_at.len() > 1);
        for pair in accepted_at.windows(2) {
            assert!(pair[1] - pair[0] >= window);
        }
    }

    #[test]
    fn prune_and_forget_release_keys() {
        let mut dedup = Deduplicator::new();
        dedup.accept(&candidate(1, RuleType::Intrusion, ObjectClass::Person, 0), 5_000);
        dedup.accept(&candidate(2, RuleType::Intrusion, ObjectClass::Person, 4_000), 5_000);
        dedup.prune(6_000, 5_000);
        assert_eq!(dedup.len(), 1);
        dedup.forget_zone(ZoneId(2));
        assert!(dedup.is_empty());
    }
}
