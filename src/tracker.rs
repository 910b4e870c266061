//! Per-camera presence tracking.
//!
//! Tracks correlate detections across consecutive inference cycles by
//! centroid proximity. They carry no identity beyond continuous presence:
//! a track that misses detections for longer than the gap tolerance is
//! expired and removed, and a later detection starts a fresh track.

use serde::{Deserialize, Serialize};

use crate::detect::{Detection, ObjectClass};
use crate::zone::Point;

pub type TrackId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackerSettings {
    /// Maximum centroid distance for a detection to continue a track.
    pub max_distance_px: f32,
    /// A track unmatched for longer than this is expired.
    pub gap_tolerance_ms: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            max_distance_px: 75.0,
            gap_tolerance_ms: 1_500,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackState {
    Active,
    Expired,
}

#[derive(Clone, Debug)]
pub struct Track {
    pub id: TrackId,
    pub class: ObjectClass,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    pub centroid: Point,
    pub state: TrackState,
}

impl Track {
    pub fn dwell_ms(&self) -> u64 {
        self.last_seen_ms.saturating_sub(self.first_seen_ms)
    }
}

/// A detection with the track it was assigned to this cycle.
#[derive(Clone, Debug)]
pub struct Observation {
    pub track_id: TrackId,
    pub detection: Detection,
}

/// Result of one tracker cycle.
#[derive(Debug, Default)]
pub struct TrackUpdate {
    /// One per input detection, in input order.
    pub observations: Vec<Observation>,
    /// Tracks removed by this cycle's expiry sweep.
    pub expired: Vec<TrackId>,
}

#[derive(Debug)]
pub struct PresenceTracker {
    tracks: Vec<Track>,
    next_id: TrackId,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            tracks: Vec::with_capacity(16),
            next_id: 1,
        }
    }

    /// Process one inference cycle.
    ///
    /// Expiry runs first, so a detection arriving after a long gap starts a
    /// new track. Matching is greedy over all (track, detection) pairs of the
    /// same class within `max_distance_px`, nearest first.
    pub fn update(
        &mut self,
        detections: &[Detection],
        now_ms: u64,
        settings: &TrackerSettings,
    ) -> TrackUpdate {
        let expired = self.sweep(now_ms, settings.gap_tolerance_ms);

        let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                if track.class != det.class {
                    continue;
                }
                let distance = track.centroid.distance(&det.bbox.center());
                if distance <= settings.max_distance_px {
                    pairs.push((ti, di, distance));
                }
            }
        }
        pairs.sort_by(|a, b| a.2.total_cmp(&b.2));

        let mut track_taken = vec![false; self.tracks.len()];
        let mut assigned: Vec<Option<TrackId>> = vec![None; detections.len()];
        for (ti, di, _) in pairs {
            if track_taken[ti] || assigned[di].is_some() {
                continue;
            }
            track_taken[ti] = true;
            let track = &mut self.tracks[ti];
            track.last_seen_ms = now_ms;
            track.centroid = detections[di].bbox.center();
            assigned[di] = Some(track.id);
        }

        let observations = detections
            .iter()
            .zip(assigned)
            .map(|(det, assigned)| {
                let track_id = match assigned {
                    Some(id) => id,
                    None => self.start_track(det, now_ms),
                };
                Observation {
                    track_id,
                    detection: det.clone(),
                }
            })
            .collect();

        TrackUpdate {
            observations,
            expired,
        }
    }

    fn start_track(&mut self, det: &Detection, now_ms: u64) -> TrackId {
        let id = self.next_id;
        self.next_id += 1;
        self.tracks.push(Track {
            id,
            class: det.class,
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
            centroid: det.bbox.center(),
            state: TrackState::Active,
        });
        log::trace!("track {id} started ({})", det.class);
        id
    }

    fn sweep(&mut self, now_ms: u64, gap_tolerance_ms: u64) -> Vec<TrackId> {
        for track in &mut self.tracks {
            if now_ms.saturating_sub(track.last_seen_ms) > gap_tolerance_ms {
                track.state = TrackState::Expired;
            }
        }
        let expired: Vec<TrackId> = self
            .tracks
            .iter()
            .filter(|t| t.state == TrackState::Expired)
            .map(|t| t.id)
            .collect();
        self.tracks.retain(|t| t.state == TrackState::Active);
        expired
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}
