// THEORY:
// The `tracker` module adds memory to the engine. A single frame only says "there
// is a person here and a bottle there"; the tracker turns the stream of frames
// into a notion of "this person was holding something a moment ago and now is
// not", which is the behavioral signal we report as littering.
//
// Key architectural principles:
// 1.  **Position as Identity**: A person's identity is approximated by a subject
//     key, the camera id plus the person's center quantized to a grid cell. There
//     is no re-identification model. Someone who moves to a new cell becomes a new
//     track, and two people crossing paths can swap keys. This is an accepted
//     limitation of the design.
// 2.  **Single Qualifying Transition**: Only "had a companion object last update,
//     has none now" produces an event. Picking something up, carrying it, or
//     standing next to litter that was never held are all silent.
// 3.  **Deterministic Lifecycle**: Tracks are born on first sighting, updated on
//     every re-observation, and swept at the end of each processed frame once
//     they have gone stale. The sweep runs on the frame clock rather than a timer
//     so replaying the same frames always yields the same events.

use crate::config::TrackerConfig;
use crate::detection::{BBox, Detection, FrameDetections, Point};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

/// Approximate identity of a tracked person: camera id plus quantized position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectKey(String);

impl SubjectKey {
    pub fn quantize(camera_id: &str, center: Point, cell_px: f64) -> Self {
        let qx = (center.x / cell_px).floor() as i64;
        let qy = (center.y / cell_px).floor() as i64;
        Self(format!("{camera_id}_{qx}_{qy}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The tracked state of one subject.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: SubjectKey,
    pub first_seen: Instant,
    pub last_seen: Instant,
    /// Whether a companion object was within reach at the last update.
    pub has_companion_object: bool,
    /// Number of companion objects within reach at the last update.
    pub companion_count: usize,
    pub frames_with_companion: u32,
    pub frames_observed: u32,
    /// Class of the nearest companion object the last time one was within reach.
    pub last_companion_class: Option<String>,
    pub last_companion_confidence: Option<f32>,
}

impl Track {
    fn new(id: SubjectKey, now: Instant, nearby: &[&Detection], person: &Detection) -> Self {
        let mut track = Self {
            id,
            first_seen: now,
            last_seen: now,
            has_companion_object: false,
            companion_count: 0,
            frames_with_companion: 0,
            frames_observed: 1,
            last_companion_class: None,
            last_companion_confidence: None,
        };
        track.record_companions(nearby, person);
        track
    }

    fn record_companions(&mut self, nearby: &[&Detection], person: &Detection) {
        self.has_companion_object = !nearby.is_empty();
        self.companion_count = nearby.len();
        if let Some(closest) = nearest(person.center, nearby.iter().copied()) {
            self.frames_with_companion += 1;
            self.last_companion_class = closest.companion_label().map(str::to_string);
            self.last_companion_confidence = Some(closest.confidence);
        }
    }
}

/// Emitted when a subject that held a companion object is seen without one.
#[derive(Debug, Clone)]
pub struct CompanionDisappeared {
    pub subject_key: SubjectKey,
    /// Track state as of this frame, before its companion fields were cleared.
    pub track: Track,
    pub person_bbox: BBox,
    pub person_confidence: f32,
    /// Closest face within the face radius, if any.
    pub nearest_face: Option<Detection>,
    pub observed_at: Instant,
}

/// Per-camera table of live tracks.
pub struct SubjectTracker {
    camera_id: String,
    config: TrackerConfig,
    tracks: HashMap<SubjectKey, Track>,
}

impl SubjectTracker {
    pub fn new(camera_id: impl Into<String>, config: TrackerConfig) -> Self {
        Self {
            camera_id: camera_id.into(),
            config,
            tracks: HashMap::new(),
        }
    }

    /// Applies one frame's detections and returns the disappearance events it caused.
    /// Stale tracks are swept before returning.
    pub fn observe(&mut self, detections: &FrameDetections, now: Instant) -> Vec<CompanionDisappeared> {
        let mut events = Vec::new();

        for person in &detections.persons {
            // --- 1. Proximity ---
            let nearby: Vec<&Detection> = detections
                .companion_objects
                .iter()
                .filter(|o| person.center.distance(&o.center) < self.config.proximity_radius_px)
                .collect();

            // --- 2. Identity ---
            let key = SubjectKey::quantize(&self.camera_id, person.center, self.config.quantization_px);

            // --- 3. Birth or Update ---
            let Some(track) = self.tracks.get_mut(&key) else {
                let track = Track::new(key.clone(), now, &nearby, person);
                self.tracks.insert(key, track);
                continue;
            };

            track.last_seen = now;
            track.frames_observed += 1;

            if track.has_companion_object && nearby.is_empty() {
                let nearest_face = nearest(
                    person.center,
                    detections
                        .faces
                        .iter()
                        .filter(|f| person.center.distance(&f.center) < self.config.face_radius_px),
                )
                .cloned();
                events.push(CompanionDisappeared {
                    subject_key: key.clone(),
                    track: track.clone(),
                    person_bbox: person.bbox,
                    person_confidence: person.confidence,
                    nearest_face,
                    observed_at: now,
                });
            }

            track.record_companions(&nearby, person);
        }

        // --- 4. Sweep ---
        self.sweep(now);
        events
    }

    /// Drops every track not updated within the TTL.
    pub fn sweep(&mut self, now: Instant) {
        let ttl = self.config.track_ttl();
        self.tracks
            .retain(|_, t| now.saturating_duration_since(t.last_seen) <= ttl);
    }

    /// Forgets a subject so that a fresh carrying cycle is needed before it can report again.
    pub fn remove(&mut self, key: &SubjectKey) -> Option<Track> {
        self.tracks.remove(key)
    }

    pub fn get(&self, key: &SubjectKey) -> Option<&Track> {
        self.tracks.get(key)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }
}

/// Minimum-distance detection. Ties keep the first one encountered.
fn nearest<'a>(from: Point, candidates: impl Iterator<Item = &'a Detection>) -> Option<&'a Detection> {
    let mut best: Option<(&Detection, f64)> = None;
    for candidate in candidates {
        let dist = from.distance(&candidate.center);
        match best {
            Some((_, best_dist)) if dist >= best_dist => {}
            _ => best = Some((candidate, dist)),
        }
    }
    best.map(|(d, _)| d)
}
