//! Incident records and the process-wide incident number allocator.

use crate::clip::ClipJob;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Kind of evidence artifact. Doubles as the `artifact_kind` part of file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Face,
    Person,
    Screenshot,
    Clip,
    Record,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Face => "face",
            ArtifactKind::Person => "person",
            ArtifactKind::Screenshot => "screenshot",
            ArtifactKind::Clip => "clip",
            ArtifactKind::Record => "record",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Face | ArtifactKind::Person | ArtifactKind::Screenshot => "jpg",
            ArtifactKind::Clip => "mp4",
            ArtifactKind::Record => "json",
        }
    }

    pub fn media(&self) -> MediaKind {
        match self {
            ArtifactKind::Clip => MediaKind::Video,
            _ => MediaKind::Image,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media class reported to the upload endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Pending,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentKind {
    #[serde(rename = "disappearance-after-proximity")]
    DisappearanceAfterProximity,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IncidentId(String);

impl IncidentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IncidentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hands out incident numbers and ids. Shared by every camera pipeline.
///
/// Ids embed the allocator's start time, so numbers restarting at 1 after a
/// process restart still produce distinct ids.
#[derive(Debug)]
pub struct IncidentAllocator {
    epoch: i64,
    next: AtomicU64,
}

impl IncidentAllocator {
    pub fn new() -> Self {
        Self::with_epoch(Utc::now().timestamp_millis())
    }

    pub fn with_epoch(epoch: i64) -> Self {
        Self {
            epoch,
            next: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self, camera_id: &str) -> (IncidentId, u64) {
        let number = self.next.fetch_add(1, Ordering::Relaxed);
        (IncidentId(format!("{camera_id}-{}-{number:06}", self.epoch)), number)
    }
}

impl Default for IncidentAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Local paths of the artifacts backing an incident. Only the screenshot is guaranteed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub culprit_face_path: Option<PathBuf>,
    pub person_crop_path: Option<PathBuf>,
    pub screenshot_path: PathBuf,
    pub video_clip_path: Option<PathBuf>,
    /// Where the dispatcher keeps the JSON copy of the incident.
    pub record_path: PathBuf,
    /// Frames in the clip, 0 when there is no clip.
    #[serde(default)]
    pub clip_frames: usize,
    /// Playback rate of the clip.
    #[serde(default)]
    pub clip_fps: f64,
    /// Artifacts that could not be produced, and why.
    #[serde(default)]
    pub omitted: Vec<OmittedArtifact>,
}

impl Evidence {
    pub fn is_partial(&self) -> bool {
        !self.omitted.is_empty()
    }

    /// Every artifact path that exists, with its kind.
    pub fn artifacts(&self) -> Vec<(ArtifactKind, PathBuf)> {
        let mut out = Vec::with_capacity(4);
        if let Some(p) = &self.culprit_face_path {
            out.push((ArtifactKind::Face, p.clone()));
        }
        if let Some(p) = &self.person_crop_path {
            out.push((ArtifactKind::Person, p.clone()));
        }
        out.push((ArtifactKind::Screenshot, self.screenshot_path.clone()));
        if let Some(p) = &self.video_clip_path {
            out.push((ArtifactKind::Clip, p.clone()));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OmittedArtifact {
    pub kind: ArtifactKind,
    pub reason: String,
}

/// URLs returned by the reporting API, one per successfully uploaded artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteEvidence {
    pub culprit_face_url: Option<String>,
    pub person_crop_url: Option<String>,
    pub screenshot_url: Option<String>,
    pub video_clip_url: Option<String>,
}

impl RemoteEvidence {
    pub fn set(&mut self, kind: ArtifactKind, url: String) {
        match kind {
            ArtifactKind::Face => self.culprit_face_url = Some(url),
            ArtifactKind::Person => self.person_crop_url = Some(url),
            ArtifactKind::Screenshot => self.screenshot_url = Some(url),
            ArtifactKind::Clip => self.video_clip_url = Some(url),
            ArtifactKind::Record => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentMetadata {
    pub subject_key: String,
    pub frames_observed: u32,
    pub frames_with_companion: u32,
    pub companion_count: usize,
    pub person_confidence: f32,
    /// Confidence of the companion object the last time it was seen.
    #[serde(default)]
    pub companion_confidence: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub incident_id: IncidentId,
    pub incident_number: u64,
    pub camera_id: String,
    pub location: String,
    pub detected_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: IncidentKind,
    pub garbage_type: String,
    pub confidence: f32,
    pub description: String,
    pub evidence: Evidence,
    #[serde(default)]
    pub remote: RemoteEvidence,
    pub metadata: IncidentMetadata,
    pub status: IncidentStatus,
}

/// An assembled incident on its way to the dispatcher, with the clip it still
/// has to render.
#[derive(Debug, Clone)]
pub struct Submission {
    pub incident: Incident,
    pub clip: Option<ClipJob>,
}

impl From<Incident> for Submission {
    fn from(incident: Incident) -> Self {
        Self { incident, clip: None }
    }
}
