// THEORY:
// The `EvidenceAssembler` turns an admitted disappearance event into an incident
// with artifacts on disk. It runs on the camera pipeline, so it only does the
// cheap local work: cropping and writing stills. The clip is planned here and
// rendered by the dispatcher; uploading is the dispatcher's job too.
//
// Key architectural principles:
// 1.  **Best Effort, Independently**: The four artifacts (face crop, person crop,
//     screenshot, clip) are produced independently. A crop that collapses to zero
//     area or a clip requested on a cold, empty buffer is simply left out and
//     noted on the incident. Only the screenshot is mandatory.
// 2.  **Deterministic Layout**: Files land under `{root}/{camera_id}/` and are
//     named `{analysis_id}_{kind}_{incident_number}.{ext}`, so artifacts can be
//     correlated with their incident without any lookup.
// 3.  **Clip From Snapshot**: The clip is planned from a snapshot of the ring
//     buffer covering its full retained span, oldest first. Its path is fixed at
//     assembly time even though the file is written later.

use crate::clip::ClipJob;
use crate::config::EvidenceConfig;
use crate::core_modules::overlay;
use crate::core_modules::ring_buffer::FrameRingBuffer;
use crate::core_modules::tracker::CompanionDisappeared;
use crate::detection::BBox;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::incident::{
    ArtifactKind, Evidence, Incident, IncidentAllocator, IncidentKind, IncidentMetadata,
    IncidentStatus, OmittedArtifact, RemoteEvidence, Submission,
};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const UNKNOWN_GARBAGE: &str = "unknown";

/// Pixel rectangle `(x, y, width, height)` inside a frame.
pub type CropRect = (u32, u32, u32, u32);

/// Pads `bbox` on every side and clamps it to a `width` x `height` frame.
pub fn padded_crop(bbox: &BBox, padding: u32, width: u32, height: u32, kind: ArtifactKind) -> Result<CropRect> {
    let pad = padding as f64;
    let x1 = (bbox.x1 - pad).floor().clamp(0.0, width as f64) as u32;
    let y1 = (bbox.y1 - pad).floor().clamp(0.0, height as f64) as u32;
    let x2 = (bbox.x2 + pad).ceil().clamp(0.0, width as f64) as u32;
    let y2 = (bbox.y2 + pad).ceil().clamp(0.0, height as f64) as u32;
    if x2 <= x1 || y2 <= y1 {
        return Err(Error::DegenerateCrop(kind));
    }
    Ok((x1, y1, x2 - x1, y2 - y1))
}

pub struct EvidenceAssembler {
    camera_id: String,
    location: String,
    analysis_id: String,
    camera_dir: PathBuf,
    config: EvidenceConfig,
    allocator: Arc<IncidentAllocator>,
}

impl EvidenceAssembler {
    pub fn new(
        camera_id: impl Into<String>,
        location: impl Into<String>,
        config: EvidenceConfig,
        allocator: Arc<IncidentAllocator>,
    ) -> Self {
        let camera_id = camera_id.into();
        let camera_dir = config.root_dir.join(sanitize(&camera_id));
        Self {
            analysis_id: sanitize(&camera_id),
            camera_id,
            location: location.into(),
            camera_dir,
            config,
            allocator,
        }
    }

    pub fn camera_dir(&self) -> &Path {
        &self.camera_dir
    }

    pub fn artifact_path(&self, kind: ArtifactKind, incident_number: u64) -> PathBuf {
        self.camera_dir.join(format!(
            "{}_{}_{}.{}",
            self.analysis_id,
            kind.as_str(),
            incident_number,
            kind.extension()
        ))
    }

    /// Writes the still artifacts for `event` and returns the resulting `Pending`
    /// incident together with its planned clip.
    ///
    /// Fails only when the screenshot cannot be written.
    pub fn assemble(&self, event: &CompanionDisappeared, frame: &Frame, buffer: &FrameRingBuffer) -> Result<Submission> {
        fs::create_dir_all(&self.camera_dir)?;
        let (incident_id, number) = self.allocator.allocate(&self.camera_id);
        let detected_at = Utc::now();
        let image = frame.to_image()?;
        let mut omitted = Vec::new();

        // --- 1. Face Crop ---
        let culprit_face_path = match &event.nearest_face {
            Some(face) => self.save_crop(&image, &face.bbox, self.config.face_padding_px, ArtifactKind::Face, number, &mut omitted),
            None => {
                omitted.push(OmittedArtifact {
                    kind: ArtifactKind::Face,
                    reason: "no face near the subject".into(),
                });
                None
            }
        };

        // --- 2. Person Crop ---
        let person_crop_path = self.save_crop(
            &image,
            &event.person_bbox,
            self.config.person_padding_px,
            ArtifactKind::Person,
            number,
            &mut omitted,
        );

        // --- 3. Screenshot ---
        let screenshot_path = self.artifact_path(ArtifactKind::Screenshot, number);
        let mut screenshot = image;
        let caption = format!("{} #{}", detected_at.format("%Y-%m-%d %H:%M:%S"), number);
        overlay::burn_caption(&mut screenshot, &caption, (frame.height / 240).max(1));
        save_jpeg(&screenshot, &screenshot_path, self.config.jpeg_quality)?;

        // --- 4. Clip ---
        let clip = if buffer.is_empty() {
            warn!(camera_id = %self.camera_id, incident = number, "Clip omitted, frame buffer is empty");
            omitted.push(OmittedArtifact {
                kind: ArtifactKind::Clip,
                reason: Error::EmptyBuffer.to_string(),
            });
            None
        } else {
            Some(ClipJob::new(
                self.artifact_path(ArtifactKind::Clip, number),
                buffer.snapshot(),
                self.config.clip_fps,
            ))
        };
        let (video_clip_path, clip_frames, clip_fps) = match &clip {
            Some(job) => (Some(job.path.clone()), job.frames.len(), job.fps),
            None => (None, 0, 0.0),
        };

        let garbage_type = event
            .track
            .last_companion_class
            .clone()
            .unwrap_or_else(|| UNKNOWN_GARBAGE.to_string());

        debug!(
            camera_id = %self.camera_id,
            incident_id = %incident_id,
            partial = !omitted.is_empty(),
            clip_frames,
            "Evidence assembled"
        );

        let incident = Incident {
            incident_id,
            incident_number: number,
            camera_id: self.camera_id.clone(),
            location: self.location.clone(),
            detected_at,
            kind: IncidentKind::DisappearanceAfterProximity,
            description: describe(&garbage_type, &self.location, detected_at),
            garbage_type,
            confidence: event.person_confidence,
            evidence: Evidence {
                culprit_face_path,
                person_crop_path,
                screenshot_path,
                video_clip_path,
                record_path: self.artifact_path(ArtifactKind::Record, number),
                clip_frames,
                clip_fps,
                omitted,
            },
            remote: RemoteEvidence::default(),
            metadata: IncidentMetadata {
                subject_key: event.subject_key.to_string(),
                frames_observed: event.track.frames_observed,
                frames_with_companion: event.track.frames_with_companion,
                companion_count: event.track.companion_count,
                person_confidence: event.person_confidence,
                companion_confidence: event.track.last_companion_confidence,
            },
            status: IncidentStatus::Pending,
        };
        Ok(Submission { incident, clip })
    }

    fn save_crop(
        &self,
        image: &RgbImage,
        bbox: &BBox,
        padding: u32,
        kind: ArtifactKind,
        number: u64,
        omitted: &mut Vec<OmittedArtifact>,
    ) -> Option<PathBuf> {
        let result = padded_crop(bbox, padding, image.width(), image.height(), kind).and_then(|(x, y, w, h)| {
            let crop = image::imageops::crop_imm(image, x, y, w, h).to_image();
            let path = self.artifact_path(kind, number);
            save_jpeg(&crop, &path, self.config.jpeg_quality)?;
            Ok(path)
        });
        match result {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(camera_id = %self.camera_id, incident = number, kind = %kind, error = %e, "Crop omitted");
                omitted.push(OmittedArtifact {
                    kind,
                    reason: e.to_string(),
                });
                None
            }
        }
    }
}

fn save_jpeg(image: &RgbImage, path: &Path, quality: u8) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    JpegEncoder::new_with_quality(&mut writer, quality).encode(
        image.as_raw(),
        image.width(),
        image.height(),
        ExtendedColorType::Rgb8,
    )?;
    writer.flush()?;
    Ok(())
}

fn describe(garbage_type: &str, location: &str, at: DateTime<Utc>) -> String {
    format!(
        "Person seen carrying a {garbage_type} no longer has it at {location} ({}). Possible littering, pending review.",
        at.format("%Y-%m-%d %H:%M:%S UTC")
    )
}

/// Keeps ids usable as path components.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
