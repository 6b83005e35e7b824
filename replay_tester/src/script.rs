use litter_watch::detection::classify_coco;
use litter_watch::{BBox, Detection, DetectionClass, Detector, Frame, FrameDetections, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

/// One line of a detection script.
///
/// `{"frame": 3, "objects": [{"class_id": 0, "confidence": 0.9, "bbox": [x1, y1, x2, y2]}], "faces": [...]}`
#[derive(Debug, Deserialize)]
struct ScriptLine {
    frame: u64,
    #[serde(default)]
    objects: Vec<RawObject>,
    #[serde(default)]
    faces: Vec<RawFace>,
}

/// A COCO-labelled box as a YOLO-style detector would emit it.
#[derive(Debug, Deserialize)]
struct RawObject {
    class_id: u32,
    confidence: f32,
    bbox: [f64; 4],
}

#[derive(Debug, Deserialize)]
struct RawFace {
    confidence: f32,
    bbox: [f64; 4],
}

fn bbox([x1, y1, x2, y2]: [f64; 4]) -> BBox {
    BBox::new(x1, y1, x2, y2)
}

/// Detector that answers from a pre-recorded JSON-lines script keyed by frame index.
/// Frames without a line get no detections.
pub struct ScriptedDetector {
    by_frame: HashMap<u64, FrameDetections>,
}

impl ScriptedDetector {
    pub fn load(path: &Path, min_confidence: f32) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw, min_confidence)
    }

    pub fn parse(raw: &str, min_confidence: f32) -> Result<Self> {
        let mut by_frame = HashMap::new();
        for line in raw.lines().map(str::trim).filter(|l| !l.is_empty() && !l.starts_with('#')) {
            let parsed: ScriptLine = serde_json::from_str(line)?;
            let mut detections: Vec<Detection> = Vec::with_capacity(parsed.objects.len() + parsed.faces.len());
            for object in parsed.objects {
                if let Some(class) = classify_coco(object.class_id) {
                    detections.push(Detection::new(class, object.confidence, bbox(object.bbox)));
                }
            }
            detections.extend(
                parsed
                    .faces
                    .into_iter()
                    .map(|f| Detection::new(DetectionClass::Face, f.confidence, bbox(f.bbox))),
            );
            if by_frame
                .insert(parsed.frame, FrameDetections::partition(detections, min_confidence))
                .is_some()
            {
                warn!(frame = parsed.frame, "Duplicate script line, keeping the last one");
            }
        }
        Ok(Self { by_frame })
    }

    pub fn frames(&self) -> usize {
        self.by_frame.len()
    }
}

impl Detector for ScriptedDetector {
    fn detect(&mut self, frame: &Frame) -> Result<FrameDetections> {
        Ok(self.by_frame.remove(&frame.index).unwrap_or_default())
    }
}
