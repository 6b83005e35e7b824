// THEORY:
// Detections are the only input the engine takes from the outside world besides
// raw frames. A detector is a black box: it receives a frame and returns labeled
// boxes. The engine only cares about three semantic classes, person, face and
// "companion object" (anything carryable that can end up on the ground), so the
// detector adapter is responsible for folding its model's label space into
// `DetectionClass` before handing detections over.

use crate::error::Result;
use crate::frame::Frame;
use serde::{Deserialize, Serialize};

/// A point in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Axis-aligned box given by its top-left and bottom-right corners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Box of the given size centered on `center`.
    pub fn around(center: Point, width: f64, height: f64) -> Self {
        Self::new(
            center.x - width / 2.0,
            center.y - height / 2.0,
            center.x + width / 2.0,
            center.y + height / 2.0,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "label", rename_all = "snake_case")]
pub enum DetectionClass {
    Person,
    Face,
    /// A carryable object, labeled with the detector's class name ("bottle", "cup", ...).
    Companion(String),
}

/// One labeled box from one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class: DetectionClass,
    pub confidence: f32,
    pub bbox: BBox,
    pub center: Point,
}

impl Detection {
    /// Builds a detection whose center is the middle of its box.
    pub fn new(class: DetectionClass, confidence: f32, bbox: BBox) -> Self {
        Self {
            class,
            confidence: confidence.clamp(0.0, 1.0),
            center: bbox.center(),
            bbox,
        }
    }

    pub fn person(confidence: f32, bbox: BBox) -> Self {
        Self::new(DetectionClass::Person, confidence, bbox)
    }

    pub fn face(confidence: f32, bbox: BBox) -> Self {
        Self::new(DetectionClass::Face, confidence, bbox)
    }

    pub fn companion(label: impl Into<String>, confidence: f32, bbox: BBox) -> Self {
        Self::new(DetectionClass::Companion(label.into()), confidence, bbox)
    }

    /// Label of a companion object, `None` for persons and faces.
    pub fn companion_label(&self) -> Option<&str> {
        match &self.class {
            DetectionClass::Companion(label) => Some(label),
            _ => None,
        }
    }
}

/// A frame's detections, partitioned by semantic class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameDetections {
    pub persons: Vec<Detection>,
    pub companion_objects: Vec<Detection>,
    pub faces: Vec<Detection>,
}

impl FrameDetections {
    /// Partitions a flat detection list, dropping anything below `min_confidence`.
    pub fn partition(detections: impl IntoIterator<Item = Detection>, min_confidence: f32) -> Self {
        let mut out = Self::default();
        for detection in detections {
            if detection.confidence < min_confidence {
                continue;
            }
            match detection.class {
                DetectionClass::Person => out.persons.push(detection),
                DetectionClass::Face => out.faces.push(detection),
                DetectionClass::Companion(_) => out.companion_objects.push(detection),
            }
        }
        out
    }

    /// Re-applies the confidence floor to an already partitioned set.
    pub fn filtered(self, min_confidence: f32) -> Self {
        let keep = |d: &Detection| d.confidence >= min_confidence;
        Self {
            persons: self.persons.into_iter().filter(keep).collect(),
            companion_objects: self.companion_objects.into_iter().filter(keep).collect(),
            faces: self.faces.into_iter().filter(keep).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.persons.is_empty() && self.companion_objects.is_empty() && self.faces.is_empty()
    }
}

/// The object/person/face detector. Called once per frame from the camera
/// pipeline, which treats the call as blocking.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<FrameDetections>;
}

impl<F> Detector for F
where
    F: FnMut(&Frame) -> Result<FrameDetections> + Send,
{
    fn detect(&mut self, frame: &Frame) -> Result<FrameDetections> {
        self(frame)
    }
}

/// COCO class id for "person".
pub const COCO_PERSON: u32 = 0;

/// COCO classes that count as companion objects.
pub const COCO_COMPANION_CLASSES: &[(u32, &str)] = &[
    (24, "backpack"),
    (26, "handbag"),
    (28, "suitcase"),
    (39, "bottle"),
    (40, "wine glass"),
    (41, "cup"),
    (42, "fork"),
    (43, "knife"),
    (44, "spoon"),
    (45, "bowl"),
    (46, "banana"),
    (47, "apple"),
    (48, "sandwich"),
    (49, "orange"),
    (50, "broccoli"),
    (51, "carrot"),
    (52, "hot dog"),
    (53, "pizza"),
    (54, "donut"),
    (55, "cake"),
];

/// Maps a COCO class id to the engine's class, `None` for classes the engine ignores.
pub fn classify_coco(class_id: u32) -> Option<DetectionClass> {
    if class_id == COCO_PERSON {
        return Some(DetectionClass::Person);
    }
    COCO_COMPANION_CLASSES
        .iter()
        .find(|(id, _)| *id == class_id)
        .map(|(_, label)| DetectionClass::Companion((*label).to_string()))
}
