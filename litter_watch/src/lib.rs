// THEORY:
// This file is the main entry point for the `litter_watch` library crate. It
// exposes the engine that turns per-frame detections from a camera into
// littering incidents backed by on-disk evidence.
//
// The public surface is layered:
// 1.  `pipeline::IncidentEngine` is the deterministic, synchronous core. Feed it
//     frames and detections; it hands incidents to an `IncidentSink`.
// 2.  `pipeline::CameraPipeline` wraps the engine with a frame source, a
//     detector and a capture thread.
// 3.  `supervisor::CameraSupervisor` runs many cameras at once.
// 4.  `dispatcher::EvidenceDispatcher` drains incidents to a `ReportingApi`
//     in the background, rendering their clips (`clip`) on the way.
//
// The tracking internals (`core_modules`) are public for testing and tooling
// but are normally reached only through the engine.

pub mod clip;
pub mod config;
pub mod core_modules;
pub mod detection;
pub mod dispatcher;
pub mod error;
pub mod evidence;
pub mod frame;
pub mod incident;
pub mod pipeline;
pub mod supervisor;

pub use config::EngineConfig;
pub use detection::{BBox, Detection, DetectionClass, Detector, FrameDetections, Point};
pub use dispatcher::{DispatcherHandle, EvidenceDispatcher, IncidentSink, ReportingApi};
pub use error::{Error, Result};
pub use frame::{Frame, FrameSource};
pub use incident::{Incident, IncidentId, IncidentStatus, Submission};
pub use pipeline::{CameraPipeline, IncidentEngine, PipelineSummary, StopHandle, StopReason};
pub use supervisor::{CameraInfo, CameraSetup, CameraStatus, CameraSupervisor};
