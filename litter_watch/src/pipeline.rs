// THEORY:
// The `pipeline` module is the top-level, per-camera API of the engine. It ties
// the tracker, the deduplicator, the frame history and the evidence assembler
// into a single sequential loop: acquire, detect, track, then assemble and hand
// off whatever incidents the frame produced.
//
// Key architectural principles:
// 1.  **Deterministic Core**: `IncidentEngine::process_frame` is synchronous and
//     takes the frame's own capture time as "now". Given the same frames and
//     detections it always produces the same incidents, which is what the tests
//     and the replay runner rely on.
// 2.  **Private State**: Each pipeline owns its tracker, cooldown table and ring
//     buffer. The only things shared between cameras are the incident allocator
//     and the dispatcher behind `IncidentSink`.
// 3.  **Capture Off the Hot Path**: `CameraPipeline` reads frames on a dedicated
//     thread feeding a bounded channel, so a slow detector applies backpressure
//     to the source instead of growing memory.
// 4.  **Stalls Are Failures**: A source that yields nothing within
//     `frame_timeout` of the pipeline asking for a frame ends the pipeline with
//     `SourceStalled`. Time spent detecting does not count against the source.
//     Reconnecting is the caller's decision.
// 5.  **Never Wait on a Hung Source**: After a stall or a stop request the
//     capture thread is left to exit on its own once its read returns. Only a
//     source that reported its end is joined, to collect its error.
// 6.  **History Is Complete**: A frame the detector fails on is still pushed to
//     the ring buffer, so clips have no holes.

use crate::config::{EngineConfig, PipelineConfig};
use crate::core_modules::cooldown::CooldownTable;
use crate::core_modules::ring_buffer::FrameRingBuffer;
use crate::core_modules::tracker::SubjectTracker;
use crate::detection::{Detector, FrameDetections};
use crate::dispatcher::IncidentSink;
use crate::error::{Error, Result};
use crate::evidence::EvidenceAssembler;
use crate::frame::{Frame, FrameSource};
use crate::incident::{IncidentAllocator, IncidentId};
use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Upper bound on how long the run loop waits before re-checking the stop flag.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Live counters of one camera pipeline, readable from other threads.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub frames_processed: AtomicU64,
    /// Frames kept for history only because the detector failed on them.
    pub frames_skipped: AtomicU64,
    pub incidents: AtomicU64,
    pub suppressed: AtomicU64,
    pub assembly_failures: AtomicU64,
}

impl PipelineCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            incidents: self.incidents.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            assembly_failures: self.assembly_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub incidents: u64,
    pub suppressed: u64,
    pub assembly_failures: u64,
}

/// The per-camera incident engine.
pub struct IncidentEngine {
    camera_id: String,
    tracker: SubjectTracker,
    cooldown: CooldownTable,
    buffer: FrameRingBuffer,
    assembler: EvidenceAssembler,
    min_confidence: f32,
    sink: Arc<dyn IncidentSink>,
    counters: Arc<PipelineCounters>,
    /// Latest time seen, so a frame stamped earlier cannot move the clock back.
    clock: Option<Instant>,
}

impl IncidentEngine {
    pub fn new(
        camera_id: impl Into<String>,
        location: impl Into<String>,
        config: &EngineConfig,
        allocator: Arc<IncidentAllocator>,
        sink: Arc<dyn IncidentSink>,
    ) -> Self {
        let camera_id = camera_id.into();
        Self {
            tracker: SubjectTracker::new(camera_id.clone(), config.tracker.clone()),
            cooldown: CooldownTable::new(config.cooldown.cooldown()),
            buffer: FrameRingBuffer::new(config.buffer.capacity),
            assembler: EvidenceAssembler::new(camera_id.clone(), location, config.evidence.clone(), allocator),
            min_confidence: config.tracker.min_confidence,
            sink,
            counters: Arc::new(PipelineCounters::default()),
            clock: None,
            camera_id,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn counters(&self) -> Arc<PipelineCounters> {
        Arc::clone(&self.counters)
    }

    pub fn tracker(&self) -> &SubjectTracker {
        &self.tracker
    }

    pub fn buffer(&self) -> &FrameRingBuffer {
        &self.buffer
    }

    /// Runs one frame through the engine and returns the ids of the incidents
    /// it handed to the sink.
    pub fn process_frame(&mut self, frame: Frame, detections: FrameDetections) -> Vec<IncidentId> {
        // --- 1. History ---
        let now = self.record(frame.clone());

        // --- 2. Tracking ---
        let detections = detections.filtered(self.min_confidence);
        let events = self.tracker.observe(&detections, now);

        // --- 3. Incidents ---
        let mut submitted = Vec::new();
        for event in events {
            if !self.cooldown.admit(&event.subject_key, now) {
                self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                debug!(camera_id = %self.camera_id, subject_key = %event.subject_key, "Duplicate incident suppressed");
                continue;
            }
            self.tracker.remove(&event.subject_key);

            match self.assembler.assemble(&event, &frame, &self.buffer) {
                Ok(submission) => {
                    let incident = &submission.incident;
                    info!(
                        camera_id = %self.camera_id,
                        incident_id = %incident.incident_id,
                        subject_key = %event.subject_key,
                        garbage_type = %incident.garbage_type,
                        "Incident admitted"
                    );
                    self.counters.incidents.fetch_add(1, Ordering::Relaxed);
                    submitted.push(incident.incident_id.clone());
                    self.sink.submit(submission);
                }
                Err(e) => {
                    self.counters.assembly_failures.fetch_add(1, Ordering::Relaxed);
                    error!(camera_id = %self.camera_id, subject_key = %event.subject_key, error = %e, "Evidence assembly failed");
                }
            }
        }

        // --- 4. Housekeeping ---
        self.cooldown.sweep(now);
        self.counters.frames_processed.fetch_add(1, Ordering::Relaxed);
        submitted
    }

    /// Keeps a frame that could not be analysed in the history without
    /// touching the tracker.
    pub fn skip_frame(&mut self, frame: Frame) {
        self.record(frame);
        self.counters.frames_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Buffers the frame and returns the engine time it was seen at.
    fn record(&mut self, frame: Frame) -> Instant {
        let now = match self.clock {
            Some(last) if last > frame.captured_at => last,
            _ => frame.captured_at,
        };
        self.clock = Some(now);
        self.buffer.push(frame);
        now
    }
}

/// Cloneable request to stop a running pipeline after its current frame.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `StopHandle::stop` was called.
    Requested,
    /// The source reported that it has no more frames.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSummary {
    pub camera_id: String,
    pub reason: StopReason,
    pub counters: CounterSnapshot,
}

enum Captured {
    Frame(Frame),
    Ended(StopReason),
}

struct CaptureWorker {
    rx: Receiver<Frame>,
    join: JoinHandle<Result<()>>,
}

impl CaptureWorker {
    fn start(mut source: Box<dyn FrameSource>, buffer: usize, stop: StopHandle) -> Result<Self> {
        let (tx, rx) = bounded::<Frame>(buffer.max(1));
        let join = thread::Builder::new()
            .name("litter-watch-capture".into())
            .spawn(move || -> Result<()> {
                while !stop.is_stopped() {
                    let Some(frame) = source.next_frame()? else {
                        break;
                    };
                    if tx.send(frame).is_err() {
                        // Receiver gone, the pipeline has ended.
                        break;
                    }
                }
                Ok(())
            })?;
        Ok(Self { rx, join })
    }

    /// Waits up to `timeout` for the next frame, re-checking `stop` while it waits.
    fn next(&self, stop: &StopHandle, timeout: Duration) -> Result<Captured> {
        let started = Instant::now();
        loop {
            if stop.is_stopped() {
                return Ok(Captured::Ended(StopReason::Requested));
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(Error::SourceStalled(timeout));
            }
            match self.rx.recv_timeout((timeout - waited).min(STOP_POLL_INTERVAL)) {
                Ok(frame) => return Ok(Captured::Frame(frame)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(Captured::Ended(StopReason::Exhausted)),
            }
        }
    }

    /// Joins the capture thread and returns the error it ended with, if any.
    /// Only call once the channel has disconnected, otherwise this can block
    /// on the source.
    fn finish(self) -> Result<()> {
        drop(self.rx);
        match self.join.join() {
            Ok(result) => result,
            Err(_) => Err(Error::SourceExhausted("capture thread panicked".into())),
        }
    }

    /// Lets the capture thread wind down by itself. Its next send fails, or it
    /// sees the stop flag after its current read.
    fn detach(self, camera_id: &str) {
        drop(self.rx);
        if !self.join.is_finished() {
            debug!(camera_id, "Capture thread detached while reading");
        }
    }
}

/// One camera: a frame source, a detector and the engine they feed.
pub struct CameraPipeline {
    engine: IncidentEngine,
    source: Box<dyn FrameSource>,
    detector: Box<dyn Detector>,
    config: PipelineConfig,
    stop: StopHandle,
}

impl CameraPipeline {
    pub fn new(
        engine: IncidentEngine,
        source: Box<dyn FrameSource>,
        detector: Box<dyn Detector>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            engine,
            source,
            detector,
            config,
            stop: StopHandle::default(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn counters(&self) -> Arc<PipelineCounters> {
        self.engine.counters()
    }

    /// Runs until stopped, until the source ends, or until the source fails.
    /// Blocks the calling thread.
    pub fn run(self) -> Result<PipelineSummary> {
        let CameraPipeline {
            mut engine,
            source,
            mut detector,
            config,
            stop,
        } = self;
        let camera_id = engine.camera_id().to_string();
        let frame_timeout = config.frame_timeout();
        let capture = CaptureWorker::start(source, config.capture_buffer, stop.clone())?;
        info!(camera_id = %camera_id, "Camera pipeline started");

        let outcome = loop {
            let frame = match capture.next(&stop, frame_timeout) {
                Ok(Captured::Frame(frame)) => frame,
                Ok(Captured::Ended(reason)) => break Ok(reason),
                Err(e) => break Err(e),
            };

            match detector.detect(&frame) {
                Ok(detections) => {
                    engine.process_frame(frame, detections);
                }
                Err(e) => {
                    warn!(camera_id = %camera_id, frame = frame.index, error = %e, "Detector failed, frame kept for history only");
                    engine.skip_frame(frame);
                }
            }
        };

        stop.stop();
        let outcome = match outcome {
            Ok(StopReason::Exhausted) => capture.finish().map(|()| StopReason::Exhausted),
            other => {
                capture.detach(&camera_id);
                other
            }
        };
        let reason = match outcome {
            Ok(reason) => reason,
            Err(e) => {
                error!(camera_id = %camera_id, error = %e, "Camera pipeline failed");
                return Err(e);
            }
        };

        let counters = engine.counters().snapshot();
        match reason {
            StopReason::Requested => info!(camera_id = %camera_id, frames = counters.frames_processed, "Camera pipeline stopped"),
            StopReason::Exhausted => info!(camera_id = %camera_id, frames = counters.frames_processed, "Frame source exhausted"),
        }
        Ok(PipelineSummary {
            camera_id,
            reason,
            counters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BBox, Detection, Point};
    use crate::frame::IterSource;
    use crate::incident::{IncidentStatus, Submission};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<Submission>>);

    impl IncidentSink for CollectingSink {
        fn submit(&self, submission: Submission) {
            self.0.lock().push(submission);
        }
    }

    fn person_at(x: f64, y: f64) -> Detection {
        Detection::person(0.9, BBox::around(Point::new(x, y), 60.0, 160.0))
    }

    fn cup_at(x: f64, y: f64) -> Detection {
        Detection::companion("cup", 0.8, BBox::around(Point::new(x, y), 20.0, 20.0))
    }

    fn engine(dir: &std::path::Path, cooldown_secs: f64) -> (IncidentEngine, Arc<CollectingSink>) {
        let mut config = EngineConfig::default();
        config.evidence.root_dir = dir.to_path_buf();
        config.cooldown.cooldown_secs = cooldown_secs;
        config.buffer.capacity = 10;
        let sink = Arc::new(CollectingSink::default());
        let engine = IncidentEngine::new(
            "cam1",
            "Main Street",
            &config,
            Arc::new(IncidentAllocator::with_epoch(7)),
            sink.clone(),
        );
        (engine, sink)
    }

    fn detections(persons: Vec<Detection>, objects: Vec<Detection>) -> FrameDetections {
        FrameDetections {
            persons,
            companion_objects: objects,
            faces: Vec::new(),
        }
    }

    #[test]
    fn disappearance_produces_one_pending_incident() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, sink) = engine(dir.path(), 10.0);
        let t0 = Instant::now();

        for i in 0..3 {
            let frame = Frame::solid(i, 320, 240, t0 + Duration::from_millis(100 * i), [10, 10, 10]);
            let ids = engine.process_frame(frame, detections(vec![person_at(100.0, 100.0)], vec![cup_at(120.0, 110.0)]));
            assert!(ids.is_empty());
        }
        let frame = Frame::solid(3, 320, 240, t0 + Duration::from_millis(300), [10, 10, 10]);
        let ids = engine.process_frame(frame, detections(vec![person_at(100.0, 100.0)], vec![]));

        assert_eq!(ids.len(), 1);
        let submissions = sink.0.lock();
        assert_eq!(submissions.len(), 1);
        let incident = &submissions[0].incident;
        assert_eq!(incident.status, IncidentStatus::Pending);
        assert_eq!(incident.garbage_type, "cup");
        assert_eq!(incident.evidence.clip_frames, 4);
        assert!(submissions[0].clip.is_some());
        // The admitted subject's track is gone.
        assert!(engine.tracker().is_empty());
    }

    #[test]
    fn cooldown_suppresses_repeat_within_window() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, sink) = engine(dir.path(), 10.0);
        let t0 = Instant::now();
        let held = || detections(vec![person_at(100.0, 100.0)], vec![cup_at(120.0, 110.0)]);
        let empty = || detections(vec![person_at(100.0, 100.0)], vec![]);

        let mut index = 0;
        let mut step = |engine: &mut IncidentEngine, at_ms: u64, d: FrameDetections| {
            index += 1;
            let frame = Frame::solid(index, 320, 240, t0 + Duration::from_millis(at_ms), [0, 0, 0]);
            engine.process_frame(frame, d).len()
        };

        step(&mut engine, 0, held());
        assert_eq!(step(&mut engine, 100, empty()), 1);
        // Picked up and dropped again 2 s later: suppressed.
        step(&mut engine, 2_000, held());
        assert_eq!(step(&mut engine, 2_100, empty()), 0);
        // Again after the window: a new incident.
        step(&mut engine, 11_000, held());
        assert_eq!(step(&mut engine, 11_100, empty()), 1);

        assert_eq!(sink.0.lock().len(), 2);
        assert_eq!(engine.counters().snapshot().suppressed, 1);
    }

    #[test]
    fn low_confidence_detections_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, sink) = engine(dir.path(), 10.0);
        let t0 = Instant::now();
        let faint_cup = Detection::companion("cup", 0.3, BBox::around(Point::new(120.0, 110.0), 20.0, 20.0));

        engine.process_frame(Frame::solid(0, 320, 240, t0, [0, 0, 0]), detections(vec![person_at(100.0, 100.0)], vec![faint_cup]));
        engine.process_frame(
            Frame::solid(1, 320, 240, t0 + Duration::from_millis(100), [0, 0, 0]),
            detections(vec![person_at(100.0, 100.0)], vec![]),
        );
        assert!(sink.0.lock().is_empty());
    }

    #[test]
    fn run_processes_every_frame_until_source_ends() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, sink) = engine(dir.path(), 10.0);
        let t0 = Instant::now();
        let frames: Vec<Frame> = (0..4)
            .map(|i| Frame::solid(i, 320, 240, t0 + Duration::from_millis(100 * i), [0, 0, 0]))
            .collect();
        let detector = |frame: &Frame| -> Result<FrameDetections> {
            let objects = if frame.index < 3 { vec![cup_at(120.0, 110.0)] } else { vec![] };
            Ok(detections(vec![person_at(100.0, 100.0)], objects))
        };

        let pipeline = CameraPipeline::new(
            engine,
            Box::new(IterSource(frames.into_iter())),
            Box::new(detector),
            PipelineConfig::default(),
        );
        let summary = pipeline.run().unwrap();

        assert_eq!(summary.reason, StopReason::Exhausted);
        assert_eq!(summary.counters.frames_processed, 4);
        assert_eq!(summary.counters.incidents, 1);
        assert_eq!(sink.0.lock().len(), 1);
    }

    struct SilentSource;

    impl FrameSource for SilentSource {
        fn next_frame(&mut self) -> Result<Option<Frame>> {
            thread::sleep(Duration::from_millis(500));
            Ok(None)
        }
    }

    #[test]
    fn silent_source_is_a_stall() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _sink) = engine(dir.path(), 10.0);
        let config = PipelineConfig {
            frame_timeout_secs: 0.05,
            capture_buffer: 4,
        };
        let detector = |_: &Frame| -> Result<FrameDetections> { Ok(FrameDetections::default()) };
        let pipeline = CameraPipeline::new(engine, Box::new(SilentSource), Box::new(detector), config);

        assert!(matches!(pipeline.run(), Err(Error::SourceStalled(_))));
    }

    struct FailingSource;

    impl FrameSource for FailingSource {
        fn next_frame(&mut self) -> Result<Option<Frame>> {
            Err(Error::SourceExhausted("rtsp connection reset".into()))
        }
    }

    #[test]
    fn source_error_fails_the_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _sink) = engine(dir.path(), 10.0);
        let detector = |_: &Frame| -> Result<FrameDetections> { Ok(FrameDetections::default()) };
        let pipeline = CameraPipeline::new(engine, Box::new(FailingSource), Box::new(detector), PipelineConfig::default());

        assert!(matches!(pipeline.run(), Err(Error::SourceExhausted(_))));
    }

    fn cup_script(frame: &Frame) -> FrameDetections {
        let objects = if frame.index < 3 { vec![cup_at(120.0, 110.0)] } else { vec![] };
        detections(vec![person_at(100.0, 100.0)], objects)
    }

    fn frames(count: u64) -> Vec<Frame> {
        let t0 = Instant::now();
        (0..count)
            .map(|i| Frame::solid(i, 320, 240, t0 + Duration::from_millis(100 * i), [0, 0, 0]))
            .collect()
    }

    #[test]
    fn slow_detector_is_not_a_stall() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _sink) = engine(dir.path(), 10.0);
        let config = PipelineConfig {
            frame_timeout_secs: 0.1,
            capture_buffer: 8,
        };
        let detector = |_: &Frame| -> Result<FrameDetections> {
            thread::sleep(Duration::from_millis(150));
            Ok(FrameDetections::default())
        };
        let pipeline = CameraPipeline::new(engine, Box::new(IterSource(frames(5).into_iter())), Box::new(detector), config);

        let summary = pipeline.run().unwrap();
        assert_eq!(summary.reason, StopReason::Exhausted);
        assert_eq!(summary.counters.frames_processed, 5);
    }

    #[test]
    fn failed_detection_keeps_frame_in_history() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, sink) = engine(dir.path(), 10.0);
        let detector = |frame: &Frame| -> Result<FrameDetections> {
            if frame.index == 1 {
                return Err(Error::Api("inference server returned 500".into()));
            }
            Ok(cup_script(frame))
        };
        let pipeline = CameraPipeline::new(
            engine,
            Box::new(IterSource(frames(4).into_iter())),
            Box::new(detector),
            PipelineConfig::default(),
        );

        let summary = pipeline.run().unwrap();
        assert_eq!(summary.reason, StopReason::Exhausted);
        assert_eq!(summary.counters.frames_processed, 3);
        assert_eq!(summary.counters.frames_skipped, 1);
        assert_eq!(summary.counters.incidents, 1);

        let submissions = sink.0.lock();
        let clip = submissions[0].clip.as_ref().unwrap();
        let indices: Vec<u64> = clip.frames.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    /// Blocks in `next_frame` far longer than any test timeout.
    struct HungSource;

    impl FrameSource for HungSource {
        fn next_frame(&mut self) -> Result<Option<Frame>> {
            thread::sleep(Duration::from_secs(3));
            Ok(None)
        }
    }

    #[test]
    fn stall_returns_without_waiting_for_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _sink) = engine(dir.path(), 10.0);
        let config = PipelineConfig {
            frame_timeout_secs: 0.05,
            capture_buffer: 4,
        };
        let detector = |_: &Frame| -> Result<FrameDetections> { Ok(FrameDetections::default()) };
        let pipeline = CameraPipeline::new(engine, Box::new(HungSource), Box::new(detector), config);

        let started = Instant::now();
        assert!(matches!(pipeline.run(), Err(Error::SourceStalled(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn stop_returns_without_waiting_for_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _sink) = engine(dir.path(), 10.0);
        let config = PipelineConfig {
            frame_timeout_secs: 30.0,
            capture_buffer: 4,
        };
        let detector = |_: &Frame| -> Result<FrameDetections> { Ok(FrameDetections::default()) };
        let pipeline = CameraPipeline::new(engine, Box::new(HungSource), Box::new(detector), config);
        let stop = pipeline.stop_handle();

        let runner = thread::spawn(move || pipeline.run());
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        stop.stop();
        let summary = runner.join().unwrap().unwrap();
        assert_eq!(summary.reason, StopReason::Requested);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
