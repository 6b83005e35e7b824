// THEORY:
// The supervisor owns the set of running cameras. Each camera runs its
// `CameraPipeline` on the blocking thread pool, so detector calls never stall
// the async runtime that the dispatcher workers live on.
//
// Key architectural principles:
// 1.  **One Pipeline per Camera Id**: Starting an id that is already running is
//     an error. A stopped or failed camera may be started again, which replaces
//     its entry.
// 2.  **Failures Stay Local**: A pipeline that fails is marked `Failed` with the
//     reason; other cameras and the dispatcher are untouched.

use crate::config::EngineConfig;
use crate::detection::Detector;
use crate::dispatcher::IncidentSink;
use crate::error::{Error, Result};
use crate::frame::FrameSource;
use crate::incident::IncidentAllocator;
use crate::pipeline::{CameraPipeline, CounterSnapshot, IncidentEngine, PipelineCounters, StopHandle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraStatus {
    Running,
    Stopped,
    Failed(String),
}

/// What the supervisor needs to bring one camera up.
pub struct CameraSetup {
    pub camera_id: String,
    pub location: String,
    pub source: Box<dyn FrameSource>,
    pub detector: Box<dyn Detector>,
}

/// Health view of one camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraInfo {
    pub camera_id: String,
    pub location: String,
    pub status: CameraStatus,
    pub counters: CounterSnapshot,
}

struct CameraEntry {
    location: String,
    status: Arc<Mutex<CameraStatus>>,
    counters: Arc<PipelineCounters>,
    stop: StopHandle,
    task: Option<JoinHandle<()>>,
}

impl CameraEntry {
    fn info(&self, camera_id: &str) -> CameraInfo {
        CameraInfo {
            camera_id: camera_id.to_string(),
            location: self.location.clone(),
            status: self.status.lock().clone(),
            counters: self.counters.snapshot(),
        }
    }
}

pub struct CameraSupervisor {
    config: EngineConfig,
    allocator: Arc<IncidentAllocator>,
    sink: Arc<dyn IncidentSink>,
    cameras: Mutex<HashMap<String, CameraEntry>>,
}

impl CameraSupervisor {
    pub fn new(config: EngineConfig, sink: Arc<dyn IncidentSink>) -> Self {
        Self {
            config,
            allocator: Arc::new(IncidentAllocator::new()),
            sink,
            cameras: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a pipeline for the camera. Must be called from within a tokio runtime.
    pub fn start(&self, setup: CameraSetup) -> Result<()> {
        let mut cameras = self.cameras.lock();
        if let Some(entry) = cameras.get(&setup.camera_id) {
            if *entry.status.lock() == CameraStatus::Running {
                return Err(Error::AlreadyRunning(setup.camera_id));
            }
        }

        let engine = IncidentEngine::new(
            setup.camera_id.clone(),
            setup.location.clone(),
            &self.config,
            Arc::clone(&self.allocator),
            Arc::clone(&self.sink),
        );
        let pipeline = CameraPipeline::new(engine, setup.source, setup.detector, self.config.pipeline.clone());
        let status = Arc::new(Mutex::new(CameraStatus::Running));
        let counters = pipeline.counters();
        let stop = pipeline.stop_handle();

        let task_status = Arc::clone(&status);
        let camera_id = setup.camera_id.clone();
        let task = tokio::task::spawn_blocking(move || {
            let outcome = pipeline.run();
            let mut status = task_status.lock();
            *status = match outcome {
                Ok(_) => CameraStatus::Stopped,
                Err(e) => {
                    error!(camera_id = %camera_id, error = %e, "Camera marked failed");
                    CameraStatus::Failed(e.to_string())
                }
            };
        });

        info!(camera_id = %setup.camera_id, location = %setup.location, "Camera started");
        cameras.insert(
            setup.camera_id,
            CameraEntry {
                location: setup.location,
                status,
                counters,
                stop,
                task: Some(task),
            },
        );
        Ok(())
    }

    /// Stops the camera after its in-flight frame and waits for it to wind down.
    pub async fn stop(&self, camera_id: &str) -> Result<CameraInfo> {
        let task = {
            let mut cameras = self.cameras.lock();
            let entry = cameras
                .get_mut(camera_id)
                .ok_or_else(|| Error::NotRunning(camera_id.to_string()))?;
            entry.stop.stop();
            entry.task.take()
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(camera_id, error = %e, "Camera task panicked");
            }
        }
        info!(camera_id, "Camera stopped");
        self.status(camera_id)
            .ok_or_else(|| Error::NotRunning(camera_id.to_string()))
    }

    pub fn status(&self, camera_id: &str) -> Option<CameraInfo> {
        self.cameras.lock().get(camera_id).map(|entry| entry.info(camera_id))
    }

    /// All known cameras, sorted by id.
    pub fn list(&self) -> Vec<CameraInfo> {
        let mut cameras: Vec<CameraInfo> = self
            .cameras
            .lock()
            .iter()
            .map(|(id, entry)| entry.info(id))
            .collect();
        cameras.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        cameras
    }

    /// Stops every camera.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.cameras.lock().keys().cloned().collect();
        for id in ids {
            let _ = self.stop(&id).await;
        }
    }
}
