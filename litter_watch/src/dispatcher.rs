// THEORY:
// The dispatcher decouples evidence delivery from frame processing. Camera
// pipelines hand incidents over with `submit`, which only enqueues and returns;
// a small pool of tokio workers drains the queue, renders each incident's clip on
// the blocking pool, keeps a local JSON copy of the incident, uploads its
// artifacts and finally files the record with the reporting API.
//
// Key architectural principles:
// 1.  **Never Block the Camera**: The queue is bounded. When it is full the
//     oldest submission not yet picked up by a worker is evicted and counted as
//     dropped. Its artifacts stay on disk; only delivery is skipped.
// 2.  **Independent Retries**: Every artifact upload and the record submission
//     is retried on its own with exponential backoff and a per-call timeout. A
//     failed artifact falls back to its local path in the record.
// 3.  **Evidence Is Never Deleted**: After retries run out the incident is marked
//     `Failed`, the local record is rewritten with that status, and the artifact
//     files are left where they are.
// 4.  **Graceful Drain**: `shutdown` stops intake and lets the workers finish
//     everything already queued.

use crate::clip::ClipJob;
use crate::config::{DispatchConfig, RetryPolicy};
use crate::error::{Error, Result};
use crate::incident::{ArtifactKind, Incident, IncidentStatus, MediaKind, OmittedArtifact, Submission};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const REPORT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateIncidentResponse {
    pub incident_id: String,
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedArtifact {
    pub url: String,
}

/// The backend that receives incidents and their media.
///
/// Both calls may be repeated for the same incident after a timeout, so the
/// implementation must deduplicate by incident id.
#[async_trait]
pub trait ReportingApi: Send + Sync {
    async fn create_incident(&self, incident: &Incident) -> Result<CreateIncidentResponse>;

    async fn upload_artifact(&self, bytes: Vec<u8>, kind: MediaKind, file_name: &str) -> Result<UploadedArtifact>;
}

/// Anything that accepts assembled incidents without blocking the caller.
pub trait IncidentSink: Send + Sync {
    fn submit(&self, submission: Submission);
}

/// Point-in-time copy of the dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub submitted: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
    pub queued: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

struct Shared {
    queue: Mutex<VecDeque<Submission>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    counters: Counters,
    reports: broadcast::Sender<Incident>,
}

impl Shared {
    fn enqueue(&self, submission: Submission) {
        if self.closed.load(Ordering::Acquire) {
            warn!(incident_id = %submission.incident.incident_id, "Dispatcher closed, incident not queued");
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let evicted = {
            let mut queue = self.queue.lock();
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(submission);
            evicted
        };
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        if let Some(Submission { incident: old, .. }) = evicted {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                incident_id = %old.incident_id,
                camera_id = %old.camera_id,
                "Dispatch queue full, dropped oldest pending incident"
            );
        }
        self.notify.notify_one();
    }

    fn stats(&self) -> DispatchStats {
        DispatchStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            queued: self.queue.lock().len(),
        }
    }
}

/// Cloneable producer side of the dispatcher, handed to camera pipelines.
#[derive(Clone)]
pub struct DispatcherHandle {
    shared: Arc<Shared>,
}

impl DispatcherHandle {
    pub fn stats(&self) -> DispatchStats {
        self.shared.stats()
    }
}

impl IncidentSink for DispatcherHandle {
    fn submit(&self, submission: Submission) {
        self.shared.enqueue(submission);
    }
}

pub struct EvidenceDispatcher {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl EvidenceDispatcher {
    /// Starts the worker pool. Must be called from within a tokio runtime.
    pub fn spawn<A>(config: DispatchConfig, api: Arc<A>) -> Self
    where
        A: ReportingApi + 'static,
    {
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(config.queue_capacity)),
            capacity: config.queue_capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
            reports,
        });

        let config = Arc::new(config);
        let workers = (0..config.workers.max(1))
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                let api = Arc::clone(&api);
                let config = Arc::clone(&config);
                tokio::spawn(async move { worker_loop(worker_id, shared, api, config).await })
            })
            .collect();

        Self { shared, workers }
    }

    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.shared.stats()
    }

    /// Every incident leaving the dispatcher, with its final status.
    pub fn subscribe(&self) -> broadcast::Receiver<Incident> {
        self.shared.reports.subscribe()
    }

    /// Stops accepting work and waits until the queue has been drained.
    pub async fn shutdown(self) -> DispatchStats {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
        for result in join_all(self.workers).await {
            if let Err(e) = result {
                error!(error = %e, "Dispatch worker panicked");
            }
        }
        self.shared.stats()
    }
}

impl IncidentSink for EvidenceDispatcher {
    fn submit(&self, submission: Submission) {
        self.shared.enqueue(submission);
    }
}

async fn worker_loop<A: ReportingApi>(worker_id: usize, shared: Arc<Shared>, api: Arc<A>, config: Arc<DispatchConfig>) {
    debug!(worker_id, "Dispatch worker started");
    loop {
        // Register interest before checking, so a notify between the check and
        // the await is not lost.
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let next = shared.queue.lock().pop_front();
        match next {
            Some(submission) => {
                let incident = deliver(api.as_ref(), &config, submission).await;
                match incident.status {
                    IncidentStatus::Delivered => shared.counters.delivered.fetch_add(1, Ordering::Relaxed),
                    _ => shared.counters.failed.fetch_add(1, Ordering::Relaxed),
                };
                let _ = shared.reports.send(incident);
            }
            None if shared.closed.load(Ordering::Acquire) => break,
            None => notified.await,
        }
    }
    debug!(worker_id, "Dispatch worker stopped");
}

/// Runs the full delivery of one incident and returns it with its final status.
pub async fn deliver<A: ReportingApi + ?Sized>(api: &A, config: &DispatchConfig, submission: Submission) -> Incident {
    let Submission { mut incident, clip } = submission;

    // --- 1. Clip ---
    if let Some(job) = clip {
        render_clip(&mut incident, job).await;
    }

    let record_path = incident.evidence.record_path.clone();
    if let Err(e) = write_record(&record_path, &incident).await {
        warn!(incident_id = %incident.incident_id, error = %e, "Could not persist local record");
    }

    let mut failed = false;

    // --- 2. Artifacts ---
    for (kind, path) in incident.evidence.artifacts() {
        match upload_file(api, config, &path, kind).await {
            Ok(url) => incident.remote.set(kind, url),
            Err(e) => {
                failed = true;
                error!(
                    incident_id = %incident.incident_id,
                    kind = %kind,
                    path = %path.display(),
                    error = %e,
                    "Artifact upload failed, keeping local copy"
                );
            }
        }
    }

    // --- 3. Record ---
    let record = &incident;
    let submitted = with_retry(&config.retry, config.record_timeout(), ArtifactKind::Record, move || async move {
        let response = api.create_incident(record).await?;
        if response.accepted {
            Ok(response)
        } else {
            Err(Error::Rejected(response.incident_id))
        }
    })
    .await;
    if let Err(e) = submitted {
        failed = true;
        error!(incident_id = %incident.incident_id, error = %e, "Incident record submission failed");
    }

    incident.status = if failed {
        IncidentStatus::Failed
    } else {
        IncidentStatus::Delivered
    };

    if let Err(e) = write_record(&record_path, &incident).await {
        warn!(incident_id = %incident.incident_id, error = %e, "Could not update local record");
    }
    info!(
        incident_id = %incident.incident_id,
        camera_id = %incident.camera_id,
        status = ?incident.status,
        "Incident dispatch finished"
    );
    incident
}

/// Encodes the clip off the async workers. A clip that cannot be written is
/// recorded as omitted, like any other missing artifact.
async fn render_clip(incident: &mut Incident, job: ClipJob) {
    let reason = match tokio::task::spawn_blocking(move || job.render()).await {
        Ok(Ok(written)) => {
            incident.evidence.clip_frames = written;
            return;
        }
        Ok(Err(e)) => e.to_string(),
        Err(e) => e.to_string(),
    };
    warn!(incident_id = %incident.incident_id, reason = %reason, "Clip omitted");
    let evidence = &mut incident.evidence;
    evidence.video_clip_path = None;
    evidence.clip_frames = 0;
    evidence.clip_fps = 0.0;
    evidence.omitted.push(OmittedArtifact {
        kind: ArtifactKind::Clip,
        reason,
    });
}

async fn upload_file<A: ReportingApi + ?Sized>(api: &A, config: &DispatchConfig, path: &Path, kind: ArtifactKind) -> Result<String> {
    let bytes = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| kind.as_str().to_string());
    let file_name = file_name.as_str();
    let uploaded = with_retry(&config.retry, config.upload_timeout(), kind, move || {
        api.upload_artifact(bytes.clone(), kind.media(), file_name)
    })
    .await?;
    Ok(uploaded.url)
}

/// Calls `op` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of attempts. Each attempt is bounded by `timeout`.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, timeout: Duration, kind: ArtifactKind, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;
    for attempt in 0..attempts {
        let result = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout)),
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                warn!(kind = %kind, attempt = attempt + 1, max_attempts = attempts, error = %e, "Delivery attempt failed, retrying");
                last_error = Some(e);
                if attempt + 1 < attempts {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                }
            }
        }
    }
    Err(Error::Upload {
        kind,
        attempts,
        reason: last_error.map(|e| e.to_string()).unwrap_or_default(),
    })
}

async fn write_record(path: &Path, incident: &Incident) -> Result<()> {
    let json = serde_json::to_vec_pretty(incident)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::incident::{Evidence, IncidentAllocator, IncidentKind, IncidentMetadata, RemoteEvidence};
    use chrono::Utc;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;
    use tokio::sync::Semaphore;

    /// Fails the first `failures` upload calls, then succeeds.
    struct FlakyApi {
        failures: u32,
        uploads: AtomicU32,
        records: AtomicU32,
    }

    impl FlakyApi {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                uploads: AtomicU32::new(0),
                records: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ReportingApi for FlakyApi {
        async fn create_incident(&self, incident: &Incident) -> Result<CreateIncidentResponse> {
            self.records.fetch_add(1, Ordering::SeqCst);
            Ok(CreateIncidentResponse {
                incident_id: incident.incident_id.to_string(),
                accepted: true,
            })
        }

        async fn upload_artifact(&self, _bytes: Vec<u8>, _kind: MediaKind, file_name: &str) -> Result<UploadedArtifact> {
            let call = self.uploads.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(Error::Api(format!("503 on attempt {}", call + 1)));
            }
            Ok(UploadedArtifact {
                url: format!("https://cdn.example/{file_name}"),
            })
        }
    }

    /// Blocks every upload until the gate opens.
    struct GatedApi {
        gate: Semaphore,
        started: Notify,
    }

    #[async_trait]
    impl ReportingApi for GatedApi {
        async fn create_incident(&self, incident: &Incident) -> Result<CreateIncidentResponse> {
            Ok(CreateIncidentResponse {
                incident_id: incident.incident_id.to_string(),
                accepted: true,
            })
        }

        async fn upload_artifact(&self, _bytes: Vec<u8>, _kind: MediaKind, _file_name: &str) -> Result<UploadedArtifact> {
            self.started.notify_one();
            let _permit = self.gate.acquire().await.map_err(|e| Error::Api(e.to_string()))?;
            Ok(UploadedArtifact { url: "https://cdn.example/x".into() })
        }
    }

    struct RejectingApi;

    #[async_trait]
    impl ReportingApi for RejectingApi {
        async fn create_incident(&self, incident: &Incident) -> Result<CreateIncidentResponse> {
            Ok(CreateIncidentResponse {
                incident_id: incident.incident_id.to_string(),
                accepted: false,
            })
        }

        async fn upload_artifact(&self, _bytes: Vec<u8>, _kind: MediaKind, _file_name: &str) -> Result<UploadedArtifact> {
            Ok(UploadedArtifact { url: "https://cdn.example/x".into() })
        }
    }

    struct SlowApi;

    #[async_trait]
    impl ReportingApi for SlowApi {
        async fn create_incident(&self, incident: &Incident) -> Result<CreateIncidentResponse> {
            Ok(CreateIncidentResponse {
                incident_id: incident.incident_id.to_string(),
                accepted: true,
            })
        }

        async fn upload_artifact(&self, _bytes: Vec<u8>, _kind: MediaKind, _file_name: &str) -> Result<UploadedArtifact> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(UploadedArtifact { url: "https://cdn.example/slow".into() })
        }
    }

    fn config(max_attempts: u32) -> DispatchConfig {
        DispatchConfig {
            workers: 1,
            queue_capacity: 8,
            retry: RetryPolicy {
                max_attempts,
                base_delay_ms: 1,
                max_delay_ms: 4,
            },
            upload_timeout_ms: 1_000,
            record_timeout_ms: 1_000,
        }
    }

    fn incident_in(dir: &Path, number: u64) -> Incident {
        let screenshot: PathBuf = dir.join(format!("cam1_screenshot_{number}.jpg"));
        std::fs::write(&screenshot, b"\xFF\xD8\xFF fake jpeg").unwrap();
        let (incident_id, _) = IncidentAllocator::with_epoch(1).allocate("cam1");
        Incident {
            incident_id,
            incident_number: number,
            camera_id: "cam1".into(),
            location: "Main Street".into(),
            detected_at: Utc::now(),
            kind: IncidentKind::DisappearanceAfterProximity,
            garbage_type: "cup".into(),
            confidence: 0.9,
            description: "test".into(),
            evidence: Evidence {
                culprit_face_path: None,
                person_crop_path: None,
                screenshot_path: screenshot,
                video_clip_path: None,
                record_path: dir.join(format!("cam1_record_{number}.json")),
                clip_frames: 0,
                clip_fps: 0.0,
                omitted: Vec::new(),
            },
            remote: RemoteEvidence::default(),
            metadata: IncidentMetadata {
                subject_key: "cam1_100_100".into(),
                frames_observed: 4,
                frames_with_companion: 3,
                companion_count: 1,
                person_confidence: 0.9,
                companion_confidence: Some(0.8),
            },
            status: IncidentStatus::Pending,
        }
    }

    fn with_clip(mut incident: Incident, path: PathBuf) -> Submission {
        let t0 = Instant::now();
        let frames: Vec<Frame> = (0..6u64)
            .map(|i| Frame::solid(i, 32, 32, t0 + Duration::from_millis(100 * i), [0, 0, (i * 40) as u8]))
            .collect();
        let job = ClipJob::new(path.clone(), frames, 30.0);
        incident.evidence.video_clip_path = Some(path);
        incident.evidence.clip_frames = job.frames.len();
        incident.evidence.clip_fps = job.fps;
        Submission {
            incident,
            clip: Some(job),
        }
    }

    #[tokio::test]
    async fn delivers_after_three_failures() {
        let dir = tempfile::tempdir().unwrap();
        let api = FlakyApi::new(3);
        let incident = deliver(&api, &config(5), incident_in(dir.path(), 1).into()).await;

        assert_eq!(incident.status, IncidentStatus::Delivered);
        assert_eq!(api.uploads.load(Ordering::SeqCst), 4);
        assert_eq!(
            incident.remote.screenshot_url.as_deref(),
            Some("https://cdn.example/cam1_screenshot_1.jpg")
        );

        let saved: Incident = serde_json::from_slice(&std::fs::read(&incident.evidence.record_path).unwrap()).unwrap();
        assert_eq!(saved.status, IncidentStatus::Delivered);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_failed_and_keep_evidence() {
        let dir = tempfile::tempdir().unwrap();
        let api = FlakyApi::new(u32::MAX);
        let incident = deliver(&api, &config(3), incident_in(dir.path(), 1).into()).await;

        assert_eq!(incident.status, IncidentStatus::Failed);
        assert_eq!(api.uploads.load(Ordering::SeqCst), 3);
        assert!(!incident.evidence.screenshot_path.as_os_str().is_empty());
        assert!(incident.evidence.screenshot_path.exists());
        assert!(incident.remote.screenshot_url.is_none());
        // The record is still filed, pointing at local paths.
        assert_eq!(api.records.load(Ordering::SeqCst), 1);

        let saved: Incident = serde_json::from_slice(&std::fs::read(&incident.evidence.record_path).unwrap()).unwrap();
        assert_eq!(saved.status, IncidentStatus::Failed);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let incident = deliver(&RejectingApi, &config(5), incident_in(dir.path(), 1).into()).await;
        assert_eq!(incident.status, IncidentStatus::Failed);
        assert!(incident.remote.screenshot_url.is_some());
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(2);
        cfg.upload_timeout_ms = 20;
        let incident = deliver(&SlowApi, &cfg, incident_in(dir.path(), 1).into()).await;
        assert_eq!(incident.status, IncidentStatus::Failed);
    }

    #[tokio::test]
    async fn queue_overflow_drops_oldest_pending() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(GatedApi {
            gate: Semaphore::new(0),
            started: Notify::new(),
        });
        let mut cfg = config(1);
        cfg.queue_capacity = 2;
        let dispatcher = EvidenceDispatcher::spawn(cfg, Arc::clone(&api));
        let handle = dispatcher.handle();
        let mut reports = dispatcher.subscribe();

        handle.submit(incident_in(dir.path(), 1).into());
        // Wait until the worker has taken #1 off the queue.
        api.started.notified().await;

        handle.submit(incident_in(dir.path(), 2).into());
        handle.submit(incident_in(dir.path(), 3).into());
        handle.submit(incident_in(dir.path(), 4).into());

        let stats = handle.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.queued, 2);

        api.gate.add_permits(16);
        let stats = dispatcher.shutdown().await;
        assert_eq!(stats.submitted, 4);
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.queued, 0);

        let mut delivered = Vec::new();
        while let Ok(incident) = reports.try_recv() {
            delivered.push(incident.incident_number);
        }
        assert_eq!(delivered, vec![1, 3, 4]);
    }

    #[tokio::test]
    async fn shutdown_drains_queue() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = EvidenceDispatcher::spawn(config(1), Arc::new(FlakyApi::new(0)));
        for n in 1..=5 {
            dispatcher.submit(incident_in(dir.path(), n).into());
        }
        let stats = dispatcher.shutdown().await;
        assert_eq!(stats.delivered, 5);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn clip_is_rendered_before_upload() {
        let dir = tempfile::tempdir().unwrap();
        let api = FlakyApi::new(0);
        let clip_path = dir.path().join("cam1_clip_1.mp4");
        let submission = with_clip(incident_in(dir.path(), 1), clip_path.clone());
        let incident = deliver(&api, &config(1), submission).await;

        assert_eq!(incident.status, IncidentStatus::Delivered);
        assert!(clip_path.exists());
        assert_eq!(incident.evidence.clip_frames, 6);
        assert_eq!(incident.evidence.clip_fps, 10.0);
        assert_eq!(
            incident.remote.video_clip_url.as_deref(),
            Some("https://cdn.example/cam1_clip_1.mp4")
        );
        // Screenshot and clip.
        assert_eq!(api.uploads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unwritable_clip_is_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let clip_path = dir.path().join("missing").join("cam1_clip_1.mp4");
        let submission = with_clip(incident_in(dir.path(), 1), clip_path);
        let incident = deliver(&FlakyApi::new(0), &config(1), submission).await;

        assert_eq!(incident.status, IncidentStatus::Delivered);
        assert!(incident.evidence.video_clip_path.is_none());
        assert_eq!(incident.evidence.clip_frames, 0);
        let kinds: Vec<ArtifactKind> = incident.evidence.omitted.iter().map(|o| o.kind).collect();
        assert_eq!(kinds, vec![ArtifactKind::Clip]);
        assert!(incident.remote.video_clip_url.is_none());

        let saved: Incident = serde_json::from_slice(&std::fs::read(&incident.evidence.record_path).unwrap()).unwrap();
        assert!(saved.evidence.video_clip_path.is_none());
    }
}
