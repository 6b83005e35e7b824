mod reporter;
mod script;
mod source;

use anyhow::{Context, bail};
use litter_watch::incident::IncidentAllocator;
use litter_watch::{CameraPipeline, EngineConfig, EvidenceDispatcher, IncidentEngine};
use reporter::LoggingApi;
use script::ScriptedDetector;
use source::ImageSequenceSource;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_FPS: f64 = 30.0;

struct Args {
    frames_dir: PathBuf,
    script: PathBuf,
    fps: f64,
    evidence_dir: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        bail!("Usage: replay_tester <frames_dir> <detections.jsonl> [fps] [evidence_dir]");
    }
    let fps = match args.get(3) {
        Some(raw) => raw.parse().with_context(|| format!("invalid fps {raw:?}"))?,
        None => DEFAULT_FPS,
    };
    Ok(Args {
        frames_dir: PathBuf::from(&args[1]),
        script: PathBuf::from(&args[2]),
        fps,
        evidence_dir: args.get(4).map(PathBuf::from),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // --- 1. Argument Parsing & Setup ---
    let args = parse_args()?;
    let mut config = EngineConfig::from_env().context("loading engine config")?;
    if let Some(dir) = args.evidence_dir {
        config.evidence.root_dir = dir;
    }

    // --- 2. Source & Detector ---
    let source = ImageSequenceSource::open(&args.frames_dir, args.fps)
        .with_context(|| format!("opening {}", args.frames_dir.display()))?;
    let detector = ScriptedDetector::load(&args.script, config.tracker.min_confidence)
        .with_context(|| format!("reading {}", args.script.display()))?;
    info!(frames = source.len(), scripted = detector.frames(), fps = args.fps, "Replay loaded");

    // --- 3. Engine Initialization ---
    let dispatcher = EvidenceDispatcher::spawn(config.dispatch.clone(), Arc::new(LoggingApi::default()));
    let mut reports = dispatcher.subscribe();
    let engine = IncidentEngine::new(
        "replay",
        args.frames_dir.display().to_string(),
        &config,
        Arc::new(IncidentAllocator::new()),
        Arc::new(dispatcher.handle()),
    );
    let pipeline = CameraPipeline::new(engine, Box::new(source), Box::new(detector), config.pipeline.clone());

    // --- 4. Replay ---
    let summary = tokio::task::spawn_blocking(move || pipeline.run()).await??;
    let stats = dispatcher.shutdown().await;

    // --- 5. Report ---
    while let Ok(incident) = reports.try_recv() {
        println!(
            "{} #{} {:?} garbage={} screenshot={}",
            incident.incident_id,
            incident.incident_number,
            incident.status,
            incident.garbage_type,
            incident.evidence.screenshot_path.display()
        );
    }
    println!(
        "Replay complete: {} frames, {} incidents ({} suppressed), {} delivered, {} failed, {} dropped.",
        summary.counters.frames_processed,
        summary.counters.incidents,
        summary.counters.suppressed,
        stats.delivered,
        stats.failed,
        stats.dropped
    );
    Ok(())
}
