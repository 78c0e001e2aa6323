use crate::config::Config;
use chrono::{DateTime, Utc};
use footfall_core::detector::DetectorError;
use footfall_core::{
    Frame, FrameSource, OnnxEmbedder, Outcome, Pipeline, PipelineError, PipelineEvent, PipelineStats, ProviderError,
    RankedCrop, ScrfdDetector, SessionState, StoreError, VisitOutcome, VisitorId,
};
use footfall_hw::{Camera, CameraError, ImageSequence, ReplayError};
use footfall_store::SqliteStore;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("replay error: {0}")]
    Replay(#[from] ReplayError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedding model error: {0}")]
    Embedder(ProviderError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("cannot write snapshot {path}: {reason}")]
    Snapshot { path: PathBuf, reason: String },
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited during startup")]
    StartupAborted,
}

type DaemonPipeline = Pipeline<Box<dyn FrameSource>, ScrfdDetector, OnnxEmbedder, SqliteStore>;

/// One recorded visit, as reported to D-Bus clients and the log.
#[derive(Debug, Clone, Serialize)]
pub struct VisitSummary {
    pub session_id: String,
    pub outcome: Outcome,
    pub visitor_id: VisitorId,
    pub similarity: Option<f32>,
    pub quality: f32,
    pub observations: usize,
    pub sequence_index: u32,
    pub at: DateTime<Utc>,
    pub sample_image: Option<String>,
}

impl VisitSummary {
    fn new(visit: &VisitOutcome, at: DateTime<Utc>, sample_image: Option<String>) -> Self {
        Self {
            session_id: visit.session_id.clone(),
            outcome: visit.outcome,
            visitor_id: visit.visitor_id,
            similarity: visit.similarity,
            quality: visit.quality.composite,
            observations: visit.observations,
            sequence_index: visit.sequence_index,
            at,
            sample_image,
        }
    }
}

/// Snapshot of the engine shared with the D-Bus interface.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub source: String,
    pub store: String,
    pub state: SessionState,
    pub stats: PipelineStats,
    pub unique_visitors: u64,
    pub started_at: DateTime<Utc>,
    pub last_visit: Option<VisitSummary>,
    pub last_error: Option<String>,
}

impl EngineStatus {
    fn new(source: String, store: String) -> Self {
        Self {
            running: true,
            source,
            store,
            state: SessionState::Idle,
            stats: PipelineStats::default(),
            unique_visitors: 0,
            started_at: Utc::now(),
            last_visit: None,
            last_error: None,
        }
    }
}

pub type SharedStatus = Arc<Mutex<EngineStatus>>;

/// Lock the shared status, recovering from a poisoned lock.
pub fn lock_status(status: &SharedStatus) -> MutexGuard<'_, EngineStatus> {
    status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Messages from the engine thread to the async side.
#[derive(Debug)]
pub enum EngineEvent {
    Visit(VisitSummary),
    Stopped { stats: PipelineStats, error: Option<String> },
}

/// Handle to the engine thread.
pub struct EngineHandle {
    shutdown: Arc<AtomicBool>,
    status: SharedStatus,
    thread: JoinHandle<()>,
}

impl EngineHandle {
    pub fn status(&self) -> SharedStatus {
        Arc::clone(&self.status)
    }

    /// Ask the loop to exit after the current frame.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Wait for the thread and return the final counters.
    pub fn join(self) -> PipelineStats {
        self.stop();
        if self.thread.join().is_err() {
            tracing::error!("engine thread panicked");
        }
        lock_status(&self.status).stats.clone()
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The frame source, both ONNX models and the database are opened on the
/// engine thread itself; this call blocks until they are ready and fails
/// fast if any of them is unavailable.
pub fn spawn_engine(config: Config, events: mpsc::UnboundedSender<EngineEvent>) -> Result<EngineHandle, EngineError> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let status: SharedStatus = Arc::new(Mutex::new(EngineStatus::new(
        source_label(&config),
        config.db_path.display().to_string(),
    )));
    let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<(), EngineError>>(1);

    let thread = {
        let shutdown = Arc::clone(&shutdown);
        let status = Arc::clone(&status);
        std::thread::Builder::new()
            .name("footfall-engine".into())
            .spawn(move || {
                let pipeline = match build_pipeline(&config) {
                    Ok(p) => p,
                    Err(e) => {
                        lock_status(&status).running = false;
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                tracing::info!("engine thread started");

                let mut engine = Engine {
                    pipeline,
                    config,
                    shutdown,
                    status,
                    events,
                };
                engine.run();
                tracing::info!("engine thread exiting");
            })
            .map_err(EngineError::Spawn)?
    };

    ready_rx.recv().map_err(|_| EngineError::StartupAborted)??;
    Ok(EngineHandle {
        shutdown,
        status,
        thread,
    })
}

fn source_label(config: &Config) -> String {
    match &config.replay_dir {
        Some(dir) => format!("replay:{}", dir.display()),
        None => format!("camera:{}", config.camera.device),
    }
}

fn build_pipeline(config: &Config) -> Result<DaemonPipeline, EngineError> {
    let source: Box<dyn FrameSource> = match &config.replay_dir {
        Some(dir) => Box::new(ImageSequence::open(dir)?),
        None => Box::new(Camera::open((&config.camera).into())?),
    };

    let detector_path = config.model_dir.join(footfall_core::embedder::DETECTOR_MODEL);
    let detector = ScrfdDetector::load(&detector_path)?;
    tracing::info!(path = %detector_path.display(), "SCRFD detector loaded");

    let embedder = OnnxEmbedder::load(&config.model_dir).map_err(EngineError::Embedder)?;
    tracing::info!(dir = %config.model_dir.display(), "embedding models loaded");

    let store = SqliteStore::open(&config.db_path)?;

    let mut pipeline_config = config.pipeline.clone();
    pipeline_config.keep_ranked_crops = config.debug_dir.is_some();

    Ok(Pipeline::new(source, detector, embedder, store, pipeline_config)?)
}

struct Engine {
    pipeline: DaemonPipeline,
    config: Config,
    shutdown: Arc<AtomicBool>,
    status: SharedStatus,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl Engine {
    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn run(&mut self) {
        let pace = self.frame_interval();
        let mut source_failures = 0u32;
        let mut fatal: Option<String> = None;

        self.refresh_visitor_count();
        while !self.stopping() {
            let started = Instant::now();

            match self.pipeline.process_next_frame() {
                Ok(PipelineEvent::EndOfStream) => {
                    tracing::info!("frame source exhausted");
                    break;
                }
                Ok(event) => {
                    source_failures = 0;
                    self.handle_event(event);
                }
                Err(PipelineError::Source(e)) => {
                    source_failures += 1;
                    tracing::warn!(error = %e, consecutive = source_failures, "frame read failed");
                    if source_failures >= self.config.reconnect_after_failures.max(1) {
                        self.reconnect();
                        source_failures = 0;
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "visit not recorded");
                    lock_status(&self.status).last_error = Some(e.to_string());
                }
                Err(e) => {
                    tracing::error!(error = %e, "engine stopping on unrecoverable error");
                    fatal = Some(e.to_string());
                    break;
                }
            }

            self.dump_ranked_crops();
            self.publish();
            if let Some(pace) = pace {
                let elapsed = started.elapsed();
                if elapsed < pace {
                    self.sleep(pace - elapsed);
                }
            }
        }

        let stats = {
            let mut status = lock_status(&self.status);
            status.running = false;
            status.stats = self.pipeline.stats().clone();
            if fatal.is_some() {
                status.last_error.clone_from(&fatal);
            }
            status.stats.clone()
        };
        let _ = self.events.send(EngineEvent::Stopped { stats, error: fatal });
    }

    /// Replay is paced to `replay_fps`; live cameras pace themselves.
    fn frame_interval(&self) -> Option<Duration> {
        self.config.replay_dir.as_ref().and_then(|_| self.config.replay_interval())
    }

    fn dump_ranked_crops(&mut self) {
        let crops = self.pipeline.take_ranked_crops();
        let Some(dir) = &self.config.debug_dir else {
            return;
        };
        if crops.is_empty() {
            return;
        }
        match save_ranked_crops(dir, &crops) {
            Ok(paths) => tracing::debug!(dir = %dir.display(), count = paths.len(), "ranked crops saved"),
            Err(e) => tracing::warn!(error = %e, "failed to save ranked crops"),
        }
    }

    fn handle_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::SessionStarted { session_id } => {
                tracing::debug!(session = %session_id, "capture session started");
            }
            PipelineEvent::Discarded { session_id, reason } => {
                tracing::info!(session = %session_id, ?reason, "session discarded");
            }
            PipelineEvent::Completed(visit) => self.record_visit(&visit),
            PipelineEvent::NoEvent | PipelineEvent::SessionProgressed { .. } | PipelineEvent::EndOfStream => {}
        }
    }

    fn record_visit(&mut self, visit: &VisitOutcome) {
        let mut sample_image = None;
        if visit.outcome == Outcome::New {
            if let Some(dir) = self.config.snapshot_dir() {
                match save_snapshot(dir, visit) {
                    Ok(path) => {
                        let path = path.display().to_string();
                        match self.pipeline.store_mut().attach_sample_image(visit.visitor_id, &path) {
                            Ok(()) => sample_image = Some(path),
                            Err(e) => tracing::warn!(error = %e, visitor = visit.visitor_id, "failed to record sample image"),
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to save visitor snapshot"),
                }
            }
        }

        let summary = VisitSummary::new(visit, Utc::now(), sample_image);
        lock_status(&self.status).last_visit = Some(summary.clone());
        self.refresh_visitor_count();
        let _ = self.events.send(EngineEvent::Visit(summary));
    }

    fn refresh_visitor_count(&self) {
        match self.pipeline.store().visitor_count() {
            Ok(n) => lock_status(&self.status).unique_visitors = n,
            Err(e) => tracing::debug!(error = %e, "visitor count unavailable"),
        }
    }

    fn publish(&self) {
        let mut status = lock_status(&self.status);
        status.state = self.pipeline.state();
        status.stats.clone_from(self.pipeline.stats());
    }

    /// Reset the frame source, retrying until it comes back or shutdown.
    fn reconnect(&mut self) {
        let delay = self.config.reconnect_delay();
        while !self.stopping() {
            tracing::warn!(delay_secs = self.config.reconnect_delay_secs, "reconnecting frame source");
            self.sleep(delay);
            match self.pipeline.source_mut().reset() {
                Ok(()) => {
                    tracing::info!("frame source reconnected");
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "reconnect failed");
                    lock_status(&self.status).last_error = Some(e.to_string());
                }
            }
        }
    }

    fn sleep(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.stopping() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(SHUTDOWN_POLL));
        }
    }
}

/// Write the visit's face crop as `visitor_<id>_<session>.png` under `dir`.
pub fn save_snapshot(dir: &Path, visit: &VisitOutcome) -> Result<PathBuf, EngineError> {
    let path = dir.join(format!("visitor_{}_{}.png", visit.visitor_id, visit.session_id));
    write_png(dir, &path, &visit.snapshot)?;
    tracing::debug!(path = %path.display(), "visitor snapshot saved");
    Ok(path)
}

/// Write each crop as `<session>_rank<r>_seq<s>.png` under `dir`.
pub fn save_ranked_crops(dir: &Path, crops: &[RankedCrop]) -> Result<Vec<PathBuf>, EngineError> {
    crops
        .iter()
        .map(|c| {
            let path = dir.join(format!("{}_rank{}_seq{}.png", c.session_id, c.rank, c.sequence_index));
            write_png(dir, &path, &c.crop)?;
            Ok(path)
        })
        .collect()
}

fn write_png(dir: &Path, path: &Path, frame: &Frame) -> Result<(), EngineError> {
    let failed = |reason: String| EngineError::Snapshot {
        path: path.to_path_buf(),
        reason,
    };

    std::fs::create_dir_all(dir).map_err(|e| failed(e.to_string()))?;
    let img = image::GrayImage::from_raw(frame.width, frame.height, frame.data.clone())
        .ok_or_else(|| failed(format!("buffer does not match {}x{}", frame.width, frame.height)))?;
    img.save(path).map_err(|e| failed(e.to_string()))
}
