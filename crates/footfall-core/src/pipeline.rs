//! Pipeline coordinator.
//!
//! Drives the frame source, wake-up detector, capture session, quality
//! scorer, embedding provider and identity matcher one frame at a time.
//! Callers own the polling cadence: each [`Pipeline::process_next_frame`]
//! call performs exactly one frame read.

use crate::cooldown::CooldownGate;
use crate::matcher::{IdentityMatcher, Outcome, DEFAULT_SIMILARITY_THRESHOLD};
use crate::provider::{
    best_face, Clock, EmbeddingProvider, FaceDetector, FrameSource, ProviderError, SourceError, SystemClock,
};
use crate::quality::{QualityError, QualityParams, QualityScore, QualityScorer, QualityWeights};
use crate::session::{session_id_at, CaptureConfig, CaptureSession, SessionState, MAX_CAPTURE_SECS};
use crate::store::{StoreError, VisitorStore};
use crate::types::{Frame, VisitorId};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("frame source: {0}")]
    Source(#[from] SourceError),
    #[error("face detector: {0}")]
    Detector(ProviderError),
    #[error("embedding provider: {0}")]
    Embedding(ProviderError),
    #[error("visitor store: {0}")]
    Store(#[from] StoreError),
    #[error("invalid quality configuration: {0}")]
    Quality(#[from] QualityError),
    #[error("invalid pipeline configuration: {0}")]
    Config(String),
}

impl PipelineError {
    /// Failures worth retrying on the next poll.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Source(_) | PipelineError::Detector(_) | PipelineError::Embedding(_) => true,
            PipelineError::Store(e) => e.is_unreachable(),
            PipelineError::Quality(_) | PipelineError::Config(_) => false,
        }
    }
}

/// Longest accepted cooldown (one day).
pub const MAX_COOLDOWN_SECS: f32 = 86_400.0;

/// Everything the coordinator needs to know, loadable from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub capture: CaptureConfig,
    pub weights: QualityWeights,
    pub quality: QualityParams,
    /// Cosine similarity at or above which a visitor is returning.
    pub similarity_threshold: f32,
    /// Suppression window after each completed session.
    pub cooldown_secs: f32,
    /// Trigger detections below this confidence are ignored.
    pub min_detection_confidence: f32,
    /// While idle, run the detector on every n-th frame only.
    pub detect_every_n_frames: u32,
    /// Frames wider than this are downscaled before processing (0 = never).
    pub target_width: u32,
    /// Padding around the selected face when cutting the embedding crop.
    pub crop_padding: f32,
    /// Sessions whose best composite is below this are discarded unembedded.
    pub min_composite_quality: f32,
    /// How many ranked observations to log per session at debug level.
    pub debug_top_n: usize,
    /// Also keep crops of those top observations for [`Pipeline::take_ranked_crops`].
    pub keep_ranked_crops: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            weights: QualityWeights::default(),
            quality: QualityParams::default(),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            cooldown_secs: 10.0,
            min_detection_confidence: 0.70,
            detect_every_n_frames: 5,
            target_width: 1280,
            crop_padding: 0.5,
            min_composite_quality: 0.0,
            debug_top_n: 5,
            keep_ranked_crops: false,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.weights.validate()?;
        self.quality.validate()?;
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(PipelineError::Config(format!(
                "similarity_threshold must lie in [-1, 1], got {}",
                self.similarity_threshold
            )));
        }
        bounded_secs("cooldown_secs", self.cooldown_secs, MAX_COOLDOWN_SECS)?;
        bounded_secs("capture.duration_secs", self.capture.duration_secs, MAX_CAPTURE_SECS)?;
        if !self.crop_padding.is_finite() || self.crop_padding < 0.0 {
            return Err(PipelineError::Config(format!(
                "crop_padding must be non-negative, got {}",
                self.crop_padding
            )));
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::try_from_secs_f32(self.cooldown_secs.clamp(0.0, MAX_COOLDOWN_SECS)).unwrap_or_default()
    }
}

/// A duration in seconds within `[0, max]`.
fn bounded_secs(name: &str, value: f32, max: f32) -> Result<Duration, PipelineError> {
    if !(0.0..=max).contains(&value) {
        return Err(PipelineError::Config(format!("{name} must lie in [0, {max}], got {value}")));
    }
    Duration::try_from_secs_f32(value).map_err(|e| PipelineError::Config(format!("{name}: {e}")))
}

/// Why a session ended without a visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// The embedding provider found no face in the selected crop.
    NoFaceInCrop,
    /// The best observation scored below the configured quality floor.
    LowQuality,
}

/// A completed session that produced a visit.
#[derive(Debug, Clone)]
pub struct VisitOutcome {
    pub session_id: String,
    pub outcome: Outcome,
    pub visitor_id: VisitorId,
    pub similarity: Option<f32>,
    /// Quality of the observation that was embedded.
    pub quality: QualityScore,
    pub sequence_index: u32,
    pub observations: usize,
    /// Face crop the embedding was computed from.
    pub snapshot: Frame,
}

/// A face crop from a finished session and where it ranked.
#[derive(Debug, Clone)]
pub struct RankedCrop {
    pub session_id: String,
    /// 1 is the selected observation.
    pub rank: usize,
    pub sequence_index: u32,
    pub score: QualityScore,
    pub crop: Frame,
}

/// Result of one poll.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Nothing happened: no face, decimated frame, or cooldown.
    NoEvent,
    SessionStarted { session_id: String },
    SessionProgressed { session_id: String, observations: usize },
    Completed(VisitOutcome),
    Discarded { session_id: String, reason: DiscardReason },
    /// The frame source has no more frames.
    EndOfStream,
}

/// Counters since the pipeline was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub frames_read: u64,
    pub read_failures: u64,
    pub sessions_started: u64,
    /// Detections ignored because the cooldown gate was closed.
    pub suppressed: u64,
    pub new_visitors: u64,
    pub returning_visitors: u64,
    pub discarded: u64,
    pub embed_failures: u64,
    pub store_failures: u64,
}

/// The sequential capture → select → embed → match loop.
pub struct Pipeline<S, D, E, V, C = SystemClock> {
    source: S,
    detector: D,
    embedder: E,
    store: V,
    clock: C,
    scorer: QualityScorer,
    matcher: IdentityMatcher,
    gate: CooldownGate,
    config: PipelineConfig,
    session: Option<CaptureSession>,
    exhausted: bool,
    stats: PipelineStats,
    ranked_crops: Vec<RankedCrop>,
}

impl<S, D, E, V> Pipeline<S, D, E, V, SystemClock>
where
    S: FrameSource,
    D: FaceDetector,
    E: EmbeddingProvider,
    V: VisitorStore,
{
    pub fn new(source: S, detector: D, embedder: E, store: V, config: PipelineConfig) -> Result<Self, PipelineError> {
        Self::with_clock(source, detector, embedder, store, config, SystemClock)
    }
}

impl<S, D, E, V, C> Pipeline<S, D, E, V, C>
where
    S: FrameSource,
    D: FaceDetector,
    E: EmbeddingProvider,
    V: VisitorStore,
    C: Clock,
{
    pub fn with_clock(
        source: S,
        detector: D,
        embedder: E,
        store: V,
        config: PipelineConfig,
        clock: C,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let scorer = QualityScorer::new(config.weights, config.quality.clone())?;
        Ok(Self {
            source,
            detector,
            embedder,
            store,
            clock,
            scorer,
            matcher: IdentityMatcher::new(config.similarity_threshold),
            gate: CooldownGate::new(config.cooldown()),
            config,
            session: None,
            exhausted: false,
            stats: PipelineStats::default(),
            ranked_crops: Vec::new(),
        })
    }

    /// Replace the quality scorer, e.g. to plug in another pose estimator.
    pub fn with_scorer(mut self, scorer: QualityScorer) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn gate(&self) -> &CooldownGate {
        &self.gate
    }

    pub fn store(&self) -> &V {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut V {
        &mut self.store
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Crops of the last finished session's top observations, best first.
    /// Empty unless `keep_ranked_crops` is set.
    pub fn take_ranked_crops(&mut self) -> Vec<RankedCrop> {
        std::mem::take(&mut self.ranked_crops)
    }

    /// Current position in the session state machine.
    pub fn state(&self) -> SessionState {
        match &self.session {
            Some(s) => s.state(),
            None if !self.gate.is_open(self.clock.now()) => SessionState::Cooldown,
            None => SessionState::Idle,
        }
    }

    /// Advance the pipeline by one frame read.
    pub fn process_next_frame(&mut self) -> Result<PipelineEvent, PipelineError> {
        if self.exhausted {
            return Ok(PipelineEvent::EndOfStream);
        }

        let read = self.source.next_frame().and_then(|frame| match frame {
            Some(f) if !f.is_well_formed() => Err(SourceError::ReadFailed(format!(
                "frame buffer holds {} bytes, expected {}x{}",
                f.data.len(),
                f.width,
                f.height
            ))),
            other => Ok(other),
        });
        let now = self.clock.now();

        match self.session.take() {
            Some(session) => self.continue_session(session, read, now),
            None => self.poll_idle(read, now),
        }
    }

    fn poll_idle(
        &mut self,
        read: Result<Option<Frame>, SourceError>,
        now: Instant,
    ) -> Result<PipelineEvent, PipelineError> {
        let frame = match read {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                self.exhausted = true;
                return Ok(PipelineEvent::EndOfStream);
            }
            Err(e) => {
                self.stats.read_failures += 1;
                return Err(e.into());
            }
        };
        self.stats.frames_read += 1;

        let every = self.config.detect_every_n_frames.max(1) as u64;
        if self.stats.frames_read % every != 0 {
            return Ok(PipelineEvent::NoEvent);
        }

        let (frame, _) = frame.fit_width(self.config.target_width);
        let faces = self.detector.detect(&frame).map_err(PipelineError::Detector)?;
        let Some(face) = best_face(&faces, self.config.min_detection_confidence) else {
            return Ok(PipelineEvent::NoEvent);
        };
        let face = face.clamped(frame.width, frame.height);

        if !self.gate.is_open(now) {
            self.stats.suppressed += 1;
            tracing::trace!(
                remaining_ms = self.gate.remaining(now).as_millis() as u64,
                "detection suppressed by cooldown"
            );
            return Ok(PipelineEvent::NoEvent);
        }

        let session_id = session_id_at(chrono::Utc::now(), self.stats.sessions_started + 1);
        let session = match CaptureSession::start(session_id, frame, face, now, &self.config.capture) {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(error = %e, "trigger detection rejected");
                return Ok(PipelineEvent::NoEvent);
            }
        };
        self.stats.sessions_started += 1;

        if session.is_complete(now) {
            return self.finish_session(session, now);
        }
        let session_id = session.id().to_string();
        self.session = Some(session);
        Ok(PipelineEvent::SessionStarted { session_id })
    }

    fn continue_session(
        &mut self,
        mut session: CaptureSession,
        read: Result<Option<Frame>, SourceError>,
        now: Instant,
    ) -> Result<PipelineEvent, PipelineError> {
        match read {
            Ok(Some(frame)) => {
                self.stats.frames_read += 1;
                session.record_read_ok();
                if session.wants_sample(now) {
                    self.sample(&mut session, frame, now);
                }
            }
            Ok(None) => {
                tracing::info!(session_id = session.id(), "frame source ended during capture");
                self.exhausted = true;
                return self.finish_session(session, now);
            }
            Err(e) => {
                self.stats.read_failures += 1;
                session.record_read_failure();
                tracing::warn!(session_id = session.id(), error = %e, "frame read failed during capture");
            }
        }

        if session.is_complete(now) {
            return self.finish_session(session, now);
        }

        let event = PipelineEvent::SessionProgressed {
            session_id: session.id().to_string(),
            observations: session.observations().len(),
        };
        self.session = Some(session);
        Ok(event)
    }

    /// Detect on a sampled frame and append the result if it holds a face.
    fn sample(&mut self, session: &mut CaptureSession, frame: Frame, now: Instant) {
        let (frame, _) = frame.fit_width(self.config.target_width);
        let faces = match self.detector.detect(&frame) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::debug!(session_id = session.id(), error = %e, "detector failed on sample");
                session.skip_sample(now);
                return;
            }
        };
        let Some(face) = best_face(&faces, self.config.min_detection_confidence) else {
            session.skip_sample(now);
            return;
        };
        let face = face.clamped(frame.width, frame.height);

        match session.observe(frame, face, now) {
            Ok(index) => tracing::trace!(session_id = session.id(), index, "observation added"),
            Err(e) => tracing::debug!(session_id = session.id(), error = %e, "observation dropped"),
        }
    }

    /// SELECTING → EXTRACTING → MATCHED/discard → COOLDOWN.
    fn finish_session(&mut self, mut session: CaptureSession, now: Instant) -> Result<PipelineEvent, PipelineError> {
        let session_id = session.id().to_string();
        let observations = session.observations().len();
        let selection = session.select(&self.scorer);

        for (rank, (seq, score)) in selection.ranking.iter().take(self.config.debug_top_n).enumerate() {
            tracing::debug!(
                session_id = %session_id,
                rank = rank + 1,
                sequence_index = seq,
                composite = score.composite,
                sharpness = score.sharpness,
                frontality = score.frontality,
                size = score.size,
                brightness = score.brightness,
                contrast = score.contrast,
                yaw = score.yaw,
                pitch = score.pitch,
                "ranked observation"
            );
        }

        if self.config.keep_ranked_crops {
            self.ranked_crops = selection
                .ranking
                .iter()
                .take(self.config.debug_top_n)
                .enumerate()
                .filter_map(|(rank, (seq, score))| {
                    let obs = session.observations().iter().find(|o| o.sequence_index == *seq)?;
                    Some(RankedCrop {
                        session_id: session_id.clone(),
                        rank: rank + 1,
                        sequence_index: *seq,
                        score: *score,
                        crop: obs.frame.crop(&obs.face, self.config.crop_padding),
                    })
                })
                .collect();
        }

        if selection.score.composite < self.config.min_composite_quality {
            tracing::info!(
                session_id = %session_id,
                composite = selection.score.composite,
                floor = self.config.min_composite_quality,
                "best observation below quality floor, session discarded"
            );
            return Ok(self.discard(session, session_id, DiscardReason::LowQuality, now));
        }

        let Some(selected) = session.take_observation(selection.index) else {
            return Err(PipelineError::Config("selected observation missing".into()));
        };
        let crop = selected.frame.crop(&selected.face, self.config.crop_padding);

        let embedding = match self.embedder.embed(&crop) {
            Ok(Some(embedding)) => embedding,
            Ok(None) => {
                tracing::info!(session_id = %session_id, "no face in selected crop, session discarded");
                return Ok(self.discard(session, session_id, DiscardReason::NoFaceInCrop, now));
            }
            Err(e) => {
                self.stats.embed_failures += 1;
                tracing::warn!(session_id = %session_id, error = %e, "embedding failed, session dropped");
                return Err(PipelineError::Embedding(e));
            }
        };
        session.mark_matched();

        let identification = match self
            .matcher
            .identify(&embedding, &mut self.store, &session_id, chrono::Utc::now())
        {
            Ok(id) => id,
            Err(e) => {
                self.stats.store_failures += 1;
                tracing::error!(session_id = %session_id, error = %e, "visitor store failed, session dropped");
                return Err(PipelineError::Store(e));
            }
        };

        match identification.outcome {
            Outcome::New => self.stats.new_visitors += 1,
            Outcome::Returning => self.stats.returning_visitors += 1,
        }
        session.mark_cooldown();
        self.gate.arm(now);

        tracing::info!(
            session_id = %session_id,
            outcome = %identification.outcome,
            visitor_id = identification.visitor_id,
            similarity = identification.similarity,
            composite = selection.score.composite,
            observations,
            "session complete"
        );

        Ok(PipelineEvent::Completed(VisitOutcome {
            session_id,
            outcome: identification.outcome,
            visitor_id: identification.visitor_id,
            similarity: identification.similarity,
            quality: selection.score,
            sequence_index: selection.sequence_index,
            observations,
            snapshot: crop,
        }))
    }

    fn discard(
        &mut self,
        mut session: CaptureSession,
        session_id: String,
        reason: DiscardReason,
        now: Instant,
    ) -> PipelineEvent {
        session.mark_cooldown();
        self.stats.discarded += 1;
        self.gate.arm(now);
        PipelineEvent::Discarded { session_id, reason }
    }
}
