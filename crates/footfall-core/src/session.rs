//! Capture session state machine.
//!
//! A session starts on a qualifying detection, samples the live stream for
//! a fixed window, ranks what it collected and hands the single best
//! observation on for embedding. Exactly one session is active at a time.
//!
//! ```text
//! Idle -> Detected -> Capturing -> Selecting -> Extracting -> Matched -> Cooldown -> Idle
//!                                                   \---- no face in crop ----/
//! ```

use crate::quality::{QualityScore, QualityScorer};
use crate::types::{BoundingBox, Frame};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Detected,
    Capturing,
    Selecting,
    Extracting,
    Matched,
    Cooldown,
}

impl SessionState {
    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Detected)
                | (Detected, Capturing)
                | (Capturing, Capturing)
                | (Capturing, Selecting)
                | (Selecting, Extracting)
                | (Selecting, Cooldown)
                | (Extracting, Matched)
                | (Extracting, Cooldown)
                | (Matched, Cooldown)
                | (Cooldown, Idle)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Detected => "detected",
            SessionState::Capturing => "capturing",
            SessionState::Selecting => "selecting",
            SessionState::Extracting => "extracting",
            SessionState::Matched => "matched",
            SessionState::Cooldown => "cooldown",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ObservationError {
    #[error("face box has no area: ({x1}, {y1})-({x2}, {y2})")]
    EmptyBox { x1: f32, y1: f32, x2: f32, y2: f32 },
    #[error("face box ({x1}, {y1})-({x2}, {y2}) exceeds {width}x{height} frame")]
    OutOfFrame {
        x1: f32,
        y1: f32,
        x2: f32,
        y2: f32,
        width: u32,
        height: u32,
    },
    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    BadBuffer { expected: usize, actual: usize },
    #[error("capture time does not advance past the previous observation")]
    OutOfOrder,
}

/// One candidate face within a session.
#[derive(Debug, Clone)]
pub struct Observation {
    pub frame: Frame,
    pub face: BoundingBox,
    pub captured_at: Instant,
    /// 1-based position in the session; 1 is the triggering frame.
    pub sequence_index: u32,
}

impl Observation {
    /// Validate the box against the frame and build the observation.
    pub fn new(
        frame: Frame,
        face: BoundingBox,
        captured_at: Instant,
        sequence_index: u32,
    ) -> Result<Self, ObservationError> {
        let expected = frame.width as usize * frame.height as usize;
        if frame.data.len() != expected {
            return Err(ObservationError::BadBuffer { expected, actual: frame.data.len() });
        }

        let (x1, y1, x2, y2) = (face.x, face.y, face.x2(), face.y2());
        let finite = [x1, y1, x2, y2].iter().all(|v| v.is_finite());
        if !finite || x2 <= x1 || y2 <= y1 {
            return Err(ObservationError::EmptyBox { x1, y1, x2, y2 });
        }
        if x1 < 0.0 || y1 < 0.0 || x2 > frame.width as f32 || y2 > frame.height as f32 {
            return Err(ObservationError::OutOfFrame {
                x1,
                y1,
                x2,
                y2,
                width: frame.width,
                height: frame.height,
            });
        }

        Ok(Self { frame, face, captured_at, sequence_index })
    }
}

/// Longest accepted capture window.
pub const MAX_CAPTURE_SECS: f32 = 600.0;

/// Capture window parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Wall-clock length of the capture window.
    pub duration_secs: f32,
    /// Minimum spacing between sampled frames; frames in between are dropped.
    pub sample_interval_ms: u64,
    /// Stop early once this many observations are held.
    pub max_observations: usize,
    /// Stop early after this many consecutive frame read failures.
    pub max_read_failures: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            duration_secs: 5.0,
            sample_interval_ms: 300,
            max_observations: 20,
            max_read_failures: 5,
        }
    }
}

impl CaptureConfig {
    pub fn duration(&self) -> Duration {
        Duration::try_from_secs_f32(self.duration_secs.clamp(0.0, MAX_CAPTURE_SECS)).unwrap_or_default()
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

/// Session id derived from the session's start time.
pub fn session_id_at(started: DateTime<Utc>, serial: u64) -> String {
    format!("{}_{serial:04}", started.format("%Y%m%d_%H%M%S_%3f"))
}

/// Index of the highest composite; ties go to the earliest entry.
pub fn select_best<I>(composites: I) -> Option<usize>
where
    I: IntoIterator<Item = f32>,
{
    let mut best: Option<(usize, f32)> = None;
    for (i, c) in composites.into_iter().enumerate() {
        if best.map_or(true, |(_, b)| c > b) {
            best = Some((i, c));
        }
    }
    best.map(|(i, _)| i)
}

/// The ranked outcome of SELECTING.
#[derive(Debug, Clone)]
pub struct Selection {
    /// Position of the winner in the session's observation list.
    pub index: usize,
    pub sequence_index: u32,
    pub score: QualityScore,
    /// `(sequence_index, score)` for every observation, best first.
    pub ranking: Vec<(u32, QualityScore)>,
}

/// One capture session, from trigger to selection.
#[derive(Debug)]
pub struct CaptureSession {
    id: String,
    state: SessionState,
    observations: Vec<Observation>,
    started_at: Instant,
    ends_at: Instant,
    last_sample_at: Instant,
    sample_interval: Duration,
    max_observations: usize,
    max_read_failures: u32,
    consecutive_read_failures: u32,
    dropped: u32,
}

impl CaptureSession {
    /// Open a session on a triggering detection.
    ///
    /// The trigger frame becomes observation 1 before the session leaves
    /// DETECTED; a trigger with a malformed box never opens a session.
    pub fn start(
        id: String,
        trigger: Frame,
        face: BoundingBox,
        now: Instant,
        config: &CaptureConfig,
    ) -> Result<Self, ObservationError> {
        let first = Observation::new(trigger, face, now, 1)?;

        let mut session = Self {
            id,
            state: SessionState::Idle,
            observations: Vec::with_capacity(config.max_observations.max(1)),
            started_at: now,
            ends_at: now + config.duration(),
            last_sample_at: now,
            sample_interval: config.sample_interval(),
            max_observations: config.max_observations.max(1),
            max_read_failures: config.max_read_failures,
            consecutive_read_failures: 0,
            dropped: 0,
        };
        session.advance(SessionState::Detected);
        session.observations.push(first);
        session.advance(SessionState::Capturing);

        tracing::info!(session_id = %session.id, "capture session started");
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn ends_at(&self) -> Instant {
        self.ends_at
    }

    /// Observations rejected at append time.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal session transition {} -> {}",
            self.state,
            next
        );
        self.state = next;
    }

    /// Whether a frame read at `now` should be turned into an observation.
    pub fn wants_sample(&self, now: Instant) -> bool {
        self.state == SessionState::Capturing
            && now < self.ends_at
            && now.saturating_duration_since(self.last_sample_at) >= self.sample_interval
    }

    /// Append a sampled frame. Malformed observations are counted and
    /// rejected; the session carries on.
    pub fn observe(&mut self, frame: Frame, face: BoundingBox, now: Instant) -> Result<u32, ObservationError> {
        self.last_sample_at = now;
        let result = match self.observations.last() {
            Some(prev) if now <= prev.captured_at => Err(ObservationError::OutOfOrder),
            _ => Observation::new(frame, face, now, self.observations.len() as u32 + 1),
        };

        match result {
            Ok(obs) => {
                let index = obs.sequence_index;
                self.observations.push(obs);
                self.advance(SessionState::Capturing);
                Ok(index)
            }
            Err(e) => {
                self.dropped += 1;
                Err(e)
            }
        }
    }

    /// Mark that a sample slot passed without a usable face.
    pub fn skip_sample(&mut self, now: Instant) {
        self.last_sample_at = now;
    }

    pub fn record_read_ok(&mut self) {
        self.consecutive_read_failures = 0;
    }

    pub fn record_read_failure(&mut self) {
        self.consecutive_read_failures += 1;
    }

    /// Capture ends on timeout, a full buffer, or a stalled source.
    pub fn is_complete(&self, now: Instant) -> bool {
        now >= self.ends_at
            || self.observations.len() >= self.max_observations
            || (self.max_read_failures > 0 && self.consecutive_read_failures >= self.max_read_failures)
    }

    /// CAPTURING -> SELECTING -> EXTRACTING: score everything and pick the best.
    pub fn select(&mut self, scorer: &QualityScorer) -> Selection {
        self.advance(SessionState::Selecting);

        let scores: Vec<QualityScore> = self.observations.iter().map(|o| scorer.score(o)).collect();
        // The trigger observation guarantees at least one entry.
        let index = select_best(scores.iter().map(|s| s.composite)).unwrap_or(0);

        let mut ranking: Vec<(u32, QualityScore)> = self
            .observations
            .iter()
            .zip(scores.iter())
            .map(|(o, s)| (o.sequence_index, *s))
            .collect();
        ranking.sort_by(|a, b| {
            b.1.composite
                .partial_cmp(&a.1.composite)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        self.advance(SessionState::Extracting);
        Selection {
            index,
            sequence_index: self.observations[index].sequence_index,
            score: scores[index],
            ranking,
        }
    }

    /// Embedding obtained; the matcher is about to run.
    pub fn mark_matched(&mut self) {
        self.advance(SessionState::Matched);
    }

    /// Session is over; the pipeline arms the cooldown gate.
    pub fn mark_cooldown(&mut self) {
        self.advance(SessionState::Cooldown);
    }

    /// Keep only the observation at `index`, releasing every other frame.
    pub fn take_observation(&mut self, index: usize) -> Option<Observation> {
        if index >= self.observations.len() {
            return None;
        }
        let chosen = self.observations.swap_remove(index);
        self.observations.clear();
        Some(chosen)
    }
}
