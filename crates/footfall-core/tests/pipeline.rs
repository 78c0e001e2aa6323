//! End-to-end pipeline behaviour with scripted collaborators.

use chrono::{DateTime, Utc};
use footfall_core::pipeline::DiscardReason;
use footfall_core::{
    BoundingBox, Clock, Embedding, EmbeddingProvider, FaceDetector, Frame, FrameSource, MemoryStore, Outcome,
    Pipeline, PipelineConfig, PipelineError, PipelineEvent, ProviderError, SessionState, SourceError, StoreError,
    VisitorId, VisitorStore,
};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

const W: u32 = 200;
const H: u32 = 200;

fn frame(seq: u32) -> Frame {
    Frame::new(vec![127u8; (W * H) as usize], W, H).with_sequence(seq)
}

/// 80×80 face in the middle of the frame with its eyes shifted right by
/// `offset` of the box width. Larger offsets read as more yaw.
fn face(offset: f32) -> BoundingBox {
    let mut b = BoundingBox::from_corners(60.0, 60.0, 140.0, 140.0, 0.95);
    let cx = 100.0 + offset * 80.0;
    let ey = 60.0 + 0.32 * 80.0;
    b.landmarks = Some([
        (cx - 8.0, ey),
        (cx + 8.0, ey),
        (cx, ey + 15.0),
        (cx - 6.0, ey + 30.0),
        (cx + 6.0, ey + 30.0),
    ]);
    b
}

#[derive(Clone)]
struct ManualClock(Rc<Cell<Instant>>);

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.0.get()
    }
}

struct Script(VecDeque<Result<Frame, SourceError>>);

impl FrameSource for Script {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        self.0.pop_front().transpose()
    }
}

/// Returns the faces registered for each frame sequence number.
struct Faces {
    by_sequence: HashMap<u32, Vec<BoundingBox>>,
    calls: Rc<Cell<usize>>,
}

impl FaceDetector for Faces {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, ProviderError> {
        self.calls.set(self.calls.get() + 1);
        Ok(self.by_sequence.get(&frame.sequence).cloned().unwrap_or_default())
    }
}

struct Embedder {
    replies: VecDeque<Result<Option<Embedding>, ProviderError>>,
    crops: Rc<RefCell<Vec<Frame>>>,
}

impl EmbeddingProvider for Embedder {
    fn embed(&mut self, face_crop: &Frame) -> Result<Option<Embedding>, ProviderError> {
        self.crops.borrow_mut().push(face_crop.clone());
        self.replies
            .pop_front()
            .unwrap_or_else(|| Ok(Some(Embedding::new(vec![1.0, 0.0]))))
    }
}

struct DownStore;

impl VisitorStore for DownStore {
    fn scan_all(&mut self) -> Result<Vec<(VisitorId, Embedding)>, StoreError> {
        Err(StoreError::Unreachable("database is locked".into()))
    }
    fn insert(&mut self, _: &Embedding, _: &str, _: DateTime<Utc>) -> Result<VisitorId, StoreError> {
        unreachable!()
    }
    fn update_on_match(&mut self, _: VisitorId, _: &str, _: f32, _: DateTime<Utc>) -> Result<(), StoreError> {
        unreachable!()
    }
}

struct Rig<V: VisitorStore> {
    pipeline: Pipeline<Script, Faces, Embedder, V, ManualClock>,
    clock: Rc<Cell<Instant>>,
    t0: Instant,
    detector_calls: Rc<Cell<usize>>,
    crops: Rc<RefCell<Vec<Frame>>>,
}

impl<V: VisitorStore> Rig<V> {
    fn at(&mut self, ms: u64) -> Result<PipelineEvent, PipelineError> {
        self.clock.set(self.t0 + Duration::from_millis(ms));
        self.pipeline.process_next_frame()
    }
}

struct Setup {
    reads: Vec<Result<Frame, SourceError>>,
    faces: Vec<(u32, BoundingBox)>,
    replies: Vec<Result<Option<Embedding>, ProviderError>>,
    config: PipelineConfig,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            reads: Vec::new(),
            faces: Vec::new(),
            replies: Vec::new(),
            config: PipelineConfig { detect_every_n_frames: 1, ..PipelineConfig::default() },
        }
    }
}

fn rig<V: VisitorStore>(setup: Setup, store: V) -> Rig<V> {
    let t0 = Instant::now();
    let clock = Rc::new(Cell::new(t0));
    let detector_calls = Rc::new(Cell::new(0));
    let crops = Rc::new(RefCell::new(Vec::new()));

    let mut by_sequence: HashMap<u32, Vec<BoundingBox>> = HashMap::new();
    for (seq, b) in setup.faces {
        by_sequence.entry(seq).or_default().push(b);
    }

    let pipeline = Pipeline::with_clock(
        Script(setup.reads.into()),
        Faces { by_sequence, calls: detector_calls.clone() },
        Embedder { replies: setup.replies.into(), crops: crops.clone() },
        store,
        setup.config,
        ManualClock(clock.clone()),
    )
    .unwrap();

    Rig { pipeline, clock, t0, detector_calls, crops }
}

fn frames(seqs: std::ops::RangeInclusive<u32>) -> Vec<Result<Frame, SourceError>> {
    seqs.map(|s| Ok(frame(s))).collect()
}

fn completed(event: PipelineEvent) -> footfall_core::VisitOutcome {
    match event {
        PipelineEvent::Completed(outcome) => outcome,
        other => panic!("expected Completed, got {other:?}"),
    }
}

#[test]
fn test_selects_highest_scoring_observation_and_enrolls() {
    // Frontality order matches composites [0.9, 0.3, 0.7, 0.95, 0.2].
    let offsets = [0.05, 0.30, 0.15, 0.0, 0.35];
    let mut faces: Vec<(u32, BoundingBox)> = offsets.iter().enumerate().map(|(i, &o)| (i as u32 + 1, face(o))).collect();
    faces.push((6, face(0.0)));

    let mut r = rig(Setup { reads: frames(1..=6), faces, ..Setup::default() }, MemoryStore::new());

    assert!(matches!(r.at(0).unwrap(), PipelineEvent::SessionStarted { .. }));
    assert_eq!(r.pipeline.state(), SessionState::Capturing);
    for (i, ms) in [300, 600, 900, 1200].into_iter().enumerate() {
        match r.at(ms).unwrap() {
            PipelineEvent::SessionProgressed { observations, .. } => assert_eq!(observations, i + 2),
            other => panic!("expected progress, got {other:?}"),
        }
    }

    let visit = completed(r.at(5000).unwrap());
    assert_eq!(visit.sequence_index, 4);
    assert_eq!(visit.observations, 5);
    assert_eq!(visit.outcome, Outcome::New);
    assert_eq!(visit.similarity, None);

    // Only the winner is embedded, cut with half a face of padding.
    let crops = r.crops.borrow();
    assert_eq!(crops.len(), 1);
    assert_eq!((crops[0].width, crops[0].height), (160, 160));
    assert_eq!(visit.snapshot, crops[0]);

    let store = r.pipeline.store();
    assert_eq!(store.visitors().len(), 1);
    assert_eq!(store.visitor(visit.visitor_id).unwrap().visit_count, 1);
    assert_eq!(store.visits().len(), 1);
    assert_eq!(store.visits()[0].similarity, None);
    assert_eq!(store.visits()[0].session_id, visit.session_id);
    assert_eq!(r.pipeline.stats().new_visitors, 1);
}

#[test]
fn test_returning_visitor_count_increments() {
    let mut store = MemoryStore::new();
    let known = store.seed(Embedding::new(vec![0.6, 0.8]), 3, Utc::now() - chrono::Duration::days(1));

    let setup = Setup {
        reads: frames(1..=2),
        faces: vec![(1, face(0.0))],
        ..Setup::default()
    };
    let mut r = rig(setup, store);
    r.at(0).unwrap();
    let visit = completed(r.at(5000).unwrap());

    assert_eq!(visit.outcome, Outcome::Returning);
    assert_eq!(visit.visitor_id, known);
    assert!((visit.similarity.unwrap() - 0.60).abs() < 1e-5);

    let store = r.pipeline.store();
    assert_eq!(store.visitor(known).unwrap().visit_count, 4);
    assert_eq!(store.visitors().len(), 1);
    let last = store.visits().last().unwrap();
    assert!((last.similarity.unwrap() - 0.60).abs() < 1e-5);
    assert_eq!(r.pipeline.stats().returning_visitors, 1);
}

#[test]
fn test_read_failures_end_capture_with_trigger() {
    let mut reads = frames(1..=1);
    for _ in 0..5 {
        reads.push(Err(SourceError::ReadFailed("VIDIOC_DQBUF: EIO".into())));
    }
    let mut r = rig(Setup { reads, faces: vec![(1, face(0.1))], ..Setup::default() }, MemoryStore::new());

    r.at(0).unwrap();
    for ms in [100, 200, 300, 400] {
        assert!(matches!(r.at(ms).unwrap(), PipelineEvent::SessionProgressed { observations: 1, .. }));
    }
    let visit = completed(r.at(500).unwrap());
    assert_eq!(visit.sequence_index, 1);
    assert_eq!(visit.observations, 1);
    assert_eq!(r.pipeline.stats().read_failures, 5);
}

#[test]
fn test_cooldown_suppresses_then_reopens() {
    let setup = Setup {
        reads: frames(1..=4),
        faces: vec![(1, face(0.0)), (3, face(0.0)), (4, face(0.0))],
        ..Setup::default()
    };
    let mut r = rig(setup, MemoryStore::new());

    r.at(0).unwrap();
    completed(r.at(5000).unwrap());
    assert_eq!(r.pipeline.state(), SessionState::Cooldown);

    assert!(matches!(r.at(6000).unwrap(), PipelineEvent::NoEvent));
    assert_eq!(r.pipeline.stats().suppressed, 1);

    // Gate reopens exactly at completion + cooldown.
    assert!(matches!(r.at(15_000).unwrap(), PipelineEvent::SessionStarted { .. }));
    assert_eq!(r.pipeline.stats().sessions_started, 2);
}

#[test]
fn test_no_face_in_crop_discards_and_arms_gate() {
    let setup = Setup {
        reads: frames(1..=3),
        faces: vec![(1, face(0.0)), (3, face(0.0))],
        replies: vec![Ok(None)],
        ..Setup::default()
    };
    let mut r = rig(setup, MemoryStore::new());

    r.at(0).unwrap();
    match r.at(5000).unwrap() {
        PipelineEvent::Discarded { reason, .. } => assert_eq!(reason, DiscardReason::NoFaceInCrop),
        other => panic!("expected discard, got {other:?}"),
    }
    assert!(r.pipeline.store().visitors().is_empty());
    assert!(r.pipeline.store().visits().is_empty());
    assert_eq!(r.pipeline.stats().discarded, 1);

    assert!(matches!(r.at(5100).unwrap(), PipelineEvent::NoEvent));
    assert_eq!(r.pipeline.stats().suppressed, 1);
}

#[test]
fn test_unreachable_store_is_reported_not_enrolled() {
    let setup = Setup {
        reads: frames(1..=3),
        faces: vec![(1, face(0.0)), (3, face(0.0))],
        ..Setup::default()
    };
    let mut r = rig(setup, DownStore);

    r.at(0).unwrap();
    match r.at(5000) {
        Err(PipelineError::Store(e)) => assert!(e.is_unreachable()),
        other => panic!("expected store error, got {other:?}"),
    }
    assert_eq!(r.pipeline.stats().store_failures, 1);
    assert_eq!(r.pipeline.stats().new_visitors, 0);

    // Gate was not armed, so the next detection starts a fresh session.
    assert!(matches!(r.at(5100).unwrap(), PipelineEvent::SessionStarted { .. }));
}

#[test]
fn test_embedding_failure_propagates() {
    let setup = Setup {
        reads: frames(1..=2),
        faces: vec![(1, face(0.0))],
        replies: vec![Err(ProviderError::Timeout)],
        ..Setup::default()
    };
    let mut r = rig(setup, MemoryStore::new());
    r.at(0).unwrap();
    let err = r.at(5000).unwrap_err();
    assert!(matches!(err, PipelineError::Embedding(ProviderError::Timeout)));
    assert!(err.is_transient());
    assert_eq!(r.pipeline.stats().embed_failures, 1);
    assert!(r.pipeline.store().visitors().is_empty());
}

#[test]
fn test_idle_detection_is_decimated() {
    let setup = Setup {
        reads: frames(1..=3),
        faces: vec![(1, face(0.0)), (2, face(0.0)), (3, face(0.0))],
        config: PipelineConfig { detect_every_n_frames: 3, ..PipelineConfig::default() },
        ..Setup::default()
    };
    let mut r = rig(setup, MemoryStore::new());

    assert!(matches!(r.at(0).unwrap(), PipelineEvent::NoEvent));
    assert!(matches!(r.at(33).unwrap(), PipelineEvent::NoEvent));
    assert!(matches!(r.at(66).unwrap(), PipelineEvent::SessionStarted { .. }));
    assert_eq!(r.detector_calls.get(), 1);
}

#[test]
fn test_low_confidence_trigger_ignored() {
    let mut weak = face(0.0);
    weak.confidence = 0.5;
    let setup = Setup { reads: frames(1..=1), faces: vec![(1, weak)], ..Setup::default() };
    let mut r = rig(setup, MemoryStore::new());
    assert!(matches!(r.at(0).unwrap(), PipelineEvent::NoEvent));
    assert_eq!(r.pipeline.state(), SessionState::Idle);
}

#[test]
fn test_end_of_stream_finalizes_open_session() {
    let setup = Setup { reads: frames(1..=1), faces: vec![(1, face(0.0))], ..Setup::default() };
    let mut r = rig(setup, MemoryStore::new());

    r.at(0).unwrap();
    let visit = completed(r.at(300).unwrap());
    assert_eq!(visit.observations, 1);
    assert!(matches!(r.at(400).unwrap(), PipelineEvent::EndOfStream));
}

#[test]
fn test_quality_floor_discards_without_embedding() {
    let setup = Setup {
        reads: frames(1..=2),
        faces: vec![(1, face(0.3))],
        config: PipelineConfig {
            detect_every_n_frames: 1,
            min_composite_quality: 0.99,
            ..PipelineConfig::default()
        },
        ..Setup::default()
    };
    let mut r = rig(setup, MemoryStore::new());

    r.at(0).unwrap();
    match r.at(5000).unwrap() {
        PipelineEvent::Discarded { reason, .. } => assert_eq!(reason, DiscardReason::LowQuality),
        other => panic!("expected discard, got {other:?}"),
    }
    assert!(r.crops.borrow().is_empty());
}

#[test]
fn test_invalid_weights_rejected() {
    let mut config = PipelineConfig::default();
    config.weights.sharpness = 0.9;
    let result = Pipeline::with_clock(
        Script(VecDeque::new()),
        Faces { by_sequence: HashMap::new(), calls: Rc::new(Cell::new(0)) },
        Embedder { replies: VecDeque::new(), crops: Rc::new(RefCell::new(Vec::new())) },
        MemoryStore::new(),
        config,
        ManualClock(Rc::new(Cell::new(Instant::now()))),
    );
    assert!(matches!(result, Err(PipelineError::Quality(_))));
}

#[test]
fn test_partial_json_config_keeps_defaults() {
    let config: PipelineConfig =
        serde_json::from_str(r#"{"cooldown_secs": 3.0, "capture": {"max_observations": 8}}"#).unwrap();
    assert!((config.cooldown_secs - 3.0).abs() < 1e-6);
    assert_eq!(config.capture.max_observations, 8);
    assert_eq!(config.capture.sample_interval_ms, 300);
    assert!(config.validate().is_ok());

    assert_eq!(serde_json::to_string(&DiscardReason::NoFaceInCrop).unwrap(), "\"no_face_in_crop\"");
}

#[test]
fn test_short_buffer_frame_is_a_read_failure() {
    let short = || Frame::new(vec![0u8; 10], 64, 64);
    let setup = Setup {
        reads: vec![Ok(short().with_sequence(1))],
        faces: vec![(1, face(0.0))],
        config: PipelineConfig { detect_every_n_frames: 1, target_width: 32, ..PipelineConfig::default() },
        ..Setup::default()
    };
    let mut r = rig(setup, MemoryStore::new());
    assert!(matches!(r.at(0), Err(PipelineError::Source(SourceError::ReadFailed(_)))));
    assert_eq!(r.detector_calls.get(), 0);
    assert_eq!(r.pipeline.stats().read_failures, 1);

    // Inside a session the bad frame is absorbed like any other failed read.
    let mut reads = frames(1..=1);
    reads.push(Ok(short().with_sequence(2)));
    let mut r = rig(Setup { reads, faces: vec![(1, face(0.0))], ..Setup::default() }, MemoryStore::new());
    assert!(matches!(r.at(0).unwrap(), PipelineEvent::SessionStarted { .. }));
    assert!(matches!(r.at(400).unwrap(), PipelineEvent::SessionProgressed { observations: 1, .. }));
    assert_eq!(r.pipeline.stats().read_failures, 1);
}

#[test]
fn test_out_of_range_durations_rejected() {
    let build = |config: PipelineConfig| {
        Pipeline::with_clock(
            Script(VecDeque::new()),
            Faces { by_sequence: HashMap::new(), calls: Rc::new(Cell::new(0)) },
            Embedder { replies: VecDeque::new(), crops: Rc::new(RefCell::new(Vec::new())) },
            MemoryStore::new(),
            config,
            ManualClock(Rc::new(Cell::new(Instant::now()))),
        )
    };

    let huge_cooldown = PipelineConfig { cooldown_secs: 1e20, ..PipelineConfig::default() };
    assert!(matches!(huge_cooldown.validate(), Err(PipelineError::Config(_))));
    assert!(matches!(build(huge_cooldown), Err(PipelineError::Config(_))));

    let mut huge_capture = PipelineConfig::default();
    huge_capture.capture.duration_secs = 1e19;
    assert!(matches!(build(huge_capture), Err(PipelineError::Config(_))));

    let mut nan_capture = PipelineConfig::default();
    nan_capture.capture.duration_secs = f32::NAN;
    assert!(matches!(build(nan_capture), Err(PipelineError::Config(_))));

    let day = PipelineConfig { cooldown_secs: 86_400.0, ..PipelineConfig::default() };
    assert!(build(day).is_ok());
}

#[test]
fn test_ranked_crops_kept_for_top_observations() {
    let offsets = [0.05, 0.30, 0.15, 0.0, 0.35];
    let mut faces: Vec<(u32, BoundingBox)> = offsets.iter().enumerate().map(|(i, &o)| (i as u32 + 1, face(o))).collect();
    faces.push((6, face(0.0)));
    let config = PipelineConfig {
        detect_every_n_frames: 1,
        debug_top_n: 3,
        keep_ranked_crops: true,
        ..PipelineConfig::default()
    };
    let mut r = rig(Setup { reads: frames(1..=6), faces, config, ..Setup::default() }, MemoryStore::new());

    for ms in [0, 300, 600, 900, 1200] {
        r.at(ms).unwrap();
        assert!(r.pipeline.take_ranked_crops().is_empty());
    }
    let visit = completed(r.at(5000).unwrap());

    let ranked = r.pipeline.take_ranked_crops();
    let order: Vec<u32> = ranked.iter().map(|c| c.sequence_index).collect();
    assert_eq!(order, vec![4, 1, 3]);
    assert_eq!(ranked[0].rank, 1);
    assert_eq!(ranked[0].crop, visit.snapshot);
    assert!(ranked.iter().all(|c| c.session_id == visit.session_id));
    assert!(ranked[0].score.composite >= ranked[1].score.composite);
    assert!(r.pipeline.take_ranked_crops().is_empty());
}
