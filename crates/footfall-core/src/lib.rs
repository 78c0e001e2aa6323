//! footfall-core — visitor counting engine.
//!
//! Samples a short burst of frames after each detection, keeps the sharpest
//! and most frontal face, embeds it once and decides whether the person has
//! been seen before. Detection and embedding run through SCRFD and ArcFace
//! on ONNX Runtime, behind capability traits so tests can script them.

pub mod alignment;
pub mod cooldown;
pub mod detector;
pub mod embedder;
pub mod matcher;
pub mod pipeline;
pub mod provider;
pub mod quality;
pub mod recognizer;
pub mod session;
pub mod store;
pub mod types;

pub use cooldown::CooldownGate;
pub use detector::ScrfdDetector;
pub use embedder::{default_model_dir, OnnxEmbedder};
pub use matcher::{IdentityMatcher, Identification, Outcome, DEFAULT_SIMILARITY_THRESHOLD};
pub use pipeline::{
    DiscardReason, Pipeline, PipelineConfig, PipelineError, PipelineEvent, PipelineStats, RankedCrop, VisitOutcome,
};
pub use provider::{Clock, EmbeddingProvider, FaceDetector, FrameSource, ProviderError, SourceError, SystemClock};
pub use quality::{QualityParams, QualityScore, QualityScorer, QualityWeights};
pub use recognizer::ArcFaceRecognizer;
pub use session::{CaptureConfig, CaptureSession, Observation, SessionState};
pub use store::{MemoryStore, StoreError, VisitorStore};
pub use types::{BoundingBox, Embedding, Frame, Visit, Visitor, VisitorId};
