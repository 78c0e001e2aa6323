//! Capability interfaces the pipeline is driven through.
//!
//! Frame capture, face detection and embedding extraction are external
//! collaborators. The pipeline only sees these traits, so cameras, replay
//! directories, ONNX models and test doubles are interchangeable.

use crate::types::{BoundingBox, Embedding, Frame};
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("frame read failed: {0}")]
    ReadFailed(String),
    #[error("frame source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider timed out")]
    Timeout,
    #[error("provider failed: {0}")]
    Failed(String),
}

/// A stream of grayscale frames.
pub trait FrameSource {
    /// Read the next frame. `Ok(None)` means the stream has ended.
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Re-establish the underlying connection after repeated failures.
    fn reset(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Cheap wake-up detector run on live frames.
pub trait FaceDetector {
    /// Faces found in `frame`, in any order.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, ProviderError>;
}

/// Produces an identity embedding from a face crop.
pub trait EmbeddingProvider {
    /// `Ok(None)` means the provider found no face in the crop.
    fn embed(&mut self, face_crop: &Frame) -> Result<Option<Embedding>, ProviderError>;
}

/// Monotonic time source, injectable for tests.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// The process monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        (**self).next_frame()
    }

    fn reset(&mut self) -> Result<(), SourceError> {
        (**self).reset()
    }
}

impl<T: FaceDetector + ?Sized> FaceDetector for Box<T> {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, ProviderError> {
        (**self).detect(frame)
    }
}

impl<T: EmbeddingProvider + ?Sized> EmbeddingProvider for Box<T> {
    fn embed(&mut self, face_crop: &Frame) -> Result<Option<Embedding>, ProviderError> {
        (**self).embed(face_crop)
    }
}

/// Highest-confidence face at or above `min_confidence`.
pub fn best_face(faces: &[BoundingBox], min_confidence: f32) -> Option<&BoundingBox> {
    faces
        .iter()
        .filter(|f| f.confidence >= min_confidence)
        .max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}
