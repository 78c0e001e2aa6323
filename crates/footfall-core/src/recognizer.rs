//! ArcFace embedding extraction via ONNX Runtime.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{BoundingBox, Embedding, Frame};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// ArcFace normalizes symmetrically, unlike SCRFD.
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 127.5;
pub const EMBEDDING_DIM: usize = 512;
pub const MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("recognizer model not found: {0}")]
    ModelNotFound(String),
    #[error("face has no landmarks to align on")]
    NoLandmarks,
    #[error("landmarks are degenerate")]
    DegenerateLandmarks,
    #[error("expected {EMBEDDING_DIM}-dim embedding, got {0}")]
    BadDimension(usize),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct ArcFaceRecognizer {
    session: Session,
}

impl ArcFaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Align `face` within `frame` and embed it.
    pub fn extract(&mut self, frame: &Frame, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        let aligned = alignment::align_face(frame, landmarks).ok_or(RecognizerError::DegenerateLandmarks)?;
        self.embed_aligned(&aligned)
    }

    /// Embed an already aligned 112×112 crop. The result is L2-normalized.
    pub fn embed_aligned(&mut self, aligned: &Frame) -> Result<Embedding, RecognizerError> {
        let input = to_input_tensor(aligned);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::Inference(e.to_string()))?;
        if raw.len() != EMBEDDING_DIM {
            return Err(RecognizerError::BadDimension(raw.len()));
        }

        let mut embedding = Embedding::new(raw.to_vec()).l2_normalized();
        embedding.model_version = Some(MODEL_VERSION.to_string());
        Ok(embedding)
    }
}

/// Grayscale replicated to three channels; missing pixels read as black.
fn to_input_tensor(aligned: &Frame) -> Array4<f32> {
    let n = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, n, n));
    for y in 0..n {
        for x in 0..n {
            let v = (aligned.pixel(x as u32, y as u32) as f32 - PIXEL_MEAN) / PIXEL_STD;
            for c in 0..3 {
                tensor[[0, c, y, x]] = v;
            }
        }
    }
    tensor
}
