//! ONNX-backed [`EmbeddingProvider`]: re-detect inside the selected crop,
//! align on the landmarks, run ArcFace.

use crate::detector::{DetectorError, ScrfdDetector};
use crate::provider::{best_face, EmbeddingProvider, ProviderError};
use crate::recognizer::{ArcFaceRecognizer, RecognizerError};
use crate::types::{Embedding, Frame};
use std::path::{Path, PathBuf};

pub const DETECTOR_MODEL: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL: &str = "w600k_r50.onnx";

/// Model directory: `$FOOTFALL_MODEL_DIR`, else `$XDG_DATA_HOME/footfall/models`,
/// else `~/.local/share/footfall/models`.
pub fn default_model_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FOOTFALL_MODEL_DIR") {
        return PathBuf::from(dir);
    }
    let data_home = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
            PathBuf::from(home).join(".local/share")
        });
    data_home.join("footfall/models")
}

impl From<RecognizerError> for ProviderError {
    fn from(e: RecognizerError) -> Self {
        ProviderError::Failed(e.to_string())
    }
}

/// SCRFD + ArcFace pair operating on face crops.
pub struct OnnxEmbedder {
    detector: ScrfdDetector,
    recognizer: ArcFaceRecognizer,
    min_confidence: f32,
}

impl OnnxEmbedder {
    pub fn new(detector: ScrfdDetector, recognizer: ArcFaceRecognizer) -> Self {
        Self { detector, recognizer, min_confidence: 0.5 }
    }

    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, ProviderError> {
        let detector = ScrfdDetector::load(&model_dir.join(DETECTOR_MODEL))?;
        let recognizer = ArcFaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL))?;
        Ok(Self::new(detector, recognizer))
    }

    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence;
        self
    }
}

impl EmbeddingProvider for OnnxEmbedder {
    fn embed(&mut self, face_crop: &Frame) -> Result<Option<Embedding>, ProviderError> {
        let faces = match self.detector.run(face_crop) {
            Ok(faces) => faces,
            Err(DetectorError::EmptyFrame) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let Some(face) = best_face(&faces, self.min_confidence) else {
            tracing::debug!(crop_w = face_crop.width, crop_h = face_crop.height, "no face in crop");
            return Ok(None);
        };

        match self.recognizer.extract(face_crop, face) {
            Ok(embedding) => Ok(Some(embedding)),
            Err(RecognizerError::NoLandmarks | RecognizerError::DegenerateLandmarks) => {
                tracing::debug!("crop face unusable for alignment");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
