//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes the frame to 640×640, decodes the three anchor-free stride
//! heads (8/16/32) and suppresses overlaps with NMS.

use crate::provider::{FaceDetector, ProviderError};
use crate::types::{BoundingBox, Frame};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: usize = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// Raw score floor for candidates entering NMS.
pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.4;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model not found: {0}")]
    ModelNotFound(String),
    #[error("detector output malformed: {0}")]
    BadOutput(String),
    #[error("empty frame")]
    EmptyFrame,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<DetectorError> for ProviderError {
    fn from(e: DetectorError) -> Self {
        ProviderError::Failed(e.to_string())
    }
}

/// Where the scaled frame sits inside the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: (INPUT_SIZE as f32 - new_w) / 2.0,
            pad_y: (INPUT_SIZE as f32 - new_h) / 2.0,
        }
    }

    /// Map a point from model input space back to the frame.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// `(score, bbox, kps)` output positions for one stride.
type HeadIndices = (usize, usize, usize);

pub struct ScrfdDetector {
    session: Session,
    heads: [HeadIndices; 3],
    score_threshold: f32,
    nms_threshold: f32,
}

impl ScrfdDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::BadOutput(format!(
                "expected 9 output tensors, model has {}",
                names.len()
            )));
        }
        let heads = head_indices(&names);

        tracing::info!(path = %model_path.display(), outputs = ?names, ?heads, "loaded SCRFD model");

        Ok(Self {
            session,
            heads,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
        })
    }

    pub fn with_thresholds(mut self, score: f32, nms: f32) -> Self {
        self.score_threshold = score;
        self.nms_threshold = nms;
        self
    }

    /// Faces in `frame`, highest confidence first.
    pub fn run(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
        if frame.width == 0 || frame.height == 0 || frame.data.is_empty() {
            return Err(DetectorError::EmptyFrame);
        }

        let (input, letterbox) = to_input_tensor(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in STRIDES.iter().enumerate() {
            let (si, bi, ki) = self.heads[pos];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::BadOutput(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(si, "scores")?;
            let boxes = extract(bi, "boxes")?;
            let kps = extract(ki, "landmarks")?;

            candidates.extend(decode_head(scores, boxes, kps, stride, &letterbox, self.score_threshold));
        }

        let faces = nms(candidates, self.nms_threshold);
        tracing::trace!(faces = faces.len(), "scrfd pass");
        Ok(faces)
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, ProviderError> {
        Ok(self.run(frame)?)
    }
}

/// Square NCHW tensor with the frame letterboxed in the middle. Padding is
/// filled with the mean so it normalizes to zero.
fn to_input_tensor(frame: &Frame) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(frame.width as usize, frame.height as usize);
    let new_w = ((frame.width as f32 * letterbox.scale).round() as u32).clamp(1, INPUT_SIZE as u32);
    let new_h = ((frame.height as f32 * letterbox.scale).round() as u32).clamp(1, INPUT_SIZE as u32);
    let scaled = frame.resize(new_w, new_h);

    let x0 = letterbox.pad_x.floor() as usize;
    let y0 = letterbox.pad_y.floor() as usize;
    let (sw, sh) = (new_w as usize, new_h as usize);

    let mut tensor = Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    for y in 0..INPUT_SIZE {
        for x in 0..INPUT_SIZE {
            let inside = (y0..y0 + sh).contains(&y) && (x0..x0 + sw).contains(&x);
            let pixel = if inside {
                scaled.data[(y - y0) * sw + (x - x0)] as f32
            } else {
                PIXEL_MEAN
            };
            let v = (pixel - PIXEL_MEAN) / PIXEL_STD;
            for c in 0..3 {
                tensor[[0, c, y, x]] = v;
            }
        }
    }

    (tensor, letterbox)
}

/// Match outputs by their `score_8`/`bbox_8`/`kps_8` names, falling back to
/// the usual positional layout (scores, then boxes, then landmarks).
fn head_indices(names: &[String]) -> [HeadIndices; 3] {
    let find = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let mut heads = [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
    for (pos, &stride) in STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride), find("kps", stride)) {
            (Some(s), Some(b), Some(k)) => heads[pos] = (s, b, k),
            _ => return [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
        }
    }
    heads
}

fn decode_head(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid_w = INPUT_SIZE / stride;
    let grid_h = INPUT_SIZE / stride;
    let anchors = grid_w * grid_h * ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut out = Vec::new();
    for idx in 0..anchors.min(scores.len()) {
        let score = scores[idx];
        if score <= threshold {
            continue;
        }
        let Some(d) = boxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / ANCHORS_PER_CELL;
        let ax = (cell % grid_w) as f32 * s;
        let ay = (cell / grid_w) as f32 * s;

        let (x1, y1) = letterbox.unmap(ax - d[0] * s, ay - d[1] * s);
        let (x2, y2) = letterbox.unmap(ax + d[2] * s, ay + d[3] * s);

        let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| letterbox.unmap(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s))
        });

        let mut face = BoundingBox::from_corners(x1, y1, x2, y2, score);
        face.landmarks = landmarks;
        out.push(face);
    }
    out
}

/// Greedy non-maximum suppression; output is sorted by confidence.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<BoundingBox> = Vec::new();
    for c in candidates {
        if kept.iter().all(|k| k.iou(&c) <= iou_threshold) {
            kept.push(c);
        }
    }
    kept
}
