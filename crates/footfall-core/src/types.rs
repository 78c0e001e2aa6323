use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row identifier of a visitor in the store.
pub type VisitorId = i64;

/// Bounding box for a detected face, with optional facial landmarks.
///
/// Coordinates are in pixels of the frame the detection was run on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Build a box from corner coordinates `(x1, y1, x2, y2)`.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Self {
        Self {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence,
            landmarks: None,
        }
    }

    pub fn x2(&self) -> f32 {
        self.x + self.width
    }

    pub fn y2(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Eye landmarks `(left, right)` if the detector produced landmarks.
    pub fn eyes(&self) -> Option<((f32, f32), (f32, f32))> {
        self.landmarks.map(|lms| (lms[0], lms[1]))
    }

    /// Clip the box to `[0, width] x [0, height]`.
    ///
    /// Detectors regularly report boxes that overhang the frame edge by a
    /// few pixels; clipping keeps those usable. The result may be empty.
    pub fn clamped(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        let x1 = self.x.clamp(0.0, w);
        let y1 = self.y.clamp(0.0, h);
        let x2 = self.x2().clamp(0.0, w);
        let y2 = self.y2().clamp(0.0, h);
        Self {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: self.confidence,
            landmarks: self.landmarks,
        }
    }

    /// Same box expressed in a frame scaled by `factor`.
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
            confidence: self.confidence,
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(lx, ly)| (lx * factor, ly * factor))),
        }
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.x2().min(other.x2());
        let y2 = self.y2().min(other.y2());

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;

        if union > 0.0 { inter / union } else { 0.0 }
    }
}

/// A grayscale image: a camera frame or a crop of one.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Row-major 8-bit luma, `width * height` bytes.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Source sequence number (driver sequence for cameras, file index for replay).
    pub sequence: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self { data, width, height, sequence: 0 }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// True when the buffer holds exactly `width * height` bytes.
    pub fn is_well_formed(&self) -> bool {
        self.data.len() as u64 == self.area()
    }

    /// Pixel at `(x, y)`, or 0 outside the buffer.
    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        if x >= self.width || y >= self.height {
            return 0;
        }
        self.data
            .get(y as usize * self.width as usize + x as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    /// Integer pixel rectangle `(x1, y1, x2, y2)` covering `face` grown by
    /// `padding` of its size on every side, clipped to the frame.
    pub fn padded_rect(&self, face: &BoundingBox, padding: f32) -> (u32, u32, u32, u32) {
        let pad_x = face.width * padding;
        let pad_y = face.height * padding;
        let x1 = (face.x - pad_x).floor().clamp(0.0, self.width as f32) as u32;
        let y1 = (face.y - pad_y).floor().clamp(0.0, self.height as f32) as u32;
        let x2 = (face.x2() + pad_x).ceil().clamp(0.0, self.width as f32) as u32;
        let y2 = (face.y2() + pad_y).ceil().clamp(0.0, self.height as f32) as u32;
        (x1, y1, x2.max(x1), y2.max(y1))
    }

    /// Copy out the face region grown by `padding`, clipped to the frame.
    pub fn crop(&self, face: &BoundingBox, padding: f32) -> Frame {
        let (x1, y1, x2, y2) = self.padded_rect(face, padding);
        let (w, h) = (x2 - x1, y2 - y1);
        let mut data = Vec::with_capacity((w * h) as usize);
        for y in y1..y2 {
            for x in x1..x2 {
                data.push(self.pixel(x, y));
            }
        }
        Frame { data, width: w, height: h, sequence: self.sequence }
    }

    /// Bilinear resize to exactly `new_w x new_h`.
    pub fn resize(&self, new_w: u32, new_h: u32) -> Frame {
        let (w, h) = (self.width as usize, self.height as usize);
        let (nw, nh) = (new_w as usize, new_h as usize);
        if w == 0 || h == 0 || nw == 0 || nh == 0 {
            return Frame { data: Vec::new(), width: 0, height: 0, sequence: self.sequence };
        }

        let sx = w as f32 / nw as f32;
        let sy = h as f32 / nh as f32;
        let mut out = vec![0u8; nw * nh];

        for y in 0..nh {
            let src_y = (y as f32 + 0.5) * sy - 0.5;
            let y0 = (src_y.floor() as i32).clamp(0, h as i32 - 1) as usize;
            let y1 = (y0 + 1).min(h - 1);
            let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

            for x in 0..nw {
                let src_x = (x as f32 + 0.5) * sx - 0.5;
                let x0 = (src_x.floor() as i32).clamp(0, w as i32 - 1) as usize;
                let x1 = (x0 + 1).min(w - 1);
                let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

                let at = |i: usize| self.data.get(i).copied().unwrap_or(0) as f32;
                let tl = at(y0 * w + x0);
                let tr = at(y0 * w + x1);
                let bl = at(y1 * w + x0);
                let br = at(y1 * w + x1);

                let val = tl * (1.0 - fx) * (1.0 - fy)
                    + tr * fx * (1.0 - fy)
                    + bl * (1.0 - fx) * fy
                    + br * fx * fy;
                out[y * nw + x] = val.round().clamp(0.0, 255.0) as u8;
            }
        }

        Frame { data: out, width: new_w, height: new_h, sequence: self.sequence }
    }

    /// Downscale so the frame is at most `target_width` wide, keeping aspect.
    ///
    /// Returns the frame unchanged (and factor 1.0) if it is already narrow enough.
    pub fn fit_width(self, target_width: u32) -> (Frame, f32) {
        if target_width == 0 || self.width <= target_width {
            return (self, 1.0);
        }
        let scale = target_width as f32 / self.width as f32;
        let new_h = ((self.height as f32 * scale).round() as u32).max(1);
        (self.resize(target_width, new_h), scale)
    }
}

/// Face embedding vector (typically 512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Zero vectors
    /// compare as 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Copy scaled to unit L2 norm. Zero vectors are returned unchanged.
    pub fn l2_normalized(&self) -> Embedding {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            self.values.iter().map(|x| x / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding { values, model_version: self.model_version.clone() }
    }

    /// Little-endian f32 bytes, the on-disk representation.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Inverse of [`to_le_bytes`](Self::to_le_bytes). Returns `None` if the
    /// length is not a multiple of 4.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Embedding> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Embedding::new(values))
    }
}

/// A known visitor as held by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Visitor {
    pub id: VisitorId,
    /// Enrollment embedding; never updated after insertion.
    pub embedding: Embedding,
    pub visit_count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Path of the saved face crop, if one was written.
    pub sample_image: Option<String>,
}

/// One recorded visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visit {
    pub visitor_id: VisitorId,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    /// Match similarity; `None` for the enrolling visit.
    pub similarity: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![-1.0, 0.0]);
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_l2_normalized_has_unit_norm() {
        let e = Embedding::new(vec![3.0, 4.0]).l2_normalized();
        assert!((e.values[0] - 0.6).abs() < 1e-6);
        assert!((e.values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_embedding_bytes_reject_truncated() {
        assert!(Embedding::from_le_bytes(&[0, 0, 128]).is_none());
        let e = Embedding::new(vec![0.25, -1.5]);
        assert_eq!(Embedding::from_le_bytes(&e.to_le_bytes()).unwrap().values, e.values);
    }

    #[test]
    fn test_iou_identical() {
        let a = BoundingBox::from_corners(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = BoundingBox::from_corners(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = BoundingBox::from_corners(5.0, 0.0, 15.0, 10.0, 1.0);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_clamped_box_stays_inside_frame() {
        let b = BoundingBox::from_corners(-5.0, 10.0, 50.0, 130.0, 0.9).clamped(40, 120);
        assert_eq!((b.x, b.y, b.x2(), b.y2()), (0.0, 10.0, 40.0, 120.0));
    }

    #[test]
    fn test_crop_with_padding_is_clipped() {
        let frame = Frame::new((0..100).map(|i| i as u8).collect(), 10, 10);
        let face = BoundingBox::from_corners(0.0, 0.0, 4.0, 4.0, 1.0);
        let crop = frame.crop(&face, 0.25);
        // Left/top padding falls off the frame, right/bottom grows by 1.
        assert_eq!((crop.width, crop.height), (5, 5));
        assert_eq!(crop.data[0], 0);
        assert_eq!(crop.data[6], 11);
    }

    #[test]
    fn test_resize_uniform_stays_uniform() {
        let frame = Frame::new(vec![128u8; 100 * 100], 100, 100);
        let resized = frame.resize(200, 150);
        assert_eq!(resized.data.len(), 200 * 150);
        assert!(resized.data.iter().all(|&p| p == 128));
    }

    #[test]
    fn test_fit_width_keeps_aspect() {
        let frame = Frame::new(vec![0u8; 1920 * 1080], 1920, 1080);
        let (resized, scale) = frame.fit_width(1280);
        assert_eq!((resized.width, resized.height), (1280, 720));
        assert!((scale - 2.0 / 3.0).abs() < 1e-6);

        let small = Frame::new(vec![0u8; 64 * 48], 64, 48);
        let (same, scale) = small.fit_width(1280);
        assert_eq!(same.width, 64);
        assert_eq!(scale, 1.0);
    }

    #[test]
    fn test_short_buffer_resizes_without_panicking() {
        let frame = Frame::new(vec![200u8; 10], 64, 64);
        assert!(!frame.is_well_formed());
        let (resized, _) = frame.fit_width(32);
        assert_eq!((resized.width, resized.height), (32, 32));
        assert_eq!(resized.data.len(), 32 * 32);
        assert!(Frame::new(vec![0; 12], 4, 3).is_well_formed());
    }
}
