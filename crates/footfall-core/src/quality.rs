//! Face quality scoring.
//!
//! Ranks the observations of a capture session so that the frame most
//! likely to yield a good embedding is the one sent for extraction. Five
//! component scores in [0, 1] are combined by a configurable weighted sum:
//!
//! - **sharpness**: variance of the 4-neighbour Laplacian (edge energy)
//! - **frontality**: linear falloff from a yaw/pitch estimate
//! - **size**: face area relative to frame area
//! - **brightness**: distance of mean luma from mid-gray
//! - **contrast**: standard deviation of luma
//!
//! Scoring is a pure function of the pixels, the face box and the
//! configuration. Degenerate (tiny) regions score low instead of failing.

use crate::session::Observation;
use crate::types::{BoundingBox, Frame};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const WEIGHT_SUM_TOLERANCE: f32 = 1e-3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QualityError {
    #[error("quality weight `{name}` must be finite and non-negative, got {value}")]
    InvalidWeight { name: &'static str, value: f32 },
    #[error("quality weights must sum to 1.0, got {0}")]
    WeightSum(f32),
    #[error("scoring parameter `{name}` must be finite and positive, got {value}")]
    InvalidParam { name: &'static str, value: f32 },
}

/// Relative importance of each component in the composite score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    pub sharpness: f32,
    pub frontality: f32,
    pub size: f32,
    pub brightness: f32,
    pub contrast: f32,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            sharpness: 0.30,
            frontality: 0.25,
            size: 0.15,
            brightness: 0.15,
            contrast: 0.15,
        }
    }
}

impl QualityWeights {
    fn named(&self) -> [(&'static str, f32); 5] {
        [
            ("sharpness", self.sharpness),
            ("frontality", self.frontality),
            ("size", self.size),
            ("brightness", self.brightness),
            ("contrast", self.contrast),
        ]
    }

    pub fn sum(&self) -> f32 {
        self.named().iter().map(|(_, w)| w).sum()
    }

    pub fn validate(&self) -> Result<(), QualityError> {
        for (name, value) in self.named() {
            if !value.is_finite() || value < 0.0 {
                return Err(QualityError::InvalidWeight { name, value });
            }
        }
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(QualityError::WeightSum(sum));
        }
        Ok(())
    }
}

/// Normalisation constants for the component scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityParams {
    /// Laplacian variance at which sharpness saturates.
    pub sharpness_reference: f32,
    /// Face/frame area ratio at which size saturates.
    pub size_saturation: f32,
    /// Luma regarded as ideal exposure.
    pub brightness_midpoint: f32,
    /// Luma standard deviation at which contrast saturates.
    pub contrast_reference: f32,
    /// Degrees of yaw for an eye-centre offset of one full face width.
    pub yaw_range: f32,
    /// Degrees of pitch for an eye-line offset of one full face height.
    pub pitch_range: f32,
    /// Yaw (degrees) contributing a full unit of frontality penalty.
    pub yaw_tolerance: f32,
    /// Pitch (degrees) contributing a full unit of frontality penalty.
    pub pitch_tolerance: f32,
    /// Expected eye line for a level face, as a fraction of box height from the top.
    pub expected_eye_height: f32,
    /// Yaw assigned to a fully asymmetric face by the symmetry fallback.
    pub symmetry_yaw_range: f32,
    /// Degrees added to the pitch magnitude per unit of eye-line slope (head roll).
    pub roll_pitch_penalty: f32,
    /// Padding added to each side of the face box for pixel statistics.
    pub roi_padding: f32,
    /// Regions narrower or shorter than this get zero sharpness and size.
    pub min_face_pixels: u32,
}

impl Default for QualityParams {
    fn default() -> Self {
        Self {
            sharpness_reference: 500.0,
            size_saturation: 0.10,
            brightness_midpoint: 127.0,
            contrast_reference: 50.0,
            yaw_range: 60.0,
            pitch_range: 50.0,
            yaw_tolerance: 45.0,
            pitch_tolerance: 30.0,
            expected_eye_height: 0.32,
            symmetry_yaw_range: 45.0,
            roll_pitch_penalty: 6.0,
            roi_padding: 0.10,
            min_face_pixels: 8,
        }
    }
}

impl QualityParams {
    pub fn validate(&self) -> Result<(), QualityError> {
        let positive = [
            ("sharpness_reference", self.sharpness_reference),
            ("size_saturation", self.size_saturation),
            ("brightness_midpoint", self.brightness_midpoint),
            ("contrast_reference", self.contrast_reference),
            ("yaw_tolerance", self.yaw_tolerance),
            ("pitch_tolerance", self.pitch_tolerance),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(QualityError::InvalidParam { name, value });
            }
        }
        for (name, value) in [("roi_padding", self.roi_padding), ("roll_pitch_penalty", self.roll_pitch_penalty)] {
            if !value.is_finite() || value < 0.0 {
                return Err(QualityError::InvalidParam { name, value });
            }
        }
        Ok(())
    }
}

/// How a head pose was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseMethod {
    /// From the detector's eye landmarks.
    Eyes,
    /// From left/right symmetry of the face region.
    Symmetry,
    /// Region too small to say anything; scored as worst case.
    Unavailable,
}

/// Estimated head orientation in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadPose {
    pub yaw: f32,
    pub pitch: f32,
    pub method: PoseMethod,
}

/// Head pose estimation strategy used for the frontality component.
pub trait PoseEstimator: Send {
    /// Must never fail: fall back to a cruder estimate instead.
    fn estimate(&self, frame: &Frame, face: &BoundingBox, params: &QualityParams) -> HeadPose;
}

/// Eye-geometry pose estimate with a symmetry fallback.
///
/// Yaw comes from the horizontal offset of the eye midpoint from the box
/// centre, pitch from the vertical offset of the eye line from where a
/// level face puts it. Without usable eye landmarks the left half of the
/// face is compared against the mirrored right half.
#[derive(Debug, Clone, Copy, Default)]
pub struct EyeGeometry;

impl PoseEstimator for EyeGeometry {
    fn estimate(&self, frame: &Frame, face: &BoundingBox, params: &QualityParams) -> HeadPose {
        if let Some((left, right)) = usable_eyes(face) {
            let (face_cx, _) = face.center();
            let eye_cx = (left.0 + right.0) / 2.0;
            let eye_cy = (left.1 + right.1) / 2.0;
            let expected_eye_y = face.y + face.height * params.expected_eye_height;
            let pitch = (eye_cy - expected_eye_y) / face.height * params.pitch_range;
            // A tilted eye line widens the pitch penalty in whichever direction the head is pitched.
            let slope = (right.1 - left.1) / (right.0 - left.0).abs().max(1.0);
            let roll = slope.abs() * params.roll_pitch_penalty;

            return HeadPose {
                yaw: (eye_cx - face_cx) / face.width * params.yaw_range,
                pitch: pitch + roll * pitch.signum(),
                method: PoseMethod::Eyes,
            };
        }

        match asymmetry(frame, face) {
            Some(a) => HeadPose {
                yaw: a * params.symmetry_yaw_range,
                pitch: 0.0,
                method: PoseMethod::Symmetry,
            },
            None => HeadPose {
                yaw: params.yaw_tolerance,
                pitch: params.pitch_tolerance,
                method: PoseMethod::Unavailable,
            },
        }
    }
}

/// Eye landmarks, if present and inside the face box.
fn usable_eyes(face: &BoundingBox) -> Option<((f32, f32), (f32, f32))> {
    if face.width <= 0.0 || face.height <= 0.0 {
        return None;
    }
    let (left, right) = face.eyes()?;
    let inside = |(x, y): (f32, f32)| {
        x.is_finite() && y.is_finite() && x >= face.x && x <= face.x2() && y >= face.y && y <= face.y2()
    };
    (inside(left) && inside(right)).then_some((left, right))
}

/// Mean absolute difference between the left half of the face and the
/// mirrored right half, normalised to [0, 1].
fn asymmetry(frame: &Frame, face: &BoundingBox) -> Option<f32> {
    let (x1, y1, x2, y2) = frame.padded_rect(face, 0.0);
    let half = (x2 - x1) / 2;
    if half == 0 || y2 <= y1 {
        return None;
    }

    let mut total = 0u64;
    let mut count = 0u64;
    for y in y1..y2 {
        for i in 0..half {
            let l = frame.pixel(x1 + i, y) as i32;
            let r = frame.pixel(x2 - 1 - i, y) as i32;
            total += (l - r).unsigned_abs() as u64;
            count += 1;
        }
    }
    Some((total as f64 / count as f64 / 255.0) as f32)
}

/// Frontality from a pose: 1.0 when level and facing the camera, falling
/// linearly to 0.0 as yaw and pitch reach their tolerances.
pub fn frontality_score(pose: &HeadPose, params: &QualityParams) -> f32 {
    let penalty = (pose.yaw.abs() / params.yaw_tolerance + pose.pitch.abs() / params.pitch_tolerance) / 2.0;
    clamp_unit(1.0 - penalty)
}

/// Quality of one observation. Immutable once computed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub sharpness: f32,
    pub frontality: f32,
    pub size: f32,
    pub brightness: f32,
    pub contrast: f32,
    /// Weighted sum of the five components.
    pub composite: f32,
    /// Estimated yaw in degrees.
    pub yaw: f32,
    /// Estimated pitch in degrees.
    pub pitch: f32,
    pub pose: PoseMethod,
}

/// Scores face observations with a fixed weighting.
pub struct QualityScorer {
    weights: QualityWeights,
    params: QualityParams,
    pose: Box<dyn PoseEstimator>,
}

impl Default for QualityScorer {
    fn default() -> Self {
        Self {
            weights: QualityWeights::default(),
            params: QualityParams::default(),
            pose: Box::new(EyeGeometry),
        }
    }
}

impl std::fmt::Debug for QualityScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityScorer")
            .field("weights", &self.weights)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl QualityScorer {
    /// Create a scorer, rejecting weights that do not sum to 1.0.
    pub fn new(weights: QualityWeights, params: QualityParams) -> Result<Self, QualityError> {
        weights.validate()?;
        params.validate()?;
        Ok(Self {
            weights,
            params,
            pose: Box::new(EyeGeometry),
        })
    }

    /// Replace the frontality pose estimator.
    pub fn with_pose_estimator(mut self, pose: Box<dyn PoseEstimator>) -> Self {
        self.pose = pose;
        self
    }

    pub fn weights(&self) -> &QualityWeights {
        &self.weights
    }

    pub fn params(&self) -> &QualityParams {
        &self.params
    }

    pub fn score(&self, observation: &Observation) -> QualityScore {
        self.score_face(&observation.frame, &observation.face)
    }

    /// Score a face box within a frame.
    pub fn score_face(&self, frame: &Frame, face: &BoundingBox) -> QualityScore {
        let p = &self.params;
        let roi = frame.padded_rect(face, p.roi_padding);
        let (roi_w, roi_h) = (roi.2 - roi.0, roi.3 - roi.1);
        let tiny = roi_w < p.min_face_pixels || roi_h < p.min_face_pixels;

        let (sharpness, size) = if tiny {
            tracing::debug!(roi_w, roi_h, "face region below minimum size");
            (0.0, 0.0)
        } else {
            let lap_var = laplacian_variance(frame, roi);
            let frame_area = frame.area() as f32;
            let size = if frame_area > 0.0 {
                clamp_unit(face.area() / frame_area / p.size_saturation)
            } else {
                0.0
            };
            (clamp_unit(lap_var / p.sharpness_reference), size)
        };

        let (brightness, contrast) = match luma_stats(frame, roi) {
            Some((mean, std_dev)) => (
                clamp_unit(1.0 - (mean - p.brightness_midpoint).abs() / p.brightness_midpoint),
                clamp_unit(std_dev / p.contrast_reference),
            ),
            None => (0.0, 0.0),
        };

        let pose = self.pose.estimate(frame, face, p);
        let frontality = frontality_score(&pose, p);

        let w = &self.weights;
        let composite = clamp_unit(
            w.sharpness * sharpness
                + w.frontality * frontality
                + w.size * size
                + w.brightness * brightness
                + w.contrast * contrast,
        );

        QualityScore {
            sharpness,
            frontality,
            size,
            brightness,
            contrast,
            composite,
            yaw: pose.yaw,
            pitch: pose.pitch,
            pose: pose.method,
        }
    }
}

fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

/// Mean and population standard deviation of luma inside `rect`.
fn luma_stats(frame: &Frame, (x1, y1, x2, y2): (u32, u32, u32, u32)) -> Option<(f32, f32)> {
    let n = (x2 - x1) as u64 * (y2 - y1) as u64;
    if n == 0 {
        return None;
    }
    let mut sum = 0f64;
    let mut sum_sq = 0f64;
    for y in y1..y2 {
        for x in x1..x2 {
            let v = frame.pixel(x, y) as f64;
            sum += v;
            sum_sq += v * v;
        }
    }
    let mean = sum / n as f64;
    let var = (sum_sq / n as f64 - mean * mean).max(0.0);
    Some((mean as f32, var.sqrt() as f32))
}

/// Variance of the 4-neighbour Laplacian over the interior of `rect`.
fn laplacian_variance(frame: &Frame, (x1, y1, x2, y2): (u32, u32, u32, u32)) -> f32 {
    if x2 - x1 < 3 || y2 - y1 < 3 {
        return 0.0;
    }
    let mut sum = 0f64;
    let mut sum_sq = 0f64;
    let mut n = 0u64;
    for y in (y1 + 1)..(y2 - 1) {
        for x in (x1 + 1)..(x2 - 1) {
            let c = frame.pixel(x, y) as f64;
            let lap = frame.pixel(x - 1, y) as f64
                + frame.pixel(x + 1, y) as f64
                + frame.pixel(x, y - 1) as f64
                + frame.pixel(x, y + 1) as f64
                - 4.0 * c;
            sum += lap;
            sum_sq += lap * lap;
            n += 1;
        }
    }
    let mean = sum / n as f64;
    ((sum_sq / n as f64) - mean * mean).max(0.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(value: u8, w: u32, h: u32) -> Frame {
        Frame::new(vec![value; (w * h) as usize], w, h)
    }

    fn checkerboard(w: u32, h: u32) -> Frame {
        let data = (0..h)
            .flat_map(|y| (0..w).map(move |x| if (x + y) % 2 == 0 { 0u8 } else { 255u8 }))
            .collect();
        Frame::new(data, w, h)
    }

    /// Deterministic pseudo-random texture.
    fn noise(w: u32, h: u32, seed: u32) -> Frame {
        let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
        let data = (0..w * h)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 24) as u8
            })
            .collect();
        Frame::new(data, w, h)
    }

    fn face(x1: f32, y1: f32, x2: f32, y2: f32) -> BoundingBox {
        BoundingBox::from_corners(x1, y1, x2, y2, 0.9)
    }

    fn assert_unit(s: &QualityScore) {
        for v in [s.sharpness, s.frontality, s.size, s.brightness, s.contrast, s.composite] {
            assert!((0.0..=1.0).contains(&v), "component out of range: {s:?}");
        }
    }

    #[test]
    fn test_default_weights_are_valid() {
        let w = QualityWeights::default();
        assert!(w.validate().is_ok());
        assert!((w.sum() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let w = QualityWeights { sharpness: 0.5, ..QualityWeights::default() };
        assert!(matches!(w.validate(), Err(QualityError::WeightSum(_))));
        assert!(QualityScorer::new(w, QualityParams::default()).is_err());
    }

    #[test]
    fn test_negative_weight_rejected() {
        let w = QualityWeights {
            sharpness: -0.1,
            frontality: 0.65,
            ..QualityWeights::default()
        };
        assert!(matches!(
            w.validate(),
            Err(QualityError::InvalidWeight { name: "sharpness", .. })
        ));
    }

    #[test]
    fn test_zero_reference_rejected() {
        let p = QualityParams { contrast_reference: 0.0, ..QualityParams::default() };
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_all_components_in_unit_range() {
        let scorer = QualityScorer::default();
        let frames = [uniform(0, 64, 48), uniform(255, 64, 48), checkerboard(64, 48), noise(64, 48, 7)];
        let faces = [
            face(0.0, 0.0, 64.0, 48.0),
            face(10.0, 5.0, 40.0, 40.0),
            face(60.0, 44.0, 64.0, 48.0),
        ];
        for frame in &frames {
            for f in &faces {
                assert_unit(&scorer.score_face(frame, f));
            }
        }
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let scorer = QualityScorer::default();
        let frame = noise(120, 90, 42);
        let f = face(20.0, 10.0, 90.0, 80.0);
        let first = scorer.score_face(&frame, &f);
        for _ in 0..5 {
            assert_eq!(scorer.score_face(&frame, &f), first);
        }
    }

    #[test]
    fn test_sharp_texture_beats_flat_region() {
        let scorer = QualityScorer::default();
        let f = face(8.0, 8.0, 56.0, 56.0);
        let sharp = scorer.score_face(&checkerboard(64, 64), &f);
        let flat = scorer.score_face(&uniform(127, 64, 64), &f);
        assert!((sharp.sharpness - 1.0).abs() < 1e-6);
        assert_eq!(flat.sharpness, 0.0);
    }

    #[test]
    fn test_brightness_penalises_extremes() {
        let scorer = QualityScorer::default();
        let f = face(8.0, 8.0, 56.0, 56.0);
        assert!((scorer.score_face(&uniform(127, 64, 64), &f).brightness - 1.0).abs() < 1e-6);
        assert_eq!(scorer.score_face(&uniform(0, 64, 64), &f).brightness, 0.0);
        assert_eq!(scorer.score_face(&uniform(255, 64, 64), &f).brightness, 0.0);
    }

    #[test]
    fn test_contrast_saturates() {
        let scorer = QualityScorer::default();
        let f = face(8.0, 8.0, 56.0, 56.0);
        assert_eq!(scorer.score_face(&uniform(90, 64, 64), &f).contrast, 0.0);
        // Alternating 0/255 has a standard deviation of 127.5.
        assert!((scorer.score_face(&checkerboard(64, 64), &f).contrast - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_size_saturates_at_ten_percent() {
        let scorer = QualityScorer::default();
        let frame = uniform(127, 100, 100);
        // 1000 px² of 10000 px² = 10%.
        let full = scorer.score_face(&frame, &face(0.0, 0.0, 50.0, 20.0));
        assert!((full.size - 1.0).abs() < 1e-6);
        // 500 px² = 5% → 0.5.
        let half = scorer.score_face(&frame, &face(0.0, 0.0, 25.0, 20.0));
        assert!((half.size - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_frontal_eyes_score_one() {
        let scorer = QualityScorer::default();
        let frame = noise(200, 200, 3);
        let mut f = face(50.0, 50.0, 150.0, 150.0);
        // Eye midpoint at the box centre, eye line at 32% of the height.
        f.landmarks = Some([(80.0, 82.0), (120.0, 82.0), (100.0, 105.0), (85.0, 125.0), (115.0, 125.0)]);
        let s = scorer.score_face(&frame, &f);
        assert_eq!(s.pose, PoseMethod::Eyes);
        assert!(s.yaw.abs() < 1e-4 && s.pitch.abs() < 1e-4, "{s:?}");
        assert!((s.frontality - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_turned_face_loses_frontality() {
        let scorer = QualityScorer::default();
        let frame = noise(200, 200, 3);
        let mut f = face(50.0, 50.0, 150.0, 150.0);
        // Eye midpoint 15 px right of centre → yaw = 0.15 * 60 = 9°.
        f.landmarks = Some([(95.0, 82.0), (135.0, 82.0), (115.0, 105.0), (100.0, 125.0), (130.0, 125.0)]);
        let s = scorer.score_face(&frame, &f);
        assert!((s.yaw - 9.0).abs() < 1e-3, "yaw = {}", s.yaw);
        // 1 - (9/45)/2 = 0.9
        assert!((s.frontality - 0.9).abs() < 1e-4);
    }

    #[test]
    fn test_tilted_eye_line_adds_pitch() {
        let scorer = QualityScorer::default();
        let frame = noise(200, 200, 3);
        let mut f = face(50.0, 50.0, 150.0, 150.0);
        // Eye midpoint stays on the expected line; slope 8/40 = 0.2 → 0.2 * 6 = 1.2°.
        f.landmarks = Some([(80.0, 78.0), (120.0, 86.0), (100.0, 105.0), (85.0, 125.0), (115.0, 125.0)]);
        let s = scorer.score_face(&frame, &f);
        assert!(s.yaw.abs() < 1e-4);
        assert!((s.pitch.abs() - 1.2).abs() < 1e-4, "pitch = {}", s.pitch);
        // 1 - (1.2/30)/2 = 0.98
        assert!((s.frontality - 0.98).abs() < 1e-4);

        let level = QualityParams { roll_pitch_penalty: 0.0, ..QualityParams::default() };
        let s = QualityScorer::new(QualityWeights::default(), level).unwrap().score_face(&frame, &f);
        assert!(s.pitch.abs() < 1e-4);
    }

    #[test]
    fn test_extreme_pose_floors_at_zero() {
        let pose = HeadPose { yaw: 80.0, pitch: 60.0, method: PoseMethod::Eyes };
        assert_eq!(frontality_score(&pose, &QualityParams::default()), 0.0);
    }

    #[test]
    fn test_missing_eyes_fall_back_to_symmetry() {
        let scorer = QualityScorer::default();
        // Horizontally mirrored pattern: perfectly symmetric.
        let w = 64u32;
        let data = (0..w * w)
            .map(|i| {
                let x = i % w;
                let d = if x < w / 2 { x } else { w - 1 - x };
                (d * 8) as u8
            })
            .collect();
        let frame = Frame::new(data, w, w);
        let s = scorer.score_face(&frame, &face(0.0, 0.0, 64.0, 64.0));
        assert_eq!(s.pose, PoseMethod::Symmetry);
        assert!((s.frontality - 1.0).abs() < 1e-6);

        // Left dark, right bright: strongly asymmetric.
        let data = (0..w * w).map(|i| if i % w < w / 2 { 0u8 } else { 255u8 }).collect();
        let frame = Frame::new(data, w, w);
        let s = scorer.score_face(&frame, &face(0.0, 0.0, 64.0, 64.0));
        assert_eq!(s.pose, PoseMethod::Symmetry);
        // yaw = 45°, 1 - (45/45)/2 = 0.5
        assert!((s.frontality - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_eyes_outside_box_use_symmetry() {
        let scorer = QualityScorer::default();
        let frame = uniform(127, 100, 100);
        let mut f = face(20.0, 20.0, 80.0, 80.0);
        f.landmarks = Some([(0.0, 0.0), (99.0, 0.0), (50.0, 50.0), (30.0, 70.0), (70.0, 70.0)]);
        assert_eq!(scorer.score_face(&frame, &f).pose, PoseMethod::Symmetry);
    }

    #[test]
    fn test_tiny_region_scores_lowest_without_panicking() {
        let scorer = QualityScorer::default();
        let frame = checkerboard(64, 64);
        let s = scorer.score_face(&frame, &face(10.0, 10.0, 13.0, 12.0));
        assert_eq!(s.sharpness, 0.0);
        assert_eq!(s.size, 0.0);
        assert_unit(&s);

        let empty = scorer.score_face(&frame, &face(70.0, 70.0, 80.0, 80.0));
        assert_eq!(empty.composite, 0.0);
        assert_eq!(empty.pose, PoseMethod::Unavailable);
    }

    #[test]
    fn test_composite_uses_weights() {
        let weights = QualityWeights {
            sharpness: 0.0,
            frontality: 0.0,
            size: 0.0,
            brightness: 1.0,
            contrast: 0.0,
        };
        let scorer = QualityScorer::new(weights, QualityParams::default()).unwrap();
        let s = scorer.score_face(&uniform(127, 64, 64), &face(8.0, 8.0, 56.0, 56.0));
        assert!((s.composite - s.brightness).abs() < 1e-6);
    }

    #[test]
    fn test_pose_estimator_is_substitutable() {
        struct AlwaysProfile;
        impl PoseEstimator for AlwaysProfile {
            fn estimate(&self, _: &Frame, _: &BoundingBox, _: &QualityParams) -> HeadPose {
                HeadPose { yaw: 90.0, pitch: 0.0, method: PoseMethod::Eyes }
            }
        }
        let scorer = QualityScorer::default().with_pose_estimator(Box::new(AlwaysProfile));
        let s = scorer.score_face(&noise(64, 64, 1), &face(8.0, 8.0, 56.0, 56.0));
        // 1 - (90/45)/2 = 0
        assert_eq!(s.frontality, 0.0);
    }
}
