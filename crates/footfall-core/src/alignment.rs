//! Five-point face alignment to the canonical ArcFace 112×112 crop.

use crate::types::Frame;

/// Landmark positions of the canonical 112×112 ArcFace input.
pub const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

pub const ALIGNED_SIZE: u32 = 112;

/// 4-DOF similarity transform `p' = [a -b; b a] p + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl SimilarityTransform {
    pub const IDENTITY: Self = Self { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 };

    /// Least-squares fit mapping `src` onto `dst`.
    ///
    /// Degenerate input (all points coincident) yields `None`.
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        // Normal equations of
        //   sx*a - sy*b + tx = dx
        //   sy*a + sx*b + ty = dy
        let mut ata = [[0.0f64; 4]; 4];
        let mut atb = [0.0f64; 4];
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy, dx, dy) = (sx as f64, sy as f64, dx as f64, dy as f64);
            let rows = [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)];
            for (r, rhs) in rows {
                for j in 0..4 {
                    for k in 0..4 {
                        ata[j][k] += r[j] * r[k];
                    }
                    atb[j] += r[j] * rhs;
                }
            }
        }

        let [a, b, tx, ty] = solve4(ata, atb)?;
        Some(Self { a: a as f32, b: b as f32, tx: tx as f32, ty: ty as f32 })
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    pub fn scale(&self) -> f32 {
        (self.a * self.a + self.b * self.b).sqrt()
    }

    /// Render the `size × size` output by inverse-mapping every pixel into
    /// `frame` with bilinear sampling. Samples outside the frame are black.
    pub fn warp(&self, frame: &Frame, size: u32) -> Frame {
        let n = size as usize;
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return Frame::new(vec![0u8; n * n], size, size);
        }
        let (ia, ib) = (self.a / det, self.b / det);

        let (w, h) = (frame.width as i32, frame.height as i32);
        let sample = |x: i32, y: i32| -> f32 {
            if (0..w).contains(&x) && (0..h).contains(&y) {
                frame.data[y as usize * w as usize + x as usize] as f32
            } else {
                0.0
            }
        };

        let mut out = vec![0u8; n * n];
        for oy in 0..n {
            for ox in 0..n {
                let dx = ox as f32 - self.tx;
                let dy = oy as f32 - self.ty;
                let sx = ia * dx + ib * dy;
                let sy = -ib * dx + ia * dy;

                let (x0, y0) = (sx.floor() as i32, sy.floor() as i32);
                let (fx, fy) = (sx - x0 as f32, sy - y0 as f32);
                let v = sample(x0, y0) * (1.0 - fx) * (1.0 - fy)
                    + sample(x0 + 1, y0) * fx * (1.0 - fy)
                    + sample(x0, y0 + 1) * (1.0 - fx) * fy
                    + sample(x0 + 1, y0 + 1) * fx * fy;
                out[oy * n + ox] = v.round().clamp(0.0, 255.0) as u8;
            }
        }

        Frame::new(out, size, size)
    }
}

/// Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve4(mut m: [[f64; 4]; 4], mut v: [f64; 4]) -> Option<[f64; 4]> {
    for col in 0..4 {
        let pivot = (col..4).max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))?;
        m.swap(col, pivot);
        v.swap(col, pivot);
        if m[col][col].abs() < 1e-12 {
            return None;
        }
        for row in col + 1..4 {
            let f = m[row][col] / m[col][col];
            for k in col..4 {
                m[row][k] -= f * m[col][k];
            }
            v[row] -= f * v[col];
        }
    }

    let mut x = [0.0f64; 4];
    for i in (0..4).rev() {
        let tail: f64 = (i + 1..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (v[i] - tail) / m[i][i];
    }
    Some(x)
}

/// Warp the face described by `landmarks` into the canonical 112×112 crop.
pub fn align_face(frame: &Frame, landmarks: &[(f32, f32); 5]) -> Option<Frame> {
    let t = SimilarityTransform::estimate(landmarks, &REFERENCE_LANDMARKS)?;
    Some(t.warp(frame, ALIGNED_SIZE))
}
