//! Affine maps: shifts, rotations, similarities, and their algebra.

use std::fmt;

use nalgebra::{Cholesky, Matrix2, Matrix3, Vector3};

use crate::constants::SINGULAR_DET;
use crate::starcal_errors::StarcalError;
use crate::stars::Point;

use super::Transform;

/// A general affine transform
/// `x' = a11·x + a12·y + dx`, `y' = a21·x + a22·y + dy`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearTransform {
    pub a11: f64,
    pub a12: f64,
    pub a21: f64,
    pub a22: f64,
    pub dx: f64,
    pub dy: f64,
}

impl LinearTransform {
    pub fn new(a11: f64, a12: f64, a21: f64, a22: f64, dx: f64, dy: f64) -> Self {
        LinearTransform {
            a11,
            a12,
            a21,
            a22,
            dx,
            dy,
        }
    }

    pub fn identity() -> Self {
        LinearTransform::new(1.0, 0.0, 0.0, 1.0, 0.0, 0.0)
    }

    /// Pure translation.
    pub fn shift(dx: f64, dy: f64) -> Self {
        LinearTransform::new(1.0, 0.0, 0.0, 1.0, dx, dy)
    }

    /// Rotation by `angle` radians about the origin.
    pub fn rotation(angle: f64) -> Self {
        let (s, c) = angle.sin_cos();
        LinearTransform::new(c, -s, s, c, 0.0, 0.0)
    }

    /// Uniform scaling about the origin.
    pub fn scaling(scale: f64) -> Self {
        LinearTransform::new(scale, 0.0, 0.0, scale, 0.0, 0.0)
    }

    /// Similarity: optional reflection across the x axis (`y ↦ −y`), then
    /// rotation by `angle`, uniform `scale`, and translation.
    pub fn similarity(dx: f64, dy: f64, angle: f64, scale: f64, flipped: bool) -> Self {
        let (s, c) = angle.sin_cos();
        let parity = if flipped { -1.0 } else { 1.0 };
        LinearTransform::new(
            scale * c,
            -scale * s * parity,
            scale * s,
            scale * c * parity,
            dx,
            dy,
        )
    }

    /// The unique similarity (optionally reflected) mapping `a ↦ ap` and
    /// `b ↦ bp`. Returns `None` when `a` and `b` coincide.
    ///
    /// Treating points as complex numbers, the direct solution is
    /// `z' = α·z + β` with `α = (bp−ap)/(b−a)`; the reflected one is
    /// `z' = α·conj(z) + β`.
    pub fn from_two_pairs(a: &Point, b: &Point, ap: &Point, bp: &Point, flipped: bool) -> Option<Self> {
        let zx = b.x - a.x;
        let zy = b.y - a.y;
        let wz = zx * zx + zy * zy;
        if wz < SINGULAR_DET {
            return None;
        }
        let wx = bp.x - ap.x;
        let wy = bp.y - ap.y;
        if flipped {
            // α = (bp−ap) / conj(b−a)
            let ar = (wx * zx - wy * zy) / wz;
            let ai = (wy * zx + wx * zy) / wz;
            let mut t = LinearTransform::new(ar, ai, ai, -ar, 0.0, 0.0);
            let ta = t.apply(a);
            t.dx = ap.x - ta.x;
            t.dy = ap.y - ta.y;
            Some(t)
        } else {
            // α = (bp−ap) / (b−a)
            let ar = (wx * zx + wy * zy) / wz;
            let ai = (wy * zx - wx * zy) / wz;
            let mut t = LinearTransform::new(ar, -ai, ai, ar, 0.0, 0.0);
            let ta = t.apply(a);
            t.dx = ap.x - ta.x;
            t.dy = ap.y - ta.y;
            Some(t)
        }
    }

    /// Ordinary-least-squares affine fit over `(source, target)` pairs.
    ///
    /// Solves the two 3-unknown normal systems sharing one moment matrix.
    /// Fails with [`StarcalError::DegenerateInput`] for fewer than 3 pairs
    /// or collinear sources.
    pub fn fit(pairs: &[(Point, Point)]) -> Result<Self, StarcalError> {
        if pairs.len() < 3 {
            return Err(StarcalError::DegenerateInput(format!(
                "affine fit needs at least 3 pairs, got {}",
                pairs.len()
            )));
        }
        let mut m = Matrix3::<f64>::zeros();
        let mut bx = Vector3::<f64>::zeros();
        let mut by = Vector3::<f64>::zeros();
        for (s, t) in pairs {
            let h = Vector3::new(1.0, s.x, s.y);
            m += h * h.transpose();
            bx += h * t.x;
            by += h * t.y;
        }
        let chol = Cholesky::new(m).ok_or_else(|| {
            StarcalError::DegenerateInput("collinear sources in affine fit".into())
        })?;
        let cx = chol.solve(&bx);
        let cy = chol.solve(&by);
        Ok(LinearTransform::new(cx[1], cx[2], cy[1], cy[2], cx[0], cy[0]))
    }

    #[inline]
    pub fn determinant(&self) -> f64 {
        self.a11 * self.a22 - self.a12 * self.a21
    }

    /// Uniform scale factor, `sqrt(|det|)`.
    pub fn scale(&self) -> f64 {
        self.determinant().abs().sqrt()
    }

    /// Rotation angle in radians (meaningful for similarities).
    pub fn rotation_angle(&self) -> f64 {
        self.a21.atan2(self.a11)
    }

    /// True when the transform reverses orientation.
    pub fn is_flipped(&self) -> bool {
        self.determinant() < 0.0
    }

    pub fn is_identity(&self) -> bool {
        *self == LinearTransform::identity()
    }

    /// Exact composition: the result applies `rhs` first, then `self`.
    pub fn times(&self, rhs: &LinearTransform) -> LinearTransform {
        LinearTransform::new(
            self.a11 * rhs.a11 + self.a12 * rhs.a21,
            self.a11 * rhs.a12 + self.a12 * rhs.a22,
            self.a21 * rhs.a11 + self.a22 * rhs.a21,
            self.a21 * rhs.a12 + self.a22 * rhs.a22,
            self.a11 * rhs.dx + self.a12 * rhs.dy + self.dx,
            self.a21 * rhs.dx + self.a22 * rhs.dy + self.dy,
        )
    }

    /// Exact inverse.
    pub fn inverse(&self) -> Result<LinearTransform, StarcalError> {
        let det = self.determinant();
        if det.abs() < SINGULAR_DET {
            return Err(StarcalError::SingularTransform);
        }
        let i11 = self.a22 / det;
        let i12 = -self.a12 / det;
        let i21 = -self.a21 / det;
        let i22 = self.a11 / det;
        Ok(LinearTransform::new(
            i11,
            i12,
            i21,
            i22,
            -(i11 * self.dx + i12 * self.dy),
            -(i21 * self.dx + i22 * self.dy),
        ))
    }
}

impl Transform for LinearTransform {
    fn apply(&self, p: &Point) -> Point {
        Point::new(
            self.a11 * p.x + self.a12 * p.y + self.dx,
            self.a21 * p.x + self.a22 * p.y + self.dy,
        )
    }

    fn kind(&self) -> &'static str {
        "linear"
    }

    fn npar(&self) -> usize {
        6
    }

    // Parameter order matches the order-1 polynomial blocks:
    // (dx, a11, a12) for the x component, (dy, a21, a22) for y.
    fn offset_params(&mut self, delta: &[f64]) {
        debug_assert_eq!(delta.len(), 6);
        self.dx += delta[0];
        self.a11 += delta[1];
        self.a12 += delta[2];
        self.dy += delta[3];
        self.a21 += delta[4];
        self.a22 += delta[5];
    }

    fn param_derivatives(&self, p: &Point, dx: &mut [f64], dy: &mut [f64]) {
        debug_assert_eq!(dx.len(), 6);
        debug_assert_eq!(dy.len(), 6);
        dx.fill(0.0);
        dy.fill(0.0);
        dx[0] = 1.0;
        dx[1] = p.x;
        dx[2] = p.y;
        dy[3] = 1.0;
        dy[4] = p.x;
        dy[5] = p.y;
    }

    fn jacobian(&self, _p: &Point) -> Matrix2<f64> {
        Matrix2::new(self.a11, self.a12, self.a21, self.a22)
    }

    fn inverted(&self) -> Result<Box<dyn Transform>, StarcalError> {
        Ok(Box::new(self.inverse()?))
    }

    fn as_linear(&self) -> Option<LinearTransform> {
        Some(*self)
    }

    fn clone_box(&self) -> Box<dyn Transform> {
        Box::new(*self)
    }
}

impl fmt::Display for LinearTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "linear [{:+.6e} {:+.6e} {:+.6e}; {:+.6e} {:+.6e} {:+.6e}]",
            self.a11, self.a12, self.dx, self.a21, self.a22, self.dy
        )
    }
}
