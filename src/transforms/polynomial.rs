//! Bivariate polynomial transforms of arbitrary order.
//!
//! Coefficients are stored per output component (x block, then y block),
//! each block in lexicographic exponent order: for total degree d = 0..order
//! the terms are x^d, x^(d−1)·y, …, y^d. The textual form is
//! `"<order> <a00> <a10> <a01> <a20> <a11> <a02> …"` and round-trips
//! exactly through `Display`/`FromStr` (Rust prints the shortest decimal
//! that reparses to the same float).

use std::fmt;
use std::str::FromStr;

use nalgebra::{Cholesky, DMatrix, DVector, Matrix2};

use crate::starcal_errors::StarcalError;
use crate::stars::Point;

use super::{LinearTransform, Transform};

/// Number of monomials of a bivariate polynomial of the given order.
#[inline]
pub fn nterms(order: usize) -> usize {
    (order + 1) * (order + 2) / 2
}

/// Polynomial map ℝ² → ℝ² of fixed order.
#[derive(Debug, Clone, PartialEq)]
pub struct PolyTransform {
    order: usize,
    nterms: usize,
    /// x-component block followed by y-component block, `2 * nterms` long.
    coeffs: Vec<f64>,
}

impl PolyTransform {
    /// The identity map expressed at the given order (a10 = 1 in x,
    /// a01 = 1 in y, everything else zero).
    pub fn identity_of_order(order: usize) -> Self {
        let n = nterms(order);
        let mut coeffs = vec![0.0; 2 * n];
        if order >= 1 {
            coeffs[1] = 1.0; // x block: coefficient of x
            coeffs[n + 2] = 1.0; // y block: coefficient of y
        }
        PolyTransform {
            order,
            nterms: n,
            coeffs,
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Coefficient of `x^ix · y^iy` for the given output component
    /// (0 = x, 1 = y).
    pub fn coeff(&self, ix: usize, iy: usize, component: usize) -> f64 {
        let d = ix + iy;
        debug_assert!(d <= self.order && component < 2);
        let idx = d * (d + 1) / 2 + iy;
        self.coeffs[component * self.nterms + idx]
    }

    /// Fill `out` (length `nterms`) with the monomials at `p`.
    fn monomials(&self, p: &Point, out: &mut [f64]) {
        let mut k = 0;
        for d in 0..=self.order {
            for iy in 0..=d {
                let ix = d - iy;
                out[k] = p.x.powi(ix as i32) * p.y.powi(iy as i32);
                k += 1;
            }
        }
    }

    /// Ordinary-least-squares fit of a polynomial of `order` over
    /// `(source, target)` pairs. Returns the transform and the summed
    /// squared residual.
    pub fn fit(pairs: &[(Point, Point)], order: usize) -> Result<(Self, f64), StarcalError> {
        let n = nterms(order);
        if pairs.len() < n {
            return Err(StarcalError::DegenerateInput(format!(
                "polynomial fit of order {} needs at least {} pairs, got {}",
                order,
                n,
                pairs.len()
            )));
        }
        let mut poly = PolyTransform::identity_of_order(order);
        let mut m = DMatrix::<f64>::zeros(n, n);
        let mut bx = DVector::<f64>::zeros(n);
        let mut by = DVector::<f64>::zeros(n);
        let mut h = vec![0.0; n];
        for (s, t) in pairs {
            poly.monomials(s, &mut h);
            for i in 0..n {
                bx[i] += h[i] * t.x;
                by[i] += h[i] * t.y;
                for j in 0..n {
                    m[(i, j)] += h[i] * h[j];
                }
            }
        }
        let chol = Cholesky::new(m).ok_or_else(|| {
            StarcalError::DegenerateInput("degenerate source geometry in polynomial fit".into())
        })?;
        let cx = chol.solve(&bx);
        let cy = chol.solve(&by);
        poly.coeffs[..n].copy_from_slice(cx.as_slice());
        poly.coeffs[n..].copy_from_slice(cy.as_slice());

        let mut chi2 = 0.0;
        for (s, t) in pairs {
            let r = poly.apply(s);
            chi2 += r.dist2(t);
        }
        Ok((poly, chi2))
    }
}

impl From<&LinearTransform> for PolyTransform {
    fn from(lin: &LinearTransform) -> Self {
        let mut poly = PolyTransform::identity_of_order(1);
        poly.coeffs = vec![lin.dx, lin.a11, lin.a12, lin.dy, lin.a21, lin.a22];
        poly
    }
}

impl Transform for PolyTransform {
    fn apply(&self, p: &Point) -> Point {
        let n = self.nterms;
        let mut h = vec![0.0; n];
        self.monomials(p, &mut h);
        let mut x = 0.0;
        let mut y = 0.0;
        for k in 0..n {
            x += self.coeffs[k] * h[k];
            y += self.coeffs[n + k] * h[k];
        }
        Point::new(x, y)
    }

    fn kind(&self) -> &'static str {
        "polynomial"
    }

    fn npar(&self) -> usize {
        2 * self.nterms
    }

    fn offset_params(&mut self, delta: &[f64]) {
        debug_assert_eq!(delta.len(), self.coeffs.len());
        for (c, d) in self.coeffs.iter_mut().zip(delta) {
            *c += d;
        }
    }

    fn param_derivatives(&self, p: &Point, dx: &mut [f64], dy: &mut [f64]) {
        let n = self.nterms;
        debug_assert_eq!(dx.len(), 2 * n);
        debug_assert_eq!(dy.len(), 2 * n);
        dx.fill(0.0);
        dy.fill(0.0);
        let mut h = vec![0.0; n];
        self.monomials(p, &mut h);
        dx[..n].copy_from_slice(&h);
        dy[n..].copy_from_slice(&h);
    }

    fn jacobian(&self, p: &Point) -> Matrix2<f64> {
        let n = self.nterms;
        // d(x^ix y^iy)/dx and /dy, accumulated straight into the entries.
        let mut j = Matrix2::zeros();
        let mut k = 0;
        for d in 0..=self.order {
            for iy in 0..=d {
                let ix = d - iy;
                let ddx = if ix > 0 {
                    ix as f64 * p.x.powi(ix as i32 - 1) * p.y.powi(iy as i32)
                } else {
                    0.0
                };
                let ddy = if iy > 0 {
                    iy as f64 * p.x.powi(ix as i32) * p.y.powi(iy as i32 - 1)
                } else {
                    0.0
                };
                j[(0, 0)] += self.coeffs[k] * ddx;
                j[(0, 1)] += self.coeffs[k] * ddy;
                j[(1, 0)] += self.coeffs[n + k] * ddx;
                j[(1, 1)] += self.coeffs[n + k] * ddy;
                k += 1;
            }
        }
        j
    }

    fn as_linear(&self) -> Option<LinearTransform> {
        if self.order > 1 {
            return None;
        }
        let lin = if self.order == 0 {
            LinearTransform::shift(self.coeffs[0], self.coeffs[1])
        } else {
            LinearTransform::new(
                self.coeffs[1],
                self.coeffs[2],
                self.coeffs[4],
                self.coeffs[5],
                self.coeffs[0],
                self.coeffs[3],
            )
        };
        Some(lin)
    }

    fn clone_box(&self) -> Box<dyn Transform> {
        Box::new(self.clone())
    }
}

impl fmt::Display for PolyTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.order)?;
        for c in &self.coeffs {
            write!(f, " {}", c)?;
        }
        Ok(())
    }
}

impl FromStr for PolyTransform {
    type Err = StarcalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split_whitespace();
        let order: usize = tokens
            .next()
            .ok_or_else(|| StarcalError::ParseTransform("empty input".into()))?
            .parse()
            .map_err(|e| StarcalError::ParseTransform(format!("bad order: {e}")))?;
        let n = nterms(order);
        let mut coeffs = Vec::with_capacity(2 * n);
        for tok in tokens {
            let v: f64 = tok
                .parse()
                .map_err(|e| StarcalError::ParseTransform(format!("bad coefficient '{tok}': {e}")))?;
            coeffs.push(v);
        }
        if coeffs.len() != 2 * n {
            return Err(StarcalError::ParseTransform(format!(
                "order {} expects {} coefficients, got {}",
                order,
                2 * n,
                coeffs.len()
            )));
        }
        Ok(PolyTransform {
            order,
            nterms: n,
            coeffs,
        })
    }
}
