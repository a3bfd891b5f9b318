//! Geometrical maps ℝ² → ℝ² and their capability set.
//!
//! The fitter and the matcher see transforms only through the [`Transform`]
//! trait: apply a point, expose parameters, differentiate with respect to
//! inputs or parameters, compose, invert. Concrete variants live in the
//! submodules ([`LinearTransform`], [`PolyTransform`], [`TanProjection`]).
//!
//! Composition goes through [`compose`], which collapses identities and
//! multiplies linear pairs exactly; anything else is chained through an
//! opaque [`ComposedTransform`].

use std::fmt;

use nalgebra::Matrix2;

use crate::constants::DERIVATIVE_STEP;
use crate::starcal_errors::StarcalError;
use crate::stars::Point;

pub mod linear;
pub mod polynomial;
pub mod tangent;

pub use linear::LinearTransform;
pub use polynomial::PolyTransform;
pub use tangent::TanProjection;

/// Capability set of a 2-D transform.
///
/// Parameterless transforms keep the `npar`/`offset_params`/
/// `param_derivatives` defaults. `jacobian` has a finite-difference default
/// so that new variants only need `apply`; cheap analytical overrides exist
/// for the linear and polynomial variants.
pub trait Transform: fmt::Debug + fmt::Display {
    /// Map a point.
    fn apply(&self, p: &Point) -> Point;

    /// Short kind name used in diagnostics and errors.
    fn kind(&self) -> &'static str;

    /// Number of fittable parameters.
    fn npar(&self) -> usize {
        0
    }

    /// Add `delta` (length `npar`) to the parameters, in place.
    fn offset_params(&mut self, delta: &[f64]) {
        debug_assert!(delta.is_empty(), "transform has no parameters");
    }

    /// Derivatives of the output with respect to each parameter at `p`.
    ///
    /// Fills `dx[k]` = ∂out.x/∂param_k and `dy[k]` = ∂out.y/∂param_k; both
    /// slices have length `npar`.
    fn param_derivatives(&self, p: &Point, dx: &mut [f64], dy: &mut [f64]) {
        let _ = (p, dx, dy);
    }

    /// Derivatives of the output with respect to the input, as a 2×2 matrix
    /// (rows: out.x, out.y; columns: in.x, in.y).
    fn jacobian(&self, p: &Point) -> Matrix2<f64> {
        let step = DERIVATIVE_STEP;
        let px = self.apply(&Point::new(p.x + step, p.y));
        let mx = self.apply(&Point::new(p.x - step, p.y));
        let py = self.apply(&Point::new(p.x, p.y + step));
        let my = self.apply(&Point::new(p.x, p.y - step));
        Matrix2::new(
            (px.x - mx.x) / (2.0 * step),
            (py.x - my.x) / (2.0 * step),
            (px.y - mx.y) / (2.0 * step),
            (py.y - my.y) / (2.0 * step),
        )
    }

    /// Analytical inverse, when one exists.
    fn inverted(&self) -> Result<Box<dyn Transform>, StarcalError> {
        Err(StarcalError::NotInvertible(self.kind()))
    }

    /// Exact linear equivalent, when the transform is (or reduces to) one.
    fn as_linear(&self) -> Option<LinearTransform> {
        None
    }

    fn clone_box(&self) -> Box<dyn Transform>;
}

impl Clone for Box<dyn Transform> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// The identity map.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformIdentity;

impl Transform for TransformIdentity {
    fn apply(&self, p: &Point) -> Point {
        *p
    }

    fn kind(&self) -> &'static str {
        "identity"
    }

    fn jacobian(&self, _p: &Point) -> Matrix2<f64> {
        Matrix2::identity()
    }

    fn inverted(&self) -> Result<Box<dyn Transform>, StarcalError> {
        Ok(Box::new(TransformIdentity))
    }

    fn as_linear(&self) -> Option<LinearTransform> {
        Some(LinearTransform::identity())
    }

    fn clone_box(&self) -> Box<dyn Transform> {
        Box::new(*self)
    }
}

impl fmt::Display for TransformIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "identity")
    }
}

/// Two transforms applied in sequence (`first`, then `second`).
#[derive(Debug, Clone)]
pub struct ComposedTransform {
    first: Box<dyn Transform>,
    second: Box<dyn Transform>,
}

impl Transform for ComposedTransform {
    fn apply(&self, p: &Point) -> Point {
        self.second.apply(&self.first.apply(p))
    }

    fn kind(&self) -> &'static str {
        "composed"
    }

    fn jacobian(&self, p: &Point) -> Matrix2<f64> {
        let mid = self.first.apply(p);
        self.second.jacobian(&mid) * self.first.jacobian(p)
    }

    fn clone_box(&self) -> Box<dyn Transform> {
        Box::new(self.clone())
    }
}

impl fmt::Display for ComposedTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}) then ({})", self.first, self.second)
    }
}

/// Compose two transforms: the result applies `first`, then `second`.
///
/// Identities collapse to a clone of the other operand, and linear×linear
/// composes exactly; every other pairing is chained through an opaque
/// [`ComposedTransform`].
pub fn compose(first: &dyn Transform, second: &dyn Transform) -> Box<dyn Transform> {
    let lin1 = first.as_linear();
    let lin2 = second.as_linear();
    if lin1.as_ref().is_some_and(LinearTransform::is_identity) {
        return second.clone_box();
    }
    if lin2.as_ref().is_some_and(LinearTransform::is_identity) {
        return first.clone_box();
    }
    if let (Some(l1), Some(l2)) = (lin1, lin2) {
        return Box::new(l2.times(&l1));
    }
    Box::new(ComposedTransform {
        first: first.clone_box(),
        second: second.clone_box(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_composition_law() {
        let t = LinearTransform::similarity(3.0, -2.0, 0.3, 1.1, false);
        let id = TransformIdentity;
        let left = compose(&id, &t);
        let right = compose(&t, &id);
        let p = Point::new(17.0, -5.0);
        assert_eq!(left.apply(&p), t.apply(&p));
        assert_eq!(right.apply(&p), t.apply(&p));
    }

    /// A transform that only implements `apply`, to exercise the
    /// finite-difference jacobian default.
    #[derive(Debug, Clone)]
    struct Opaque(LinearTransform);

    impl fmt::Display for Opaque {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "opaque")
        }
    }

    impl Transform for Opaque {
        fn apply(&self, p: &Point) -> Point {
            self.0.apply(p)
        }
        fn kind(&self) -> &'static str {
            "opaque"
        }
        fn clone_box(&self) -> Box<dyn Transform> {
            Box::new(self.clone())
        }
    }

    #[test]
    fn test_numeric_jacobian_matches_linear() {
        let t = LinearTransform::similarity(1.0, 2.0, 0.5, 1.3, false);
        let opaque = Opaque(t);
        let p = Point::new(4.0, 9.0);
        let exact = t.jacobian(&p);
        let numeric = opaque.jacobian(&p);
        for i in 0..2 {
            for j in 0..2 {
                assert!((exact[(i, j)] - numeric[(i, j)]).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_generic_composition_chains() {
        let mut poly = PolyTransform::identity_of_order(2);
        poly.offset_params(&{
            let mut d = vec![0.0; poly.npar()];
            d[3] = 1e-4; // x² in the x component
            d
        });
        let lin = LinearTransform::shift(5.0, -3.0);
        let chained = compose(&lin, &poly);
        let p = Point::new(10.0, 20.0);
        assert_eq!(chained.apply(&p), poly.apply(&lin.apply(&p)));

        // chain-rule jacobian
        let mid = lin.apply(&p);
        let expected = poly.jacobian(&mid) * lin.jacobian(&p);
        let got = chained.jacobian(&p);
        for i in 0..2 {
            for j in 0..2 {
                assert!((got[(i, j)] - expected[(i, j)]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_not_invertible_error() {
        let t = Opaque(LinearTransform::identity());
        assert!(matches!(
            t.inverted(),
            Err(StarcalError::NotInvertible("opaque"))
        ));
    }
}
