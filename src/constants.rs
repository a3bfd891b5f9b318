//! Shared numeric defaults and tolerances.

/// Default number of x slices used by the spatial index.
pub const DEFAULT_NSLICE: usize = 100;

/// Relative chi2/ndof improvement required to accept a higher polynomial
/// order when refining a match transform.
pub const REFINE_IMPROVEMENT: f64 = 0.05;

/// Shrink factor applied to the match cut at each refinement pass.
pub const REFINE_SHRINK: f64 = 1.5;

/// Chi2 per degree of freedom below which a match-transform fit is treated
/// as exact; raising the polynomial order cannot pay off past this point.
pub const REFINE_CHI2_FLOOR: f64 = 1e-12;

/// Determinant threshold below which a linear transform is considered
/// singular.
pub const SINGULAR_DET: f64 = 1e-20;

/// Step used by the default finite-difference transform Jacobian.
pub const DERIVATIVE_STEP: f64 = 1e-5;
