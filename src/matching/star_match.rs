//! Pairs of matched stars and the transform fitted over them.

use std::collections::HashSet;

use ahash::RandomState;
use tracing::debug;

use crate::constants::{REFINE_CHI2_FLOOR, REFINE_IMPROVEMENT};
use crate::starcal_errors::StarcalError;
use crate::stars::Point;
use crate::transforms::{PolyTransform, Transform, TransformIdentity};

/// One matched pair: indices into the two source lists plus the raw
/// positions. `distance` is the residual `|t(point1) − point2|` under the
/// list's current transform.
#[derive(Debug, Clone, Copy)]
pub struct StarMatch {
    pub star1: usize,
    pub star2: usize,
    pub point1: Point,
    pub point2: Point,
    pub distance: f64,
}

impl StarMatch {
    pub fn new(star1: usize, star2: usize, point1: Point, point2: Point) -> Self {
        StarMatch {
            star1,
            star2,
            point1,
            point2,
            distance: 0.0,
        }
    }
}

/// An ordered sequence of matches with the transform currently fitted to
/// them.
#[derive(Debug, Clone)]
pub struct StarMatchList {
    matches: Vec<StarMatch>,
    transform: Box<dyn Transform>,
    /// Summed squared residual of the last fit or residual update.
    chi2: f64,
}

impl Default for StarMatchList {
    fn default() -> Self {
        Self::new()
    }
}

impl StarMatchList {
    pub fn new() -> Self {
        StarMatchList {
            matches: Vec::new(),
            transform: Box::new(TransformIdentity),
            chi2: 0.0,
        }
    }

    pub fn add(&mut self, m: StarMatch) {
        self.matches.push(m);
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn matches(&self) -> &[StarMatch] {
        &self.matches
    }

    pub fn transform(&self) -> &dyn Transform {
        self.transform.as_ref()
    }

    pub fn set_transform(&mut self, t: Box<dyn Transform>) {
        self.transform = t;
    }

    /// Recompute every residual under the current transform and return the
    /// summed chi2.
    pub fn compute_residuals(&mut self) -> f64 {
        let mut chi2 = 0.0;
        for m in &mut self.matches {
            let mapped = self.transform.apply(&m.point1);
            m.distance = mapped.dist(&m.point2);
            chi2 += m.distance * m.distance;
        }
        self.chi2 = chi2;
        chi2
    }

    /// Σ |t(s1) − s2|² under the current transform.
    pub fn chi2(&self) -> f64 {
        self.chi2
    }

    /// Drop duplicate pairs: when the same star appears on either side more
    /// than once, only the pair with the smallest residual under the
    /// current transform survives.
    pub fn remove_ambiguities(&mut self) {
        self.compute_residuals();
        self.matches.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .expect("non-finite residual")
        });
        let mut seen1: HashSet<usize, RandomState> = HashSet::default();
        let mut seen2: HashSet<usize, RandomState> = HashSet::default();
        self.matches
            .retain(|m| seen1.insert(m.star1) && seen2.insert(m.star2));
        self.compute_residuals();
    }

    /// Fit a polynomial transform to the pairs, raising the order from 1 up
    /// to `max_order` while chi2 per degree of freedom keeps improving by at
    /// least [`REFINE_IMPROVEMENT`]; stops early when the fit is already at
    /// machine precision or the next order would be underdetermined.
    /// Returns the final chi2.
    pub fn refine_transform(&mut self, max_order: usize) -> Result<f64, StarcalError> {
        if self.matches.is_empty() {
            return Err(StarcalError::DegenerateInput(
                "cannot refine a transform over an empty match list".into(),
            ));
        }
        let pairs: Vec<(Point, Point)> =
            self.matches.iter().map(|m| (m.point1, m.point2)).collect();
        let per_dof = |chi2: f64, npar: usize| {
            let ndof = (2 * pairs.len()).saturating_sub(npar);
            if ndof == 0 {
                f64::INFINITY
            } else {
                chi2 / ndof as f64
            }
        };

        let (mut best, best_chi2) = PolyTransform::fit(&pairs, 1)?;
        let mut best_per_dof = per_dof(best_chi2, best.npar());
        for order in 2..=max_order {
            if best_per_dof < REFINE_CHI2_FLOOR {
                break;
            }
            let (next, next_chi2) = match PolyTransform::fit(&pairs, order) {
                Ok(r) => r,
                // not enough pairs for this order: keep the previous one
                Err(StarcalError::DegenerateInput(_)) => break,
                Err(e) => return Err(e),
            };
            let next_per_dof = per_dof(next_chi2, next.npar());
            if next_per_dof >= best_per_dof * (1.0 - REFINE_IMPROVEMENT) {
                break;
            }
            debug!(order, chi2 = next_chi2, "order raise accepted");
            best = next;
            best_per_dof = next_per_dof;
        }
        self.transform = Box::new(best);
        Ok(self.compute_residuals())
    }
}
