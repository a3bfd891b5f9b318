//! Sky-object parameters being solved for, and external-catalogue anchors.

use std::fmt;

use super::Point;

/// The sky object estimated from one or more measured stars.
///
/// `pos` and `flux` hold the current best estimate in the common frame and
/// are updated in place by the fitter. `index_in_matrix` is the base index
/// of this star's parameter block in the parameter vector, assigned by
/// [`Fitter::assign_indices`](crate::fitting::Fitter::assign_indices);
/// stars that constrain nothing (no valid measurement, no reference link)
/// get `None` and are skipped everywhere.
#[derive(Debug, Clone)]
pub struct FittedStar {
    pub pos: Point,
    pub flux: f64,
    /// Number of currently-valid measured children.
    pub measurement_count: usize,
    /// Index of `pos.x` in the parameter vector (`pos.y` follows) when
    /// positions are being fitted.
    pub index_in_matrix: Option<usize>,
    /// Index of `flux` in the parameter vector when fluxes are being
    /// fitted.
    pub flux_index_in_matrix: Option<usize>,
    /// Index of the linked reference star, if any.
    pub ref_star: Option<usize>,
}

impl FittedStar {
    pub fn new(pos: Point, flux: f64) -> Self {
        FittedStar {
            pos,
            flux,
            measurement_count: 0,
            index_in_matrix: None,
            flux_index_in_matrix: None,
            ref_star: None,
        }
    }
}

impl fmt::Display for FittedStar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} flux={:.3} nMeas={} ref={:?}",
            self.pos, self.flux, self.measurement_count, self.ref_star
        )
    }
}

pub type FittedStarList = Vec<FittedStar>;

/// An external-catalogue anchor with its own uncertainties.
#[derive(Debug, Clone)]
pub struct RefStar {
    pub pos: Point,
    pub flux: f64,
    pub sigma_x: f64,
    pub sigma_y: f64,
    pub sigma_flux: f64,
}

impl RefStar {
    pub fn new(pos: Point, flux: f64, sigma_x: f64, sigma_y: f64, sigma_flux: f64) -> Self {
        RefStar {
            pos,
            flux,
            sigma_x,
            sigma_y,
            sigma_flux,
        }
    }
}

pub type RefStarList = Vec<RefStar>;
