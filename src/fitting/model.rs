//! The capability interface any astrometric or photometric model
//! implements so the fitter stays model-agnostic.

use std::str::FromStr;

use nalgebra::DVector;
use smallvec::SmallVec;

use crate::associations::Associations;
use crate::starcal_errors::StarcalError;

use super::chi2::Chi2Accumulator;
use super::triplet_list::TripletList;

/// Which parameter subsets the next fit solves for.
///
/// Parsed from a whitespace-separated tag string: `"Model"`, `"Distortions"`
/// (a model-interpreted refinement of `"Model"`), `"Positions"`, `"Fluxes"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WhatToFit {
    pub model: bool,
    pub distortions: bool,
    pub positions: bool,
    pub fluxes: bool,
}

impl WhatToFit {
    pub fn fits_star_parameters(&self) -> bool {
        self.positions || self.fluxes
    }

    /// Parameter slots per fitted star under this selection.
    pub fn star_block_size(&self) -> usize {
        (if self.positions { 2 } else { 0 }) + usize::from(self.fluxes)
    }
}

impl FromStr for WhatToFit {
    type Err = StarcalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut what = WhatToFit::default();
        for token in s.split_whitespace() {
            match token {
                "Model" => what.model = true,
                "Distortions" => what.distortions = true,
                "Positions" => what.positions = true,
                "Fluxes" => what.fluxes = true,
                other => return Err(StarcalError::InvalidWhatToFit(other.to_string())),
            }
        }
        Ok(what)
    }
}

/// List of parameter indices one measurement term depends on; small enough
/// to live on the stack for every model in practice.
pub type ParamIndices = SmallVec<[usize; 8]>;

/// Capability set of a fit model.
///
/// The fitter holds no model-specific knowledge beyond these operations.
/// A model owns the per-image mapping parameters; the fitted-star blocks
/// are assigned and updated by the fitter itself, and are visible to the
/// model through each star's `index_in_matrix`.
///
/// Sign conventions: `derivatives_*` fill whitened Jacobian columns
/// (one column per residual component, rows are parameter indices, claimed
/// through the triplet watermark) and add `−Jᵀ r` into `grad`, so that
/// solving `H δ = grad` yields the Gauss-Newton step to *add* to the
/// parameters.
pub trait FitModel {
    /// Total number of parameters the model could expose.
    fn parameter_count(&self) -> usize;

    /// Record which subsets vary, claim `[base_index, base_index + used)`
    /// in the parameter vector, and return `used`.
    fn assign_indices(&mut self, what_to_fit: &WhatToFit, base_index: usize) -> usize;

    /// Apply the model's share of the full update vector.
    fn offset_params(&mut self, delta: &DVector<f64>);

    /// Chi2 contributions of every valid measurement of one image.
    fn accumulate_stat_image(
        &self,
        associations: &Associations,
        ccd: usize,
        accum: &mut dyn Chi2Accumulator,
    );

    /// Chi2 contributions of every fitted star holding a reference anchor.
    fn accumulate_stat_ref(&self, associations: &Associations, accum: &mut dyn Chi2Accumulator);

    /// Parameter indices the given measurement term depends on (model and
    /// star blocks alike).
    fn indices_of_measured_star(
        &self,
        associations: &Associations,
        ccd: usize,
        star: usize,
    ) -> ParamIndices;

    /// Jacobian columns and gradient contributions of one image's
    /// measurements; `restrict` limits the work to the named stars.
    fn derivatives_measurement(
        &self,
        associations: &Associations,
        ccd: usize,
        triplets: &mut TripletList,
        grad: &mut DVector<f64>,
        restrict: Option<&[usize]>,
    );

    /// Jacobian columns and gradient contributions of the reference terms
    /// of the named fitted stars.
    fn derivatives_reference(
        &self,
        associations: &Associations,
        fitted: &[usize],
        triplets: &mut TripletList,
        grad: &mut DVector<f64>,
    );
}
