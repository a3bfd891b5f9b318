//! The Gauss-Newton driver: normal-equation assembly, Cholesky solve,
//! robust outlier rejection with incremental factor downdates.

use std::fs::File;
use std::io::{BufWriter, Write};

use camino::{Utf8Path, Utf8PathBuf};
use nalgebra::DVector;
use tracing::{debug, error, info, warn};

use crate::associations::Associations;
use crate::starcal_errors::StarcalError;

use super::chi2::{Chi2List, Chi2Source, Chi2Statistic};
use super::hessian::{build_hessian, HessianFactor};
use super::model::{FitModel, WhatToFit};
use super::triplet_list::TripletList;

/// Outcome of one [`Fitter::minimize`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinimizeResult {
    /// No outlier left above the cut (or rejection was disabled).
    Converged,
    /// The solve made chi2 worse after at least one outlier pass;
    /// parameters stay in their most recent state.
    Chi2Increased,
    /// Factorization failure or cancellation; parameters untouched by the
    /// aborted iteration.
    Failed,
}

/// A measured-star outlier, identified by `(ccd_index, star_index)`.
pub type MeasOutlier = (usize, usize);

/// Joint least-squares driver over an [`Associations`] bundle and a model.
///
/// The fitter exclusively mutates the associations graph during
/// [`minimize`](Self::minimize) (validity flags, measurement counts,
/// reference unlinking); outside a minimize call the graph is read-only.
pub struct Fitter<'a, M: FitModel> {
    associations: &'a mut Associations,
    model: M,
    what_to_fit: WhatToFit,
    n_par_model: usize,
    n_par_tot: usize,
    last_n_triplets: usize,
}

impl<'a, M: FitModel> Fitter<'a, M> {
    pub fn new(associations: &'a mut Associations, model: M) -> Self {
        Fitter {
            associations,
            model,
            what_to_fit: WhatToFit::default(),
            n_par_model: 0,
            n_par_tot: 0,
            last_n_triplets: 0,
        }
    }

    pub fn associations(&self) -> &Associations {
        self.associations
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn n_par_tot(&self) -> usize {
        self.n_par_tot
    }

    /// Interpret the `what_to_fit` tag string and hand out contiguous
    /// parameter ranges: the model block first, then star positions
    /// (2 per star), then star fluxes (1 per star). Only stars holding at
    /// least one valid measurement or a reference link get indices.
    pub fn assign_indices(&mut self, what_to_fit: &str) -> Result<(), StarcalError> {
        let what: WhatToFit = what_to_fit.parse()?;
        self.what_to_fit = what;
        self.n_par_model = self.model.assign_indices(&what, 0);

        let indexed: Vec<usize> = self
            .associations
            .fitted_stars
            .iter()
            .enumerate()
            .filter(|(_, fs)| fs.measurement_count > 0 || fs.ref_star.is_some())
            .map(|(idx, _)| idx)
            .collect();

        let positions_base = self.n_par_model;
        let fluxes_base = positions_base + if what.positions { 2 * indexed.len() } else { 0 };
        for fs in &mut self.associations.fitted_stars {
            fs.index_in_matrix = None;
            fs.flux_index_in_matrix = None;
        }
        for (k, &idx) in indexed.iter().enumerate() {
            let fs = &mut self.associations.fitted_stars[idx];
            if what.positions {
                fs.index_in_matrix = Some(positions_base + 2 * k);
            }
            if what.fluxes {
                fs.flux_index_in_matrix = Some(fluxes_base + k);
            }
        }

        self.n_par_tot = fluxes_base + if what.fluxes { indexed.len() } else { 0 };
        if self.n_par_tot == 0 {
            return Err(StarcalError::DegenerateInput(format!(
                "'{what_to_fit}' enables no parameter"
            )));
        }
        debug!(
            n_par_model = self.n_par_model,
            n_par_tot = self.n_par_tot,
            n_indexed_stars = indexed.len(),
            "indices assigned"
        );
        Ok(())
    }

    /// Apply a parameter update in place: the model first, then the star
    /// blocks.
    pub fn offset_params(&mut self, delta: &DVector<f64>) {
        debug_assert_eq!(delta.len(), self.n_par_tot);
        self.model.offset_params(delta);
        for fs in &mut self.associations.fitted_stars {
            if let Some(base) = fs.index_in_matrix {
                fs.pos.x += delta[base];
                fs.pos.y += delta[base + 1];
            }
            if let Some(flux_idx) = fs.flux_index_in_matrix {
                fs.flux += delta[flux_idx];
            }
        }
    }

    /// Accumulate chi2 over all images and reference terms;
    /// `ndof = ΣContribs − nParTot`.
    pub fn compute_chi2(&self) -> Chi2Statistic {
        let mut chi2 = Chi2Statistic::new();
        for ccd in 0..self.associations.ccd_images.len() {
            self.model
                .accumulate_stat_image(self.associations, ccd, &mut chi2);
        }
        self.model.accumulate_stat_ref(self.associations, &mut chi2);
        chi2.ndof -= self.n_par_tot as i64;
        chi2
    }

    /// Fill the Jacobian triplets and the right-hand side `−Jᵀ r` over all
    /// images and reference terms.
    pub fn least_square_derivatives(&self, triplets: &mut TripletList, grad: &mut DVector<f64>) {
        for ccd in 0..self.associations.ccd_images.len() {
            self.model
                .derivatives_measurement(self.associations, ccd, triplets, grad, None);
        }
        let with_ref: Vec<usize> = self
            .associations
            .fitted_stars
            .iter()
            .enumerate()
            .filter(|(_, fs)| fs.ref_star.is_some())
            .map(|(idx, _)| idx)
            .collect();
        self.model
            .derivatives_reference(self.associations, &with_ref, triplets, grad);
    }

    /// Pick the statistically significant chi2 contributions while
    /// preserving identifiability of every parameter.
    ///
    /// Contributions above `mean + n_sigma_cut · sigma` are scanned from
    /// the strongest down; a contribution is kept (not discarded) when a
    /// stronger outlier already claimed one of its parameters, since that
    /// stronger outlier may be the cause of the large chi2 at hand. At most
    /// one discarded contribution can touch any given parameter per call.
    pub fn find_outliers(&self, n_sigma_cut: f64) -> (Vec<MeasOutlier>, Vec<usize>) {
        let mut chi2_list =
            Chi2List::with_capacity(self.associations.n_valid_measurements() + 16);
        for ccd in 0..self.associations.ccd_images.len() {
            self.model
                .accumulate_stat_image(self.associations, ccd, &mut chi2_list);
        }
        self.model
            .accumulate_stat_ref(self.associations, &mut chi2_list);
        if chi2_list.is_empty() {
            return (Vec::new(), Vec::new());
        }

        chi2_list.sort();
        let (mean, sigma) = chi2_list.average_and_sigma();
        let median = chi2_list.median();
        debug!(mean, median, sigma, "outlier scan chi2 statistics");
        let cut = mean + n_sigma_cut * sigma;

        // At most one discarded contribution per parameter and per pass.
        let mut affected_params = vec![0u32; self.n_par_tot];
        let mut meas_outliers: Vec<MeasOutlier> = Vec::new();
        let mut ref_outliers: Vec<usize> = Vec::new();

        for entry in chi2_list.entries().iter().rev() {
            if entry.chi2 < cut {
                break; // the list is sorted
            }
            let indices = match entry.source {
                Chi2Source::Reference { fitted } => {
                    let fs = &self.associations.fitted_stars[fitted];
                    if fs.measurement_count == 0 {
                        warn!(fitted, "reference outlier on a fitted star with no measurement, skipping");
                        continue;
                    }
                    // one index is enough: the whole star block goes away
                    // with the star
                    let Some(first) = fs.index_in_matrix.or(fs.flux_index_in_matrix) else {
                        continue;
                    };
                    vec![first].into()
                }
                Chi2Source::Measurement { ccd, star } => {
                    let ms = &self.associations.ccd_images[ccd].measured_stars[star];
                    let Some(fitted) = ms.fitted_star else {
                        continue;
                    };
                    let fs = &self.associations.fitted_stars[fitted];
                    if fs.measurement_count == 1 && fs.ref_star.is_none() {
                        warn!(
                            ccd,
                            star, "outlier is the only constraint of its fitted star, not removing it"
                        );
                        continue;
                    }
                    self.model.indices_of_measured_star(self.associations, ccd, star)
                }
            };

            // a stronger outlier already claimed one of these parameters
            if indices.iter().any(|&i| affected_params[i] != 0) {
                continue;
            }
            match entry.source {
                Chi2Source::Measurement { ccd, star } => meas_outliers.push((ccd, star)),
                Chi2Source::Reference { fitted } => ref_outliers.push(fitted),
            }
            for &i in &indices {
                affected_params[i] += 1;
            }
        }
        info!(
            n_meas = meas_outliers.len(),
            n_ref = ref_outliers.len(),
            "findOutliers"
        );
        (meas_outliers, ref_outliers)
    }

    /// Jacobian and gradient contributions of the given outliers only.
    fn outliers_contributions(
        &self,
        meas_outliers: &[MeasOutlier],
        ref_outliers: &[usize],
        triplets: &mut TripletList,
        grad: &mut DVector<f64>,
    ) {
        for &(ccd, star) in meas_outliers {
            self.model.derivatives_measurement(
                self.associations,
                ccd,
                triplets,
                grad,
                Some(&[star]),
            );
        }
        self.model
            .derivatives_reference(self.associations, ref_outliers, triplets, grad);
    }

    fn remove_meas_outliers(&mut self, outliers: &[MeasOutlier]) {
        for &(ccd, star) in outliers {
            let ms = &mut self.associations.ccd_images[ccd].measured_stars[star];
            ms.valid = false;
            let fitted = ms.fitted_star.expect("outlier without fitted star");
            self.associations.fitted_stars[fitted].measurement_count -= 1;
        }
    }

    fn remove_ref_outliers(&mut self, outliers: &[usize]) {
        for &fitted in outliers {
            self.associations.fitted_stars[fitted].ref_star = None;
        }
    }

    /// Gauss-Newton loop with robust rejection. See the module docs for the
    /// exact sequencing; `n_sigma_cut == 0` disables rejection and
    /// `do_rank_update` selects the incremental factor downdate over a full
    /// rebuild after each rejection pass.
    pub fn minimize(
        &mut self,
        what_to_fit: &str,
        n_sigma_cut: f64,
        do_rank_update: bool,
    ) -> Result<MinimizeResult, StarcalError> {
        self.minimize_with_cancel(what_to_fit, n_sigma_cut, do_rank_update, || false)
    }

    /// Same as [`minimize`](Self::minimize) with a cooperative cancellation
    /// hook, polled at the start of every iteration. Cancellation surfaces
    /// as [`MinimizeResult::Failed`] without applying the pending step.
    pub fn minimize_with_cancel<F>(
        &mut self,
        what_to_fit: &str,
        n_sigma_cut: f64,
        do_rank_update: bool,
        mut should_cancel: F,
    ) -> Result<MinimizeResult, StarcalError>
    where
        F: FnMut() -> bool,
    {
        self.assign_indices(what_to_fit)?;
        let mut return_code = MinimizeResult::Converged;

        let expected = if self.last_n_triplets > 0 {
            self.last_n_triplets
        } else {
            1_000_000
        };
        let mut triplets = TripletList::with_capacity(expected);
        let mut grad = DVector::<f64>::zeros(self.n_par_tot);
        self.least_square_derivatives(&mut triplets, &mut grad);
        self.last_n_triplets = triplets.len();
        debug!(n_triplets = triplets.len(), "end of triplet filling");

        debug!(dim = self.n_par_tot, "starting factorization");
        let mut factor = match HessianFactor::factor(build_hessian(self.n_par_tot, &triplets)) {
            Ok(f) => f,
            Err(_) => {
                error!("minimize: factorization failed");
                return Ok(MinimizeResult::Failed);
            }
        };

        let mut total_meas_outliers = 0usize;
        let mut total_ref_outliers = 0usize;
        let mut old_chi2 = self.compute_chi2().chi2;

        loop {
            if should_cancel() {
                info!("minimize cancelled");
                return Ok(MinimizeResult::Failed);
            }
            let delta = factor.solve(&grad);
            self.offset_params(&delta);
            let current_chi2 = self.compute_chi2();
            debug!(%current_chi2);
            if current_chi2.chi2 > old_chi2 && total_meas_outliers + total_ref_outliers != 0 {
                warn!("chi2 went up, skipping outlier rejection loop");
                return_code = MinimizeResult::Chi2Increased;
                break;
            }
            old_chi2 = current_chi2.chi2;

            if n_sigma_cut == 0.0 {
                break; // no rejection step to perform
            }
            let (meas_outliers, ref_outliers) = self.find_outliers(n_sigma_cut);
            total_meas_outliers += meas_outliers.len();
            total_ref_outliers += ref_outliers.len();
            if meas_outliers.is_empty() && ref_outliers.is_empty() {
                break;
            }

            // contributions must be computed before invalidation
            let mut outlier_triplets = TripletList::new();
            grad.fill(0.0);
            self.outliers_contributions(&meas_outliers, &ref_outliers, &mut outlier_triplets, &mut grad);
            self.remove_meas_outliers(&meas_outliers);
            self.remove_ref_outliers(&ref_outliers);

            if do_rank_update {
                if factor.downdate(&outlier_triplets).is_err() {
                    error!("minimize: downdate left the factor indefinite");
                    return Ok(MinimizeResult::Failed);
                }
                // the outliers' gradient contribution is the opposite of the
                // remaining terms' contribution: they add up to zero
                grad *= -1.0;
            } else {
                let mut next_triplets = TripletList::with_capacity(self.last_n_triplets);
                grad.fill(0.0);
                self.least_square_derivatives(&mut next_triplets, &mut grad);
                self.last_n_triplets = next_triplets.len();
                debug!(n_triplets = next_triplets.len(), "triplets recomputed");
                factor = match HessianFactor::factor(build_hessian(self.n_par_tot, &next_triplets))
                {
                    Ok(f) => f,
                    Err(_) => {
                        error!("minimize: factorization failed");
                        return Ok(MinimizeResult::Failed);
                    }
                };
            }
        }

        if n_sigma_cut != 0.0 {
            info!(
                meas = total_meas_outliers,
                reference = total_ref_outliers,
                total = total_meas_outliers + total_ref_outliers,
                "outliers removed"
            );
        }
        Ok(return_code)
    }

    /// Dump every current chi2 contribution to two sibling text files
    /// derived from `base_name` by inserting `-meas` and `-ref` right
    /// before the final `.` of the file name (at its end when there is
    /// none). Rows are `id x y residual chi2 ndof`, whitespace separated.
    pub fn save_chi2_contributions(&self, base_name: &Utf8Path) -> Result<(), StarcalError> {
        let mut meas_list = Chi2List::new();
        for ccd in 0..self.associations.ccd_images.len() {
            self.model
                .accumulate_stat_image(self.associations, ccd, &mut meas_list);
        }
        self.write_contributions(&tweak_path(base_name, "-meas"), &meas_list)?;

        let mut ref_list = Chi2List::new();
        self.model.accumulate_stat_ref(self.associations, &mut ref_list);
        self.write_contributions(&tweak_path(base_name, "-ref"), &ref_list)?;
        Ok(())
    }

    fn write_contributions(&self, path: &Utf8Path, list: &Chi2List) -> Result<(), StarcalError> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "# id x y residual chi2 ndof")?;
        for entry in list.entries() {
            let (id, pos) = match entry.source {
                Chi2Source::Measurement { ccd, star } => (
                    format!("{ccd}:{star}"),
                    *self.associations.ccd_images[ccd].measured_stars[star].pos(),
                ),
                Chi2Source::Reference { fitted } => {
                    (format!("{fitted}"), self.associations.fitted_stars[fitted].pos)
                }
            };
            writeln!(
                out,
                "{} {} {} {} {} {}",
                id,
                pos.x,
                pos.y,
                entry.chi2.sqrt(),
                entry.chi2,
                entry.ndof
            )?;
        }
        out.flush()?;
        Ok(())
    }
}

/// Insert `tag` just before the final `.` of the file name (or at the end
/// of the name when there is none).
fn tweak_path(base_name: &Utf8Path, tag: &str) -> Utf8PathBuf {
    let name = base_name.file_name().unwrap_or("chi2");
    let tweaked = match name.rfind('.') {
        Some(dot) => format!("{}{}{}", &name[..dot], tag, &name[dot..]),
        None => format!("{name}{tag}"),
    };
    match base_name.parent() {
        Some(parent) => parent.join(tweaked),
        None => Utf8PathBuf::from(tweaked),
    }
}
