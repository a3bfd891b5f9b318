//! The ensemble being calibrated: CCD images, measured stars, fitted stars,
//! reference anchors, and the cross-links between them.

use tracing::{debug, info};

use crate::ccd_image::{CcdImage, CcdImageList};
use crate::matching::FastFinder;
use crate::starcal_errors::StarcalError;
use crate::stars::{BaseStar, BaseStarList, FittedStar, FittedStarList, RefStarList};

/// The whole fit input/output bundle.
///
/// Star links are arena indices: measured stars name their fitted star by
/// position in `fitted_stars`, fitted stars name their anchor by position in
/// `ref_stars`. Nothing is ever removed during a fit; outliers are
/// invalidated or unlinked in place, so indices stay stable.
///
/// Invariant: every valid measured star points to exactly one fitted star,
/// and a fitted star's `measurement_count` equals the number of valid
/// children pointing at it ([`check_integrity`](Self::check_integrity)).
#[derive(Debug, Clone, Default)]
pub struct Associations {
    pub ccd_images: CcdImageList,
    pub fitted_stars: FittedStarList,
    pub ref_stars: RefStarList,
}

impl Associations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ccd_image(&mut self, ccd_image: CcdImage) -> usize {
        self.ccd_images.push(ccd_image);
        self.ccd_images.len() - 1
    }

    pub fn n_ccd_images(&self) -> usize {
        self.ccd_images.len()
    }

    pub fn n_fitted_stars(&self) -> usize {
        self.fitted_stars.len()
    }

    /// Total number of currently-valid measurements across all images.
    pub fn n_valid_measurements(&self) -> usize {
        self.ccd_images
            .iter()
            .map(|ccd| ccd.valid_measurements().count())
            .sum()
    }

    /// Build the fitted-star list by cross-matching the measured catalogues.
    ///
    /// Every CCD's measured stars are projected into the common frame
    /// through the image's `init_transform` and matched against the current
    /// fitted stars within `match_cut`; unmatched measurements seed new
    /// fitted stars. Positions of matched fitted stars are not moved (the
    /// fit does that); fluxes and counts are refreshed at the end.
    pub fn associate_catalogs(&mut self, match_cut: f64) {
        for ccd_idx in 0..self.ccd_images.len() {
            // snapshot of the current fitted positions for this image pass
            let fitted_snapshot: BaseStarList = self
                .fitted_stars
                .iter()
                .map(|fs| BaseStar {
                    pos: fs.pos,
                    flux: fs.flux,
                })
                .collect();
            let finder = FastFinder::new(&fitted_snapshot);

            let ccd = &self.ccd_images[ccd_idx];
            let transform = ccd.init_transform.clone();
            let mut links: Vec<(usize, Option<usize>)> = Vec::with_capacity(ccd.measured_stars.len());
            for (ms_idx, ms) in ccd.measured_stars.iter().enumerate() {
                if !ms.valid {
                    continue;
                }
                let common = transform.apply(ms.pos());
                links.push((ms_idx, finder.find_closest(&common, match_cut, None)));
            }

            let mut created = 0usize;
            for (ms_idx, link) in links {
                let fitted_idx = match link {
                    Some(idx) => idx,
                    None => {
                        let ms = &self.ccd_images[ccd_idx].measured_stars[ms_idx];
                        let common = transform.apply(ms.pos());
                        self.fitted_stars.push(FittedStar::new(common, ms.flux()));
                        created += 1;
                        self.fitted_stars.len() - 1
                    }
                };
                self.ccd_images[ccd_idx].measured_stars[ms_idx].fitted_star = Some(fitted_idx);
            }
            debug!(ccd = %self.ccd_images[ccd_idx].name, created, "catalog association pass");
        }
        self.recount_measurements();
        info!(
            n_fitted = self.fitted_stars.len(),
            n_meas = self.n_valid_measurements(),
            "catalogs associated"
        );
    }

    /// Load an external reference catalogue and link each fitted star to
    /// its closest anchor within `match_cut` (one link per anchor at most;
    /// the closest fitted star wins).
    pub fn collect_ref_stars(&mut self, ref_stars: RefStarList, match_cut: f64) {
        self.ref_stars = ref_stars;
        for fs in &mut self.fitted_stars {
            fs.ref_star = None;
        }
        let fitted_snapshot: BaseStarList = self
            .fitted_stars
            .iter()
            .map(|fs| BaseStar {
                pos: fs.pos,
                flux: fs.flux,
            })
            .collect();
        let finder = FastFinder::new(&fitted_snapshot);

        let mut linked = 0usize;
        for (ref_idx, rs) in self.ref_stars.iter().enumerate() {
            if let Some(fitted_idx) = finder.find_closest(&rs.pos, match_cut, None) {
                let fs = &mut self.fitted_stars[fitted_idx];
                // keep the closer anchor when two claim the same star
                let replace = match fs.ref_star {
                    None => true,
                    Some(prev) => {
                        rs.pos.dist2(&fs.pos) < self.ref_stars[prev].pos.dist2(&fs.pos)
                    }
                };
                if replace {
                    if fs.ref_star.is_none() {
                        linked += 1;
                    }
                    fs.ref_star = Some(ref_idx);
                }
            }
        }
        info!(linked, n_ref = self.ref_stars.len(), "reference stars collected");
    }

    /// Recompute every fitted star's `measurement_count` from the valid
    /// children.
    pub fn recount_measurements(&mut self) {
        for fs in &mut self.fitted_stars {
            fs.measurement_count = 0;
        }
        for ccd in &self.ccd_images {
            for (_, ms) in ccd.valid_measurements() {
                if let Some(idx) = ms.fitted_star {
                    self.fitted_stars[idx].measurement_count += 1;
                }
            }
        }
    }

    /// Verify the child-count invariant, naming the first offender.
    pub fn check_integrity(&self) -> Result<(), StarcalError> {
        let mut counts = vec![0usize; self.fitted_stars.len()];
        for (ccd_idx, ccd) in self.ccd_images.iter().enumerate() {
            for (ms_idx, ms) in ccd.valid_measurements() {
                match ms.fitted_star {
                    Some(idx) if idx < self.fitted_stars.len() => counts[idx] += 1,
                    _ => {
                        return Err(StarcalError::DegenerateInput(format!(
                            "valid measured star {ms_idx} of image {ccd_idx} has no fitted star"
                        )))
                    }
                }
            }
        }
        for (idx, (fs, count)) in self.fitted_stars.iter().zip(&counts).enumerate() {
            if fs.measurement_count != *count {
                return Err(StarcalError::DegenerateInput(format!(
                    "fitted star {idx} records {} measurements but has {count} valid children",
                    fs.measurement_count
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::stars::{MeasuredStar, Point, RefStar};
    use crate::transforms::LinearTransform;

    use super::*;

    fn measured(x: f64, y: f64, flux: f64) -> MeasuredStar {
        MeasuredStar::new(BaseStar::new(x, y, flux), 0.1, 0.1, 0.01)
    }

    #[test]
    fn test_associate_two_images() {
        let stars = [(100.0, 100.0, 50.0), (300.0, 200.0, 40.0), (700.0, 650.0, 30.0)];
        let mut assoc = Associations::new();
        // first image is the common frame; second is shifted by (5, -3)
        let list1 = stars.iter().map(|&(x, y, f)| measured(x, y, f)).collect();
        assoc.add_ccd_image(CcdImage::new("img-1", list1));
        let list2 = stars
            .iter()
            .map(|&(x, y, f)| measured(x + 5.0, y - 3.0, f))
            .collect();
        assoc.add_ccd_image(CcdImage::with_transform(
            "img-2",
            list2,
            Box::new(LinearTransform::shift(-5.0, 3.0)),
        ));

        assoc.associate_catalogs(2.0);
        assert_eq!(assoc.n_fitted_stars(), 3);
        for fs in &assoc.fitted_stars {
            assert_eq!(fs.measurement_count, 2);
        }
        assoc.check_integrity().unwrap();
    }

    #[test]
    fn test_collect_ref_stars_unique_links() {
        let mut assoc = Associations::new();
        assoc
            .fitted_stars
            .push(FittedStar::new(Point::new(10.0, 10.0), 5.0));
        assoc
            .fitted_stars
            .push(FittedStar::new(Point::new(500.0, 500.0), 5.0));
        let refs = vec![
            RefStar::new(Point::new(10.4, 10.0), 5.0, 0.05, 0.05, 0.01),
            RefStar::new(Point::new(10.1, 10.0), 5.0, 0.05, 0.05, 0.01),
        ];
        assoc.collect_ref_stars(refs, 1.0);
        // the closer anchor wins; the far fitted star stays unlinked
        assert_eq!(assoc.fitted_stars[0].ref_star, Some(1));
        assert_eq!(assoc.fitted_stars[1].ref_star, None);
    }

    #[test]
    fn test_integrity_detects_bad_count() {
        let mut assoc = Associations::new();
        let mut ms = measured(0.0, 0.0, 1.0);
        ms.fitted_star = Some(0);
        assoc.add_ccd_image(CcdImage::new("img", vec![ms]));
        assoc.fitted_stars.push(FittedStar::new(Point::new(0.0, 0.0), 1.0));
        // count not refreshed: invariant broken
        assert!(assoc.check_integrity().is_err());
        assoc.recount_measurements();
        assoc.check_integrity().unwrap();
    }
}
