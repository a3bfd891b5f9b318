//! Shared helpers for the integration tests: synthetic star fields and a
//! concrete pixel-mapping model driving the fitter.

// each test binary only uses a subset of these helpers
#![allow(dead_code)]

use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use starcal::associations::Associations;
use starcal::ccd_image::CcdImage;
use starcal::fitting::{
    Chi2Accumulator, Chi2Source, FitModel, ParamIndices, TripletList, WhatToFit,
};
use starcal::stars::{BaseStar, BaseStarList, FittedStar, MeasuredStar, Point};
use starcal::transforms::{LinearTransform, PolyTransform, Transform};

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Uniform random field with strictly decreasing fluxes so both lists of a
/// matching test truncate to the same stars.
pub fn random_field(n: usize, width: f64, height: f64, rng: &mut StdRng) -> BaseStarList {
    (0..n)
        .map(|k| {
            BaseStar::new(
                rng.random_range(0.0..width),
                rng.random_range(0.0..height),
                1000.0 - k as f64,
            )
        })
        .collect()
}

/// Gaussian draw clamped to ±2.2σ: keeps every nominal chi2 contribution
/// well below the rejection cuts used by the tests.
pub fn clamped_normal(rng: &mut StdRng, sigma: f64) -> f64 {
    let normal = Normal::new(0.0, sigma).unwrap();
    normal.sample(rng).clamp(-2.2 * sigma, 2.2 * sigma)
}

/// Per-CCD polynomial mapping from the pixel frame to the common frame.
///
/// Measurement terms compare the mapped measured position (and, when flux
/// fitting is on, the measured flux) to the owning fitted star; reference
/// terms compare fitted stars to their anchors. Everything is linear in the
/// parameters, so Gauss-Newton converges in one step and the rank-update
/// and rebuild paths can be compared tightly.
pub struct MappingModel {
    pub mappings: Vec<PolyTransform>,
    what: WhatToFit,
    base_index: usize,
}

impl MappingModel {
    pub fn new(n_images: usize, order: usize) -> Self {
        MappingModel {
            mappings: (0..n_images)
                .map(|_| PolyTransform::identity_of_order(order))
                .collect(),
            what: WhatToFit::default(),
            base_index: 0,
        }
    }

    /// Pixel frame → the [−1, 1]² frame the mapping polynomials operate in
    /// (raw kilopixel coordinates would wreck the normal-matrix
    /// conditioning at order 3).
    pub fn normalize(p: &Point) -> Point {
        Point::new((p.x - 500.0) / 500.0, (p.y - 500.0) / 500.0)
    }

    /// Inverse of [`normalize`](Self::normalize): polynomial output frame →
    /// common frame. An identity polynomial therefore predicts `p` itself.
    pub fn denormalize(p: &Point) -> Point {
        Point::new(500.0 * p.x + 500.0, 500.0 * p.y + 500.0)
    }

    /// Predicted common-frame position of a pixel on one image.
    pub fn predict(&self, ccd: usize, p: &Point) -> Point {
        Self::denormalize(&self.mappings[ccd].apply(&Self::normalize(p)))
    }

    fn npoly(&self) -> usize {
        self.mappings.first().map_or(0, |p| p.npar())
    }

    fn image_block(&self, ccd: usize) -> usize {
        self.base_index + ccd * self.npoly()
    }
}

impl FitModel for MappingModel {
    fn parameter_count(&self) -> usize {
        self.mappings.iter().map(|p| p.npar()).sum()
    }

    fn assign_indices(&mut self, what_to_fit: &WhatToFit, base_index: usize) -> usize {
        self.what = *what_to_fit;
        self.base_index = base_index;
        if self.what.model {
            self.parameter_count()
        } else {
            0
        }
    }

    fn offset_params(&mut self, delta: &DVector<f64>) {
        if !self.what.model {
            return;
        }
        let npoly = self.npoly();
        for ccd in 0..self.mappings.len() {
            let start = self.base_index + ccd * npoly;
            self.mappings[ccd].offset_params(&delta.as_slice()[start..start + npoly]);
        }
    }

    fn accumulate_stat_image(
        &self,
        associations: &Associations,
        ccd: usize,
        accum: &mut dyn Chi2Accumulator,
    ) {
        for (star, ms) in associations.ccd_images[ccd].valid_measurements() {
            let Some(fitted) = ms.fitted_star else {
                continue;
            };
            let fs = &associations.fitted_stars[fitted];
            let pred = self.predict(ccd, ms.pos());
            let rx = (pred.x - fs.pos.x) / ms.sigma_x;
            let ry = (pred.y - fs.pos.y) / ms.sigma_y;
            let mut chi2 = rx * rx + ry * ry;
            let mut ndof = 2;
            if self.what.fluxes {
                let rf = (fs.flux - ms.flux()) / ms.sigma_flux;
                chi2 += rf * rf;
                ndof += 1;
            }
            accum.add_entry(chi2, ndof, Chi2Source::Measurement { ccd, star });
        }
    }

    fn accumulate_stat_ref(&self, associations: &Associations, accum: &mut dyn Chi2Accumulator) {
        for (fitted, fs) in associations.fitted_stars.iter().enumerate() {
            let Some(ref_idx) = fs.ref_star else {
                continue;
            };
            let rs = &associations.ref_stars[ref_idx];
            let rx = (fs.pos.x - rs.pos.x) / rs.sigma_x;
            let ry = (fs.pos.y - rs.pos.y) / rs.sigma_y;
            let mut chi2 = rx * rx + ry * ry;
            let mut ndof = 2;
            if self.what.fluxes {
                let rf = (fs.flux - rs.flux) / rs.sigma_flux;
                chi2 += rf * rf;
                ndof += 1;
            }
            accum.add_entry(chi2, ndof, Chi2Source::Reference { fitted });
        }
    }

    fn indices_of_measured_star(
        &self,
        associations: &Associations,
        ccd: usize,
        star: usize,
    ) -> ParamIndices {
        let mut indices = ParamIndices::new();
        if self.what.model {
            let block = self.image_block(ccd);
            indices.extend(block..block + self.npoly());
        }
        if let Some(fitted) = associations.ccd_images[ccd].measured_stars[star].fitted_star {
            let fs = &associations.fitted_stars[fitted];
            if let Some(pbase) = fs.index_in_matrix {
                indices.push(pbase);
                indices.push(pbase + 1);
            }
            if let Some(fidx) = fs.flux_index_in_matrix {
                indices.push(fidx);
            }
        }
        indices
    }

    fn derivatives_measurement(
        &self,
        associations: &Associations,
        ccd: usize,
        triplets: &mut TripletList,
        grad: &mut DVector<f64>,
        restrict: Option<&[usize]>,
    ) {
        let image = &associations.ccd_images[ccd];
        let poly = &self.mappings[ccd];
        let npoly = self.npoly();
        let block = self.image_block(ccd);
        let mut dx = vec![0.0; npoly];
        let mut dy = vec![0.0; npoly];

        let star_indices: Vec<usize> = match restrict {
            Some(stars) => stars.to_vec(),
            None => (0..image.measured_stars.len()).collect(),
        };
        for star in star_indices {
            let ms = &image.measured_stars[star];
            if !ms.valid {
                continue;
            }
            let Some(fitted) = ms.fitted_star else {
                continue;
            };
            let fs = &associations.fitted_stars[fitted];
            let normalized = Self::normalize(ms.pos());
            let pred = Self::denormalize(&poly.apply(&normalized));
            if self.what.model {
                poly.param_derivatives(&normalized, &mut dx, &mut dy);
            }

            let residuals = [
                ((pred.x - fs.pos.x) / ms.sigma_x, &dx, ms.sigma_x, 0usize),
                ((pred.y - fs.pos.y) / ms.sigma_y, &dy, ms.sigma_y, 1usize),
            ];
            for (r, dpoly, sigma, comp) in residuals {
                let col = triplets.next_free_index();
                if self.what.model {
                    // d pred / d a_k picks up the denormalization scale
                    for (k, &d) in dpoly.iter().enumerate() {
                        if d != 0.0 {
                            let v = 500.0 * d / sigma;
                            triplets.add_triplet(block + k, col, v);
                            grad[block + k] -= v * r;
                        }
                    }
                }
                if let Some(pbase) = fs.index_in_matrix {
                    let v = -1.0 / sigma;
                    triplets.add_triplet(pbase + comp, col, v);
                    grad[pbase + comp] -= v * r;
                }
                triplets.set_next_free_index(col + 1);
            }

            if self.what.fluxes {
                let r = (fs.flux - ms.flux()) / ms.sigma_flux;
                let col = triplets.next_free_index();
                if let Some(fidx) = fs.flux_index_in_matrix {
                    let v = 1.0 / ms.sigma_flux;
                    triplets.add_triplet(fidx, col, v);
                    grad[fidx] -= v * r;
                }
                triplets.set_next_free_index(col + 1);
            }
        }
    }

    fn derivatives_reference(
        &self,
        associations: &Associations,
        fitted: &[usize],
        triplets: &mut TripletList,
        grad: &mut DVector<f64>,
    ) {
        for &fitted_idx in fitted {
            let fs = &associations.fitted_stars[fitted_idx];
            let Some(ref_idx) = fs.ref_star else {
                continue;
            };
            let rs = &associations.ref_stars[ref_idx];
            let residuals = [
                ((fs.pos.x - rs.pos.x) / rs.sigma_x, rs.sigma_x, 0usize),
                ((fs.pos.y - rs.pos.y) / rs.sigma_y, rs.sigma_y, 1usize),
            ];
            for (r, sigma, comp) in residuals {
                let col = triplets.next_free_index();
                if let Some(pbase) = fs.index_in_matrix {
                    let v = 1.0 / sigma;
                    triplets.add_triplet(pbase + comp, col, v);
                    grad[pbase + comp] -= v * r;
                }
                triplets.set_next_free_index(col + 1);
            }
            if self.what.fluxes {
                let r = (fs.flux - rs.flux) / rs.sigma_flux;
                let col = triplets.next_free_index();
                if let Some(fidx) = fs.flux_index_in_matrix {
                    let v = 1.0 / rs.sigma_flux;
                    triplets.add_triplet(fidx, col, v);
                    grad[fidx] -= v * r;
                }
                triplets.set_next_free_index(col + 1);
            }
        }
    }
}

/// Two exposures of the same `n` sky objects with clamped-Gaussian position
/// noise: image 0 sits in the common frame, image 1 is displaced so its
/// true pixel→common mapping is `image2_to_common`. Fitted stars start at
/// the exact sky positions; every star has two valid measurements.
pub fn two_image_associations(
    n: usize,
    image2_to_common: LinearTransform,
    noise_sigma: f64,
    seed: u64,
) -> Associations {
    let mut rng = rng(seed);
    let sky: Vec<Point> = (0..n)
        .map(|_| Point::new(rng.random_range(50.0..950.0), rng.random_range(50.0..950.0)))
        .collect();
    let common_to_image2 = image2_to_common.inverse().expect("invertible truth mapping");

    let mut assoc = Associations::new();
    for image in 0..2 {
        let mut stars = Vec::with_capacity(n);
        for (k, s) in sky.iter().enumerate() {
            let ideal = if image == 0 {
                *s
            } else {
                common_to_image2.apply(s)
            };
            let mut ms = MeasuredStar::new(
                BaseStar::new(
                    ideal.x + clamped_normal(&mut rng, noise_sigma),
                    ideal.y + clamped_normal(&mut rng, noise_sigma),
                    100.0 + k as f64,
                ),
                noise_sigma,
                noise_sigma,
                0.05,
            );
            ms.fitted_star = Some(k);
            stars.push(ms);
        }
        assoc.add_ccd_image(CcdImage::new(format!("img-{image}"), stars));
    }
    for (k, s) in sky.iter().enumerate() {
        assoc
            .fitted_stars
            .push(FittedStar::new(*s, 100.0 + k as f64));
    }
    assoc.recount_measurements();
    assoc
}
