//! One detector exposure and its measured-star catalogue.

use std::fmt;

use crate::stars::{MeasuredStar, MeasuredStarList};
use crate::transforms::{Transform, TransformIdentity};

/// One CCD's image from one exposure.
///
/// Owns the measured stars detected on it and the seed mapping from its
/// pixel frame to the common frame, as produced by the matcher. The models
/// driving the fit hold their own per-image parameters keyed by the image's
/// position in [`Associations::ccd_images`](crate::associations::Associations).
#[derive(Debug, Clone)]
pub struct CcdImage {
    /// Identifier used in logs and diagnostic dumps, e.g. "visit-12/ccd-3".
    pub name: String,
    pub measured_stars: MeasuredStarList,
    /// Matcher seed: pixel frame → common frame.
    pub init_transform: Box<dyn Transform>,
}

impl CcdImage {
    pub fn new(name: impl Into<String>, measured_stars: MeasuredStarList) -> Self {
        CcdImage {
            name: name.into(),
            measured_stars,
            init_transform: Box::new(TransformIdentity),
        }
    }

    pub fn with_transform(
        name: impl Into<String>,
        measured_stars: MeasuredStarList,
        init_transform: Box<dyn Transform>,
    ) -> Self {
        CcdImage {
            name: name.into(),
            measured_stars,
            init_transform,
        }
    }

    /// Iterate over the currently-valid measured stars with their indices.
    pub fn valid_measurements(&self) -> impl Iterator<Item = (usize, &MeasuredStar)> {
        self.measured_stars
            .iter()
            .enumerate()
            .filter(|(_, ms)| ms.valid)
    }
}

impl fmt::Display for CcdImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} stars, {} valid)",
            self.name,
            self.measured_stars.len(),
            self.valid_measurements().count()
        )
    }
}

pub type CcdImageList = Vec<CcdImage>;
