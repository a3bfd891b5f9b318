//! # starcal
//!
//! Core of a joint astrometric/photometric calibration engine: given many
//! overlapping exposures, simultaneously fit per-detector transformations
//! and per-sky-object positions/fluxes so that all measurements agree with
//! one another and with an external reference catalogue.
//!
//! The crate provides:
//!
//! * a combinatorial star matcher ([`matching`]) that bootstraps the
//!   per-detector alignments,
//! * a sparse Gauss-Newton fitter with robust outlier rejection
//!   ([`fitting`]), driven through the narrow [`fitting::FitModel`]
//!   capability interface so concrete models stay outside the core,
//! * the shared data model: star lists ([`stars`]), detector exposures
//!   ([`ccd_image`]), the cross-linked ensemble ([`associations`]), and
//!   geometrical transforms ([`transforms`]).

pub mod associations;
pub mod ccd_image;
pub mod constants;
pub mod fitting;
pub mod matching;
pub mod starcal_errors;
pub mod stars;
pub mod transforms;

pub use associations::Associations;
pub use ccd_image::{CcdImage, CcdImageList};
pub use fitting::{Fitter, MinimizeResult};
pub use matching::{FastFinder, MatchConditions, StarMatchList};
pub use starcal_errors::StarcalError;
pub use stars::{BaseStar, BaseStarList, FittedStar, MeasuredStar, Point, RefStar};
