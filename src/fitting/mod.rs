//! The nonlinear least-squares engine: triplet buffers, chi2 accounting,
//! normal-equation assembly, and the Gauss-Newton driver.

pub mod chi2;
pub mod fitter;
mod hessian;
pub mod model;
pub mod triplet_list;

pub use chi2::{Chi2Accumulator, Chi2List, Chi2Source, Chi2Star, Chi2Statistic};
pub use fitter::{Fitter, MeasOutlier, MinimizeResult};
pub use model::{FitModel, ParamIndices, WhatToFit};
pub use triplet_list::{Triplet, TripletList};
