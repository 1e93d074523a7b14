#![deny(dead_code)]
#![deny(unused_imports)]

//! # ocafit
//!
//! Fits a parametric optical-response model of a photomultiplier array to
//! occupancy ratios measured with a movable light source. The fit recovers
//! per-medium extinction coefficients, a binned sensor angular response, the
//! source intensity distribution and per-run normalisations, together with
//! their covariance.

pub mod chisquare;
pub mod config;
pub mod data;
pub mod estimate;
pub mod layout;
pub mod linalg;
pub mod marquardt;
pub mod observation;
pub mod optics;
pub mod parameters;
pub mod results;
pub mod systematic;
