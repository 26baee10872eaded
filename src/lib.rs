//! `pixfit` library crate.
//!
//! Fits one parametric model independently to every pixel of an N-D data cube
//! along a chosen fitting axis, in parallel, with per-sample uncertainties and
//! masks folded into the fit weights.
//!
//! The binary (`pixfit`) is a thin wrapper around this library so that:
//!
//! - the engine is testable without spawning processes
//! - other front-ends can drive the same [`fit::ParallelFitDriver`]

pub mod app;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod math;
pub mod models;
pub mod report;
