//! Mathematical utilities: dense least-squares solves for the fitter.

pub mod lstsq;

pub use lstsq::*;
