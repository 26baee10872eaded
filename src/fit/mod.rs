//! Cube fitting.
//!
//! Responsibilities:
//!
//! - split the independent pixel axes into work units (`chunk`)
//! - fit one pixel with a pluggable strategy (`fitter`)
//! - dispatch units in parallel or synchronously (`driver`)
//! - assemble per-pixel results into parameter arrays (`cube`)
//! - report progress, profile and cancel runs (`observer`)

pub mod chunk;
pub mod cube;
pub mod driver;
pub mod fitter;
pub mod observer;

pub use chunk::*;
pub use cube::*;
pub use driver::*;
pub use fitter::*;
pub use observer::*;
