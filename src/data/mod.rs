//! Input-side helpers.
//!
//! - sample validity masks and fit weights (`weights`)
//! - seeded synthetic rasters for demos and tests (`synthetic`)
//! - spatially averaged spectra (`spectrum`)

pub mod spectrum;
pub mod synthetic;
pub mod weights;

pub use spectrum::*;
pub use synthetic::*;
pub use weights::*;
