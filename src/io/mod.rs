//! Result exports.
//!
//! - parameter cube JSON (`export::write_cube_json`)
//! - per-pixel CSV (`export::write_pixels_csv`)

pub mod export;

pub use export::*;
