//! Parametric model library.
//!
//! Models are small, pure functions of `(x, θ)` so that the fitting code can stay
//! generic. Atomic components compose into expression trees with `+` and `*`,
//! and a [`ModelTemplate`] freezes a model together with its initial guess for
//! a whole run.

pub mod component;
pub mod compound;
pub mod model;
pub mod template;

pub use component::*;
pub use compound::*;
pub use model::*;
pub use template::*;
