//! Terminal reports for fit runs.

pub mod format;

pub use format::*;
