//! Domain types used throughout the engine.
//!
//! This module defines:
//!
//! - configuration (`DriverConfig`, `Scheduler`, `SolverOptions`, `FitOptions`)
//! - per-pixel outcomes (`PixelFit`, `FitDiagnostics`, `PixelStatus`, `FailureKind`)

pub mod types;

pub use types::*;
