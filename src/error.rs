//! Error types.
//!
//! Two layers:
//!
//! - [`FitError`]: fatal, run-level errors raised by the fitting engine.
//! - [`AppError`]: what the `pixfit` binary reports (message + process exit code).
//!
//! Per-pixel problems are *not* errors; they are recorded in the output cube as
//! [`crate::domain::FailureKind`] and the run continues.

use thiserror::Error;

/// Fatal errors of a driver run.
///
/// A run either returns a complete output cube or exactly one of these.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    /// Shape or axis mismatch, invalid model template, unknown scheduler mode.
    ///
    /// Always raised before any work unit is dispatched.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The caller cancelled the run. Completed units were discarded.
    #[error("fit run cancelled")]
    Cancelled,

    /// A worker kept crashing after its retries and the run is configured to
    /// treat that as fatal.
    #[error("worker fault in unit {unit}: {message}")]
    WorkerFault { unit: usize, message: String },
}

impl FitError {
    pub fn config(message: impl Into<String>) -> Self {
        FitError::Configuration(message.into())
    }
}

#[derive(Clone)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl From<FitError> for AppError {
    fn from(err: FitError) -> Self {
        let exit_code = match err {
            FitError::Configuration(_) => 2,
            FitError::WorkerFault { .. } => 4,
            FitError::Cancelled => 130,
        };
        AppError::new(exit_code, err.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}
