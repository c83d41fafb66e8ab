//! Solver errors

use std::path::PathBuf;

use thiserror::Error;

use crate::vfi::Solution;

/// Solver result type
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can stop a model from being built or solved.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid calibration: {reason}")]
    InvalidCalibration { reason: String },

    #[error("invalid capital grid: {reason}")]
    InvalidGrid { reason: String },

    #[error(
        "infeasible capital grid: output at ({capital_index}, {productivity_index}) \
         does not exceed the smallest capital choice"
    )]
    InfeasibleGrid {
        capital_index: usize,
        productivity_index: usize,
    },

    #[error("invalid solver configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("table shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error(
        "non-positive consumption {consumption} at state ({capital_index}, {productivity_index}) \
         for capital choice {candidate_index}"
    )]
    NonPositiveConsumption {
        capital_index: usize,
        productivity_index: usize,
        candidate_index: usize,
        consumption: f64,
    },

    #[error("no convergence after {iterations} iterations (sup diff = {max_difference})")]
    NonConvergence {
        iterations: u32,
        max_difference: f64,
        last: Box<Solution>,
    },

    #[error("cannot allocate a {rows}x{cols} table")]
    Allocation { rows: usize, cols: usize },

    #[error("failed to read config {path}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid thread count: {0}")]
    ThreadPool(usize),
}

impl Error {
    /// The last iterate carried by [`Error::NonConvergence`], for callers
    /// willing to accept an approximate solution.
    pub fn into_approximate(self) -> Option<Solution> {
        match self {
            Error::NonConvergence { last, .. } => Some(*last),
            _ => None,
        }
    }
}
