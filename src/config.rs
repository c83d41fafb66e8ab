//! Run configuration stored as TOML.
//!
//! Every field defaults to the benchmark run, so an empty file (or no file
//! at all) reproduces it:
//!
//! ```toml
//! [calibration]
//! alpha = 0.3333333333333333
//! beta = 0.95
//! productivity = [0.9792, 0.9896, 1.0, 1.0106, 1.0212]
//!
//! [grid]
//! size = 17820
//! step = 0.00001
//! lower_ratio = 0.5
//!
//! [solver]
//! tolerance = 0.0000001
//! max_iterations = 1000
//! threads = 1
//!
//! [report]
//! every = 10
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Calibration, GridSpec};
use crate::vfi::SolverConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Log progress every this many iterations.
    pub every: u32,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self { every: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub calibration: Calibration,
    pub grid: GridSpec,
    pub solver: SolverConfig,
    pub report: ReportConfig,
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        self.calibration.validate()?;
        self.solver.validate()?;
        if self.report.every == 0 {
            return Err(Error::InvalidConfig {
                reason: "report.every must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

pub fn parse_config(contents: &str, path: &Path) -> Result<RunConfig> {
    let cfg: RunConfig = toml::from_str(contents).map_err(|source| Error::ConfigParse {
        path: path.to_path_buf(),
        source,
    })?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunConfig> {
    if !path.exists() {
        let cfg = RunConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).map_err(|source| Error::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&contents, path)
}
