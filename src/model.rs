//! Model setup: calibration, capital grid and pre-built output.
//!
//! Everything here is computed once and never mutated by the solver.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::grid::Table;

/// Rows of the transition matrix must sum to one within this tolerance.
///
/// Published chains are rounded to four decimals (the benchmark's middle row
/// sums to 1.0001), so rows are accepted up to that rounding and used as
/// given.
pub const STOCHASTIC_TOLERANCE: f64 = 5e-4;

/// Elasticity of output w.r.t. capital, discount factor and the Markov chain
/// of productivity shocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Calibration {
    pub alpha: f64,
    pub beta: f64,
    pub productivity: Vec<f64>,
    /// `transition[i][j]`: probability of moving from state `i` to state `j`.
    pub transition: Vec<Vec<f64>>,
}

impl Default for Calibration {
    fn default() -> Self {
        Self::reference()
    }
}

impl Calibration {
    /// The benchmark calibration: five productivity states around 1.
    pub fn reference() -> Self {
        Self {
            alpha: 1.0 / 3.0,
            beta: 0.95,
            productivity: vec![0.9792, 0.9896, 1.0000, 1.0106, 1.0212],
            transition: vec![
                vec![0.9727, 0.0273, 0.0000, 0.0000, 0.0000],
                vec![0.0041, 0.9806, 0.0153, 0.0000, 0.0000],
                vec![0.0000, 0.0082, 0.9837, 0.0082, 0.0000],
                vec![0.0000, 0.0000, 0.0153, 0.9806, 0.0041],
                vec![0.0000, 0.0000, 0.0000, 0.0273, 0.9727],
            ],
        }
    }

    pub fn validate(&self) -> Result<()> {
        unit_interval("alpha", self.alpha)?;
        unit_interval("beta", self.beta)?;

        if self.productivity.is_empty() {
            return Err(invalid("productivity grid is empty"));
        }
        if let Some((j, z)) = self
            .productivity
            .iter()
            .enumerate()
            .find(|(_, z)| !(z.is_finite() && **z > 0.0))
        {
            return Err(invalid(format!("productivity[{}] = {} is not positive", j, z)));
        }

        validate_transition(&self.transition, self.productivity.len())
    }
}

/// Check that `transition` is an `n × n` row-stochastic matrix.
pub fn validate_transition(transition: &[Vec<f64>], n: usize) -> Result<()> {
    if n == 0 {
        return Err(invalid("transition matrix is empty"));
    }
    if transition.len() != n {
        return Err(invalid(format!(
            "transition matrix has {} rows, expected {}",
            transition.len(),
            n
        )));
    }
    for (i, row) in transition.iter().enumerate() {
        if row.len() != n {
            return Err(invalid(format!(
                "transition row {} has {} entries, expected {}",
                i,
                row.len(),
                n
            )));
        }
        if let Some(p) = row.iter().find(|p| !(p.is_finite() && **p >= 0.0)) {
            return Err(invalid(format!(
                "transition row {} has invalid probability {}",
                i, p
            )));
        }
        let sum: f64 = row.iter().sum();
        if (sum - 1.0).abs() > STOCHASTIC_TOLERANCE {
            return Err(invalid(format!("transition row {} sums to {}", i, sum)));
        }
    }
    Ok(())
}

fn unit_interval(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(invalid(format!("{} = {} is outside (0, 1)", name, value)))
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidCalibration {
        reason: reason.into(),
    }
}

/// Layout of the capital grid relative to the steady state `k*`.
///
/// The grid starts at `lower_ratio * k*` and advances by `step`. With
/// `upper_ratio` set, the number of points is whatever fits in
/// `[lower_ratio * k*, upper_ratio * k*)`; otherwise it is `size`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSpec {
    pub size: usize,
    pub step: f64,
    pub lower_ratio: f64,
    pub upper_ratio: Option<f64>,
}

impl Default for GridSpec {
    fn default() -> Self {
        Self {
            size: 17820,
            step: 0.00001,
            lower_ratio: 0.5,
            upper_ratio: None,
        }
    }
}

impl GridSpec {
    pub fn with_size(size: usize, step: f64) -> Self {
        Self {
            size,
            step,
            ..Self::default()
        }
    }

    /// Number of grid points once the steady state is known.
    pub fn resolve_size(&self, capital_steady_state: f64) -> Result<usize> {
        if !(self.step.is_finite() && self.step > 0.0) {
            return Err(invalid_grid(format!("step {} must be positive", self.step)));
        }
        if !(self.lower_ratio.is_finite() && self.lower_ratio > 0.0) {
            return Err(invalid_grid(format!(
                "lower_ratio {} must be positive",
                self.lower_ratio
            )));
        }
        let size = match self.upper_ratio {
            None => self.size,
            Some(upper) => {
                if !(upper.is_finite() && upper > self.lower_ratio) {
                    return Err(invalid_grid(format!(
                        "upper_ratio {} must exceed lower_ratio {}",
                        upper, self.lower_ratio
                    )));
                }
                let span = (upper - self.lower_ratio) * capital_steady_state;
                (span / self.step).ceil() as usize
            }
        };
        if size == 0 {
            return Err(invalid_grid("grid has no points"));
        }
        Ok(size)
    }
}

fn invalid_grid(reason: impl Into<String>) -> Error {
    Error::InvalidGrid {
        reason: reason.into(),
    }
}

/// Deterministic steady state of the model. Diagnostic only; it anchors
/// the capital grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SteadyState {
    pub capital: f64,
    pub output: f64,
    pub consumption: f64,
}

impl SteadyState {
    pub fn new(alpha: f64, beta: f64) -> Self {
        let capital = (alpha * beta).powf(1_f64 / (1_f64 - alpha));
        let output = capital.powf(alpha);
        Self {
            capital,
            output,
            consumption: output - capital,
        }
    }
}

/// A fully built problem instance.
///
/// Built either from a calibration ([`Model::new`]) or from arrays supplied
/// by the caller ([`Model::from_parts`]). Only the former knows its
/// calibration and steady state.
#[derive(Debug, Clone)]
pub struct Model {
    calibration: Option<Calibration>,
    steady_state: Option<SteadyState>,
    beta: f64,
    transition: Vec<Vec<f64>>,
    capital: Vec<f64>,
    output: Table<f64>,
}

impl Model {
    pub fn new(calibration: Calibration, grid: &GridSpec) -> Result<Self> {
        calibration.validate()?;

        let steady_state = SteadyState::new(calibration.alpha, calibration.beta);
        info!(
            output = steady_state.output,
            capital = steady_state.capital,
            consumption = steady_state.consumption,
            "steady state"
        );

        let n_capital = grid.resolve_size(steady_state.capital)?;
        let n_productivity = calibration.productivity.len();
        let start = grid.lower_ratio * steady_state.capital;

        let mut capital = Vec::new();
        capital
            .try_reserve_exact(n_capital)
            .map_err(|_| Error::Allocation {
                rows: n_capital,
                cols: 1,
            })?;
        capital.extend((0..n_capital).map(|i| start + grid.step * (i as f64)));

        let alpha = calibration.alpha;
        let productivity = &calibration.productivity;
        let output = Table::from_fn(n_capital, n_productivity, 0.0, |i, j| {
            productivity[j] * capital[i].powf(alpha)
        })?;

        check_feasible(&capital, &output)?;

        debug!(
            n_capital,
            n_productivity,
            first = capital[0],
            last = capital[n_capital - 1],
            "capital grid built"
        );

        Ok(Self {
            beta: calibration.beta,
            transition: calibration.transition.clone(),
            calibration: Some(calibration),
            steady_state: Some(steady_state),
            capital,
            output,
        })
    }

    /// Assemble a model from a capital grid, an output table and a
    /// transition matrix produced elsewhere.
    ///
    /// The grid must be finite and strictly increasing, `output` must be
    /// `capital.len() × transition.len()` with finite entries, the matrix
    /// row-stochastic, and every output must exceed the smallest capital
    /// choice.
    pub fn from_parts(
        capital: Vec<f64>,
        output: Table<f64>,
        transition: Vec<Vec<f64>>,
        beta: f64,
    ) -> Result<Self> {
        unit_interval("beta", beta)?;
        validate_transition(&transition, transition.len())?;

        if capital.is_empty() {
            return Err(invalid_grid("grid has no points"));
        }
        if let Some(k) = capital.iter().find(|k| !k.is_finite()) {
            return Err(invalid_grid(format!("capital grid contains {}", k)));
        }
        if let Some(i) = capital.windows(2).position(|w| w[1] <= w[0]) {
            return Err(invalid_grid(format!(
                "capital grid is not strictly increasing at index {}",
                i + 1
            )));
        }

        let expected = (capital.len(), transition.len());
        if output.shape() != expected {
            return Err(Error::ShapeMismatch {
                expected,
                found: output.shape(),
            });
        }
        if let Some(y) = output.as_slice().iter().find(|y| !y.is_finite()) {
            return Err(invalid_grid(format!("output table contains {}", y)));
        }

        check_feasible(&capital, &output)?;

        Ok(Self {
            calibration: None,
            steady_state: None,
            beta,
            transition,
            capital,
            output,
        })
    }

    /// The benchmark problem: reference calibration on the default grid.
    pub fn reference() -> Result<Self> {
        Self::new(Calibration::reference(), &GridSpec::default())
    }

    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.as_ref()
    }

    pub fn alpha(&self) -> Option<f64> {
        self.calibration.as_ref().map(|c| c.alpha)
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn steady_state(&self) -> Option<SteadyState> {
        self.steady_state
    }

    pub fn capital(&self) -> &[f64] {
        &self.capital
    }

    pub fn productivity(&self) -> Option<&[f64]> {
        self.calibration.as_ref().map(|c| c.productivity.as_slice())
    }

    pub fn transition(&self) -> &[Vec<f64>] {
        &self.transition
    }

    pub fn output(&self) -> &Table<f64> {
        &self.output
    }

    pub fn n_capital(&self) -> usize {
        self.capital.len()
    }

    pub fn n_productivity(&self) -> usize {
        self.transition.len()
    }
}

/// Every state must leave positive consumption for the smallest capital
/// choice.
fn check_feasible(capital: &[f64], output: &Table<f64>) -> Result<()> {
    let smallest_choice = capital[0];
    for (j, column) in output.columns().enumerate() {
        if let Some(i) = column.iter().position(|&y| y <= smallest_choice) {
            return Err(Error::InfeasibleGrid {
                capital_index: i,
                productivity_index: j,
            });
        }
    }
    Ok(())
}
