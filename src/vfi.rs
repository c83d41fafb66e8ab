//! Value function iteration.
//!
//! Each iteration runs three steps over fixed, pre-allocated buffers:
//!
//! 1. expectation: `E[i][j] = Σ_k P[j][k] · V[i][k]`
//! 2. maximization: for every state pick the next-period capital maximizing
//!    `(1-β)·ln(y - k') + β·E[k'][j]`, using the monotonicity of the policy
//!    function to start each search at the previous choice
//! 3. convergence: sup-norm distance between the old and new value function,
//!    then swap the two buffers
//!
//! Productivity columns never read each other during the maximization step,
//! which is what [`crate::parallel`] exploits.

use std::mem;

use scoped_threadpool::Pool;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::grid::Table;
use crate::model::Model;
use crate::observer::{Observer, Progress, Silent};
use crate::parallel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Stop once the sup-norm change of the value function is at most this.
    pub tolerance: f64,
    pub max_iterations: u32,
    /// Worker threads for the sweep. `1` runs serially, `0` uses one worker
    /// per logical CPU.
    pub threads: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.0000001,
            max_iterations: 1000,
            threads: 1,
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(Error::InvalidConfig {
                reason: format!("tolerance {} must be positive", self.tolerance),
            });
        }
        if self.max_iterations == 0 {
            return Err(Error::InvalidConfig {
                reason: "max_iterations must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Thread count with `0` resolved to the number of logical CPUs.
    pub fn resolved_threads(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get()
        } else {
            self.threads
        }
    }
}

/// Converged (or last) iterate of the solver.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub value: Table<f64>,
    /// Chosen next-period capital level per state.
    pub policy: Table<f64>,
    /// Grid index of the chosen next-period capital per state.
    pub policy_index: Table<usize>,
    pub iterations: u32,
    pub max_difference: f64,
}

impl Solution {
    pub fn value(&self, capital: usize, productivity: usize) -> f64 {
        self.value.get(capital, productivity)
    }

    pub fn policy(&self, capital: usize, productivity: usize) -> f64 {
        self.policy.get(capital, productivity)
    }

    /// Whether the policy is non-decreasing in capital for every
    /// productivity state.
    pub fn is_monotone(&self) -> bool {
        self.policy_index
            .columns()
            .all(|col| col.windows(2).all(|w| w[0] <= w[1]))
    }

    /// Capital index whose choice is closest to staying put under
    /// productivity state `productivity`.
    pub fn fixed_point(&self, productivity: usize) -> usize {
        self.policy_index
            .column(productivity)
            .iter()
            .enumerate()
            .min_by_key(|&(i, &next)| i.abs_diff(next))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }
}

/// Output buffers of one productivity column.
pub struct ColumnOut<'a> {
    pub value: &'a mut [f64],
    pub policy: &'a mut [f64],
    pub policy_index: &'a mut [usize],
}

/// Expected continuation value for one productivity state `j`, given the
/// `j`-th row of the transition matrix.
pub fn expectation_column(transitions: &[f64], value: &Table<f64>, expected: &mut [f64]) {
    for (idx, expected_value) in expected.iter_mut().enumerate() {
        *expected_value = transitions
            .iter()
            .enumerate()
            .fold(0.0f64, |acc, (k, transition)| acc + transition * value.get(idx, k));
    }
}

/// Expectation step over every productivity state.
pub fn expectation(transition: &[Vec<f64>], value: &Table<f64>, expected: &mut Table<f64>) {
    for (expected, transitions) in expected.columns_mut().zip(transition.iter()) {
        expectation_column(transitions, value, expected);
    }
}

/// Best next-period capital index for output level `output`, scanning upward
/// from `start`.
///
/// The objective is strictly concave in the choice, so the scan halts at the
/// first candidate that does not improve on the best so far. Consumption
/// falls as the candidate rises, so the first infeasible candidate also
/// halts it. Returns `None` when the candidate at `start` is already
/// infeasible.
#[inline]
fn climb(
    capital: &[f64],
    expected: &[f64],
    beta: f64,
    output: f64,
    start: usize,
) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;

    for capital_next_period in start..capital.len() {
        let consumption = output - capital[capital_next_period];
        if consumption <= 0.0 {
            break;
        }
        let value_provisional =
            (1.0 - beta) * consumption.ln() + beta * expected[capital_next_period];

        match best {
            Some((_, value_high)) if value_provisional <= value_high => break,
            _ => best = Some((capital_next_period, value_provisional)),
        }
    }

    best
}

/// Maximization step for productivity state `productivity`.
///
/// `output` and `expected` are that state's columns of the output table and
/// the expected value function. The monotonicity cursor is local to the
/// column.
pub fn maximize_column(
    capital: &[f64],
    output: &[f64],
    expected: &[f64],
    beta: f64,
    productivity: usize,
    out: ColumnOut<'_>,
) -> Result<()> {
    debug_assert_eq!(capital.len(), output.len());
    debug_assert_eq!(capital.len(), expected.len());

    // We start from previous choice (monotonicity of policy function)
    let mut grid_capital_next_period = 0;

    for (capital_idx, (((&output_level, value), policy), index)) in output
        .iter()
        .zip(out.value.iter_mut())
        .zip(out.policy.iter_mut())
        .zip(out.policy_index.iter_mut())
        .enumerate()
    {
        let (choice, value_high) =
            climb(capital, expected, beta, output_level, grid_capital_next_period).ok_or_else(
                || Error::NonPositiveConsumption {
                    capital_index: capital_idx,
                    productivity_index: productivity,
                    candidate_index: grid_capital_next_period,
                    consumption: output_level - capital[grid_capital_next_period],
                },
            )?;

        grid_capital_next_period = choice;
        *value = value_high;
        *policy = capital[choice];
        *index = choice;
    }

    Ok(())
}

/// Largest absolute entry-wise difference between two tables of equal shape.
pub fn sup_difference(a: &Table<f64>, b: &Table<f64>) -> f64 {
    a.as_slice()
        .iter()
        .zip(b.as_slice())
        .fold(0.0f64, |acc, (x, y)| acc.max((x - y).abs()))
}

/// Working buffers, allocated once per solve and reused every iteration.
pub(crate) struct Workspace {
    pub value: Table<f64>,
    pub value_new: Table<f64>,
    pub expected: Table<f64>,
    pub policy: Table<f64>,
    pub policy_index: Table<usize>,
}

impl Workspace {
    fn new(initial: Table<f64>) -> Result<Self> {
        let (rows, cols) = initial.shape();
        Ok(Self {
            value_new: Table::filled(rows, cols, 0.0)?,
            expected: Table::filled(rows, cols, 0.0)?,
            policy: Table::filled(rows, cols, 0.0)?,
            policy_index: Table::filled(rows, cols, 0)?,
            value: initial,
        })
    }

    /// Expectation and maximization on the calling thread.
    fn sweep_serial(&mut self, model: &Model) -> Result<()> {
        expectation(model.transition(), &self.value, &mut self.expected);

        let capital = model.capital();
        let beta = model.beta();
        for (productivity, ((((value, policy), policy_index), expected), output)) in self
            .value_new
            .columns_mut()
            .zip(self.policy.columns_mut())
            .zip(self.policy_index.columns_mut())
            .zip(self.expected.columns())
            .zip(model.output().columns())
            .enumerate()
        {
            let out = ColumnOut {
                value,
                policy,
                policy_index,
            };
            maximize_column(capital, output, expected, beta, productivity, out)?;
        }
        Ok(())
    }

    fn into_solution(self, iterations: u32, max_difference: f64) -> Solution {
        Solution {
            value: self.value,
            policy: self.policy,
            policy_index: self.policy_index,
            iterations,
            max_difference,
        }
    }
}

enum Backend {
    Serial,
    Pool(Pool),
}

/// Value function iteration over a fixed [`Model`].
pub struct Solver<'m> {
    model: &'m Model,
    config: SolverConfig,
    backend: Backend,
}

impl<'m> Solver<'m> {
    pub fn new(model: &'m Model, config: SolverConfig) -> Result<Self> {
        config.validate()?;
        let threads = config.resolved_threads();
        let backend = if threads <= 1 {
            Backend::Serial
        } else {
            let count = u32::try_from(threads).map_err(|_| Error::ThreadPool(threads))?;
            Backend::Pool(Pool::new(count))
        };
        debug!(threads, "solver backend ready");
        Ok(Self {
            model,
            config,
            backend,
        })
    }

    pub fn model(&self) -> &Model {
        self.model
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Solve from a zero value function.
    pub fn solve(&mut self) -> Result<Solution> {
        self.solve_observed(&mut Silent)
    }

    pub fn solve_observed<O: Observer>(&mut self, observer: &mut O) -> Result<Solution> {
        let initial = Table::filled(self.model.n_capital(), self.model.n_productivity(), 0.0)?;
        self.solve_from_observed(initial, observer)
    }

    /// Solve starting from a caller-supplied value function.
    pub fn solve_from(&mut self, initial: Table<f64>) -> Result<Solution> {
        self.solve_from_observed(initial, &mut Silent)
    }

    pub fn solve_from_observed<O: Observer>(
        &mut self,
        initial: Table<f64>,
        observer: &mut O,
    ) -> Result<Solution> {
        let expected_shape = (self.model.n_capital(), self.model.n_productivity());
        if initial.shape() != expected_shape {
            return Err(Error::ShapeMismatch {
                expected: expected_shape,
                found: initial.shape(),
            });
        }
        if let Some(v) = initial.as_slice().iter().find(|v| !v.is_finite()) {
            return Err(Error::InvalidConfig {
                reason: format!("initial value function contains {}", v),
            });
        }

        let mut ws = Workspace::new(initial)?;
        let tolerance = self.config.tolerance;
        let mut max_difference = f64::INFINITY;

        for iteration in 1..=self.config.max_iterations {
            match &mut self.backend {
                Backend::Serial => ws.sweep_serial(self.model)?,
                Backend::Pool(pool) => parallel::sweep(pool, self.model, &mut ws)?,
            }

            max_difference = sup_difference(&ws.value, &ws.value_new);
            mem::swap(&mut ws.value, &mut ws.value_new);

            let progress = Progress {
                iteration,
                max_difference,
            };
            observer.on_iteration(&progress);

            if max_difference <= tolerance {
                observer.on_finish(&progress, true);
                return Ok(ws.into_solution(iteration, max_difference));
            }
        }

        let iterations = self.config.max_iterations;
        observer.on_finish(
            &Progress {
                iteration: iterations,
                max_difference,
            },
            false,
        );
        warn!(iterations, max_difference, "value function iteration did not converge");
        Err(Error::NonConvergence {
            iterations,
            max_difference,
            last: Box::new(ws.into_solution(iterations, max_difference)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Calibration, GridSpec};

    fn small_model() -> Model {
        Model::new(Calibration::reference(), &GridSpec::with_size(200, 0.001)).unwrap()
    }

    #[test]
    fn expectation_of_constant_is_constant() {
        let transition = vec![
            vec![0.5, 0.5, 0.0],
            vec![0.25, 0.5, 0.25],
            vec![0.0, 0.125, 0.875],
        ];
        let value = Table::filled(40, 3, 2.5).unwrap();
        let mut expected = Table::filled(40, 3, 0.0).unwrap();
        expectation(&transition, &value, &mut expected);
        for &e in expected.as_slice() {
            assert!((e - 2.5).abs() < 1e-12);
        }
    }

    #[test]
    fn expectation_uses_rounded_rows_as_given() {
        // The benchmark's middle row sums to 1.0001.
        let model = small_model();
        let value = Table::filled(model.n_capital(), model.n_productivity(), 1.0).unwrap();
        let mut expected = Table::filled(model.n_capital(), model.n_productivity(), 0.0).unwrap();
        expectation(model.transition(), &value, &mut expected);
        for (j, row) in model.transition().iter().enumerate() {
            let sum: f64 = row.iter().sum();
            assert!((expected.get(0, j) - sum).abs() < 1e-12);
        }
    }

    #[test]
    fn expectation_mixes_next_period_states() {
        let transition = vec![vec![0.25, 0.75], vec![1.0, 0.0]];
        let value = Table::from_fn(2, 2, 0.0, |i, k| (i * 10 + k) as f64).unwrap();
        let mut expected = Table::filled(2, 2, 0.0).unwrap();
        expectation(&transition, &value, &mut expected);
        assert!((expected.get(0, 0) - 0.75).abs() < 1e-15);
        assert!((expected.get(1, 0) - (0.25 * 10.0 + 0.75 * 11.0)).abs() < 1e-12);
        assert_eq!(expected.get(1, 1), 10.0);
    }

    #[test]
    fn climb_stops_at_first_non_improving_candidate() {
        let capital = [0.1, 0.2, 0.3, 0.4];
        // Expected values peak at index 2 and then fall.
        let expected = [0.0, 1.0, 2.0, -5.0];
        let (choice, _) = climb(&capital, &expected, 0.9, 1.0, 0).unwrap();
        assert_eq!(choice, 2);
    }

    #[test]
    fn climb_stops_before_infeasible_candidates() {
        let capital = [0.1, 0.2, 0.3, 0.4];
        let expected = [0.0, 10.0, 20.0, 30.0];
        let (choice, _) = climb(&capital, &expected, 0.5, 0.25, 0).unwrap();
        assert_eq!(choice, 1);
        assert!(climb(&capital, &expected, 0.5, 0.25, 3).is_none());
    }

    #[test]
    fn maximize_reports_non_positive_consumption() {
        let capital = [0.1, 0.2, 0.3];
        let output = [0.15, 0.05, 0.35];
        let expected = [0.0, 0.0, 0.0];
        let mut value = [0.0; 3];
        let mut policy = [0.0; 3];
        let mut policy_index = [0usize; 3];
        let err = maximize_column(
            &capital,
            &output,
            &expected,
            0.95,
            4,
            ColumnOut {
                value: &mut value,
                policy: &mut policy,
                policy_index: &mut policy_index,
            },
        )
        .unwrap_err();
        match err {
            Error::NonPositiveConsumption {
                capital_index,
                productivity_index,
                candidate_index,
                consumption,
            } => {
                assert_eq!(capital_index, 1);
                assert_eq!(productivity_index, 4);
                assert_eq!(candidate_index, 0);
                assert!(consumption <= 0.0);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn sup_difference_is_max_abs() {
        let a = Table::from_fn(3, 2, 0.0, |i, j| (i + j) as f64).unwrap();
        let mut b = a.clone();
        b.set(2, 1, 1.5);
        b.set(0, 0, 0.25);
        assert_eq!(sup_difference(&a, &b), 1.5);
        assert_eq!(sup_difference(&a, &a), 0.0);
    }

    #[test]
    fn small_grid_converges_with_monotone_policy() {
        let model = small_model();
        let mut solver = Solver::new(&model, SolverConfig::default()).unwrap();
        let solution = solver.solve().unwrap();
        assert!(solution.max_difference <= 1e-7);
        assert!(solution.iterations > 1);
        assert!(solution.iterations < 1000);
        assert!(solution.is_monotone());
    }

    #[test]
    fn solves_caller_supplied_arrays() {
        let built = small_model();
        let model = Model::from_parts(
            built.capital().to_vec(),
            built.output().clone(),
            built.transition().to_vec(),
            built.beta(),
        )
        .unwrap();

        let from_parts = Solver::new(&model, SolverConfig::default())
            .unwrap()
            .solve()
            .unwrap();
        let from_calibration = Solver::new(&built, SolverConfig::default())
            .unwrap()
            .solve()
            .unwrap();
        assert_eq!(from_parts, from_calibration);
    }

    #[test]
    fn solves_hand_built_two_state_problem() {
        let capital: Vec<f64> = (0..60).map(|i| 0.05 + 0.005 * i as f64).collect();
        let productivity = [0.97, 1.03];
        let output =
            Table::from_fn(60, 2, 0.0, |i, j| productivity[j] * capital[i].powf(0.3)).unwrap();
        let transition = vec![vec![0.9, 0.1], vec![0.1, 0.9]];
        let model = Model::from_parts(capital.clone(), output, transition, 0.9).unwrap();

        let solution = Solver::new(&model, SolverConfig::default())
            .unwrap()
            .solve()
            .unwrap();
        assert!(solution.max_difference <= 1e-7);
        assert!(solution.is_monotone());
        for j in 0..2 {
            for i in 0..60 {
                assert_eq!(solution.policy(i, j), capital[solution.policy_index.get(i, j)]);
            }
        }
    }

    #[test]
    fn single_point_grid_converges_to_that_point() {
        let model = Model::new(Calibration::reference(), &GridSpec::with_size(1, 0.001)).unwrap();
        let mut solver = Solver::new(&model, SolverConfig::default()).unwrap();
        let solution = solver.solve().unwrap();
        for j in 0..model.n_productivity() {
            assert_eq!(solution.policy(0, j), model.capital()[0]);
            assert_eq!(solution.policy_index.get(0, j), 0);
        }
        assert!(solution.max_difference <= 1e-7);
    }

    #[test]
    fn iteration_cap_reports_last_iterate() {
        let model = small_model();
        let config = SolverConfig {
            max_iterations: 3,
            ..SolverConfig::default()
        };
        let mut solver = Solver::new(&model, config).unwrap();
        let err = solver.solve().unwrap_err();
        match &err {
            Error::NonConvergence {
                iterations,
                max_difference,
                last,
            } => {
                assert_eq!(*iterations, 3);
                assert!(*max_difference > 1e-7);
                assert_eq!(last.iterations, 3);
            }
            other => panic!("unexpected error: {}", other),
        }
        let approx = err.into_approximate().unwrap();
        assert_eq!(approx.value.shape(), (200, 5));
    }

    #[test]
    fn warm_start_from_solution_converges_immediately() {
        let model = small_model();
        let mut solver = Solver::new(&model, SolverConfig::default()).unwrap();
        let cold = solver.solve().unwrap();
        let warm = solver.solve_from(cold.value.clone()).unwrap();
        assert!(warm.iterations <= 2, "iterations = {}", warm.iterations);
        assert!(sup_difference(&warm.value, &cold.value) <= 1e-6);
    }

    #[test]
    fn warm_start_rejects_wrong_shape_and_nan() {
        let model = small_model();
        let mut solver = Solver::new(&model, SolverConfig::default()).unwrap();
        let wrong = Table::filled(10, 5, 0.0).unwrap();
        assert!(matches!(solver.solve_from(wrong), Err(Error::ShapeMismatch { .. })));

        let mut nan = Table::filled(200, 5, 0.0).unwrap();
        nan.set(3, 3, f64::NAN);
        assert!(matches!(solver.solve_from(nan), Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn rejects_bad_solver_config() {
        let model = small_model();
        for config in [
            SolverConfig {
                tolerance: 0.0,
                ..SolverConfig::default()
            },
            SolverConfig {
                tolerance: f64::NAN,
                ..SolverConfig::default()
            },
            SolverConfig {
                max_iterations: 0,
                ..SolverConfig::default()
            },
        ] {
            assert!(matches!(
                Solver::new(&model, config),
                Err(Error::InvalidConfig { .. })
            ));
        }
    }

    #[test]
    fn observer_sees_every_iteration() {
        let model = small_model();
        let mut solver = Solver::new(&model, SolverConfig::default()).unwrap();
        let mut seen = Vec::new();
        let solution = solver
            .solve_observed(&mut |p: &Progress| seen.push(p.iteration))
            .unwrap();
        assert_eq!(seen.len() as u32, solution.iterations);
        assert_eq!(seen.first(), Some(&1));
    }
}
