//! # RBC model solved by value function iteration
//!
//! Stochastic neoclassical growth model with full depreciation and log
//! utility:
//!
//! ```text
//! V(k, z) = max_{k'} (1-β)·ln(z·k^α - k') + β·E[V(k', z') | z]
//! ```
//!
//! Capital lives on a dense, equally spaced grid anchored at half the
//! deterministic steady state; productivity follows a finite Markov chain.
//!
//! | Module | Role |
//! |--------|------|
//! | [`model`] | calibration, capital grid, pre-built output table |
//! | [`vfi`] | the solver loop: expectation, monotone maximization, convergence |
//! | [`parallel`] | the same sweep split across a scoped thread pool |
//! | [`grid`] | dense `capital × productivity` tables |
//! | [`observer`] | progress hooks |
//! | [`config`] | TOML run configuration |
//!
//! ```no_run
//! use rbc_vfi::{Model, Solver, SolverConfig};
//!
//! let model = Model::reference()?;
//! let mut solver = Solver::new(&model, SolverConfig::default())?;
//! let solution = solver.solve()?;
//! println!("My check = {}", solution.policy(999, 2));
//! # Ok::<(), rbc_vfi::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod grid;
pub mod model;
pub mod observer;
pub mod parallel;
pub mod vfi;

pub use error::{Error, Result};
pub use grid::Table;
pub use model::{Calibration, GridSpec, Model, SteadyState};
pub use observer::{LogObserver, Observer, Progress, Silent};
pub use vfi::{Solution, Solver, SolverConfig};
