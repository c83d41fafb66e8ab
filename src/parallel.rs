//! One sweep of the solver split across a scoped thread pool, one task per
//! productivity state.
//!
//! Both steps write into disjoint productivity columns and only share
//! read-only references, so no locking is needed. Each column runs exactly
//! the same arithmetic as the serial sweep, so results are bit-identical.

use scoped_threadpool::Pool;

use crate::error::Result;
use crate::grid::Table;
use crate::model::Model;
use crate::vfi::{expectation_column, maximize_column, ColumnOut, Workspace};

/// Expectation step with one task per productivity state.
pub fn expectation(
    pool: &mut Pool,
    transition: &[Vec<f64>],
    value: &Table<f64>,
    expected: &mut Table<f64>,
) {
    pool.scoped(|scoped| {
        for (expected_values, transitions) in expected.columns_mut().zip(transition.iter()) {
            scoped.execute(move || expectation_column(transitions, value, expected_values));
        }
    });
}

pub(crate) fn sweep(pool: &mut Pool, model: &Model, ws: &mut Workspace) -> Result<()> {
    expectation(pool, model.transition(), &ws.value, &mut ws.expected);

    let capital = model.capital();
    let beta = model.beta();

    // small array to split where the results are going, so we don't need a mutex
    let mut results: Vec<Result<()>> = (0..model.n_productivity()).map(|_| Ok(())).collect();

    pool.scoped(|scoped| {
        for (productivity, (((((value, policy), policy_index), expected), output), result)) in ws
            .value_new
            .columns_mut()
            .zip(ws.policy.columns_mut())
            .zip(ws.policy_index.columns_mut())
            .zip(ws.expected.columns())
            .zip(model.output().columns())
            .zip(results.iter_mut())
            .enumerate()
        {
            scoped.execute(move || {
                let out = ColumnOut {
                    value,
                    policy,
                    policy_index,
                };
                *result = maximize_column(capital, output, expected, beta, productivity, out);
            });
        }
    });

    // Report the lowest failing productivity state, as the serial sweep would.
    results.into_iter().collect()
}
