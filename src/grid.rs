//! Dense `capital × productivity` tables.
//!
//! Storage is productivity-major: every productivity column is one
//! contiguous run of `rows()` entries, so a whole column can be borrowed as a
//! slice and handed to a worker without copying.

use std::slice::{ChunksExact, ChunksExactMut};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Table<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: Copy> Table<T> {
    /// Allocate a `rows × cols` table filled with `fill`.
    ///
    /// The buffer is reserved up front; a size that cannot be allocated is
    /// reported as [`Error::Allocation`] rather than aborting the process.
    pub fn filled(rows: usize, cols: usize, fill: T) -> Result<Self> {
        let len = rows
            .checked_mul(cols)
            .ok_or(Error::Allocation { rows, cols })?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| Error::Allocation { rows, cols })?;
        data.resize(len, fill);
        Ok(Self { rows, cols, data })
    }

    /// Build a table by evaluating `f(capital_index, productivity_index)`.
    pub fn from_fn<F>(rows: usize, cols: usize, fill: T, mut f: F) -> Result<Self>
    where
        F: FnMut(usize, usize) -> T,
    {
        let mut table = Self::filled(rows, cols, fill)?;
        for (j, column) in table.columns_mut().enumerate() {
            for (i, cell) in column.iter_mut().enumerate() {
                *cell = f(i, j);
            }
        }
        Ok(table)
    }

    #[inline]
    pub fn get(&self, capital: usize, productivity: usize) -> T {
        self.data[self.offset(capital, productivity)]
    }

    #[inline]
    pub fn try_get(&self, capital: usize, productivity: usize) -> Option<T> {
        if capital < self.rows && productivity < self.cols {
            Some(self.data[productivity * self.rows + capital])
        } else {
            None
        }
    }

    #[inline]
    pub fn set(&mut self, capital: usize, productivity: usize, value: T) {
        let idx = self.offset(capital, productivity);
        self.data[idx] = value;
    }
}

impl<T> Table<T> {
    /// Number of capital grid points.
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of productivity states.
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// All capital entries for one productivity state.
    #[inline]
    pub fn column(&self, productivity: usize) -> &[T] {
        assert!(
            productivity < self.cols,
            "productivity index {} out of range (cols = {})",
            productivity,
            self.cols
        );
        let start = productivity * self.rows;
        &self.data[start..start + self.rows]
    }

    /// Iterate over the productivity columns in order.
    pub fn columns(&self) -> ChunksExact<'_, T> {
        // chunk size must be non-zero; an empty table yields nothing either way
        self.data.chunks_exact(self.rows.max(1))
    }

    /// Disjoint mutable borrows of every productivity column.
    pub fn columns_mut(&mut self) -> ChunksExactMut<'_, T> {
        self.data.chunks_exact_mut(self.rows.max(1))
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    #[inline]
    fn offset(&self, capital: usize, productivity: usize) -> usize {
        assert!(
            capital < self.rows && productivity < self.cols,
            "index ({}, {}) out of range for {}x{} table",
            capital,
            productivity,
            self.rows,
            self.cols
        );
        productivity * self.rows + capital
    }
}
