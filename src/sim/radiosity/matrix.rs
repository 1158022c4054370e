//! Dense N x N form-factor matrix.
//!
//! Row `i` holds what sender `i` sees: `F[i][j]` is the fraction of energy
//! leaving patch `i` that reaches patch `j`. Entries are stored as `f32`
//! (row-major) to halve the O(N^2) footprint; solvers accumulate in `f64`.

use anyhow::Result;
use rayon::prelude::*;

/// Row-major form-factor matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct FormFactorMatrix {
    n: usize,
    data: Vec<f32>,
}

impl FormFactorMatrix {
    /// Zero matrix for `n` patches.
    pub fn new(n: usize) -> Result<Self> {
        let len = n
            .checked_mul(n)
            .ok_or_else(|| anyhow::anyhow!("Form-factor matrix for {n} patches overflows"))?;
        Ok(Self {
            n,
            data: vec![0.0; len],
        })
    }

    /// Wraps raw row-major entries (as read back from disk).
    pub fn from_raw(n: usize, data: Vec<f32>) -> Result<Self> {
        anyhow::ensure!(
            Some(data.len()) == n.checked_mul(n),
            "Expected {n}x{n} entries, got {}",
            data.len()
        );
        Ok(Self { n, data })
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n + j] as f64
    }

    pub fn set(&mut self, i: usize, j: usize, value: f64) {
        self.data[i * self.n + j] = value as f32;
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.n..(i + 1) * self.n]
    }

    /// Overwrites row `i` with an accumulated `f64` row.
    pub fn store_row(&mut self, i: usize, row: &[f64]) {
        debug_assert_eq!(row.len(), self.n);
        for (dst, &src) in self.data[i * self.n..(i + 1) * self.n]
            .iter_mut()
            .zip(row)
        {
            *dst = src as f32;
        }
    }

    /// Fraction of patch `i`'s hemisphere covered by other patches.
    pub fn row_sum(&self, i: usize) -> f64 {
        self.row(i).iter().map(|&f| f as f64).sum()
    }

    /// Column `j` (what every sender delivers to `j`).
    pub fn column(&self, j: usize) -> Vec<f64> {
        (0..self.n).map(|i| self.get(i, j)).collect()
    }

    /// `F * x`, rows in parallel.
    pub fn mul_vec(&self, x: &[f64]) -> Vec<f64> {
        debug_assert_eq!(x.len(), self.n);
        if self.n == 0 {
            return Vec::new();
        }
        self.data
            .par_chunks(self.n)
            .map(|row| row.iter().zip(x).map(|(&f, &xj)| f as f64 * xj).sum())
            .collect()
    }

    /// Averages `A_i F_ij` with `A_j F_ji` so the matrix satisfies reciprocity.
    ///
    /// Pairs involving a zero-area patch are left untouched.
    pub fn enforce_reciprocity(&mut self, areas: &[f64]) {
        debug_assert_eq!(areas.len(), self.n);
        let n = self.n;
        for i in 0..n {
            for j in (i + 1)..n {
                let (ai, aj) = (areas[i], areas[j]);
                if ai <= 0.0 || aj <= 0.0 {
                    continue;
                }
                let avg = 0.5 * (ai * self.get(i, j) + aj * self.get(j, i));
                self.set(i, j, avg / ai);
                self.set(j, i, avg / aj);
            }
        }
    }

    /// Largest `|A_i F_ij - A_j F_ji|` over all pairs.
    pub fn reciprocity_error(&self, areas: &[f64]) -> f64 {
        let n = self.n;
        let mut worst: f64 = 0.0;
        for i in 0..n {
            for j in (i + 1)..n {
                let diff = (areas[i] * self.get(i, j) - areas[j] * self.get(j, i)).abs();
                worst = worst.max(diff);
            }
        }
        worst
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}
