//! Per-channel solution of `E = M + R * (F E)`.
//!
//! Each colour channel is solved on its own. Reflectance acts as a
//! per-channel scalar; there is no cross-channel coupling.

use std::fmt;

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::error::RadiosityError;
use super::matrix::FormFactorMatrix;
use super::simulation::CancelToken;

/// Linear solver strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SolveMethod {
    /// Gaussian elimination of `(I - diag(R) F)`. Exact, O(N^3).
    Direct,
    Jacobi,
    GaussSeidel,
    /// Progressive shooting of the largest unshot energy.
    Southwell,
}

impl fmt::Display for SolveMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SolveMethod::Direct => "direct",
            SolveMethod::Jacobi => "jacobi",
            SolveMethod::GaussSeidel => "gauss-seidel",
            SolveMethod::Southwell => "southwell",
        };
        write!(f, "{name}")
    }
}

/// Inputs of one channel solve.
#[derive(Debug, Clone, Copy)]
pub struct ChannelProblem<'a> {
    pub form_factors: &'a FormFactorMatrix,
    pub reflectance: &'a [f64],
    pub emission: &'a [f64],
    /// Patch areas; Southwell weights unshot energy by them.
    pub areas: &'a [f64],
}

/// Outcome of one channel solve.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSolution {
    pub exitance: Vec<f64>,
    pub converged: bool,
    /// Sweeps (Jacobi, Gauss-Seidel), shots (Southwell) or 1 (Direct).
    pub sweeps: usize,
    /// Final squared residual sum, or unshot energy for Southwell.
    pub residual: f64,
    /// Residual after each sweep or shot.
    pub residual_history: Vec<f64>,
}

impl SolveMethod {
    /// Solves one channel. Non-convergence is logged and the last iterate kept.
    pub fn solve(
        self,
        problem: &ChannelProblem<'_>,
        tolerance: f64,
        max_sweeps: usize,
        cancel: &CancelToken,
    ) -> Result<ChannelSolution> {
        let n = problem.form_factors.dim();
        anyhow::ensure!(
            problem.reflectance.len() == n && problem.emission.len() == n && problem.areas.len() == n,
            "Channel inputs do not match the {n}x{n} form-factor matrix"
        );
        if n == 0 {
            return Ok(ChannelSolution {
                exitance: Vec::new(),
                converged: true,
                sweeps: 0,
                residual: 0.0,
                residual_history: Vec::new(),
            });
        }

        let solution = match self {
            SolveMethod::Direct => solve_direct(problem, cancel)?,
            SolveMethod::Jacobi => solve_jacobi(problem, tolerance, max_sweeps, cancel)?,
            SolveMethod::GaussSeidel => solve_gauss_seidel(problem, tolerance, max_sweeps, cancel)?,
            SolveMethod::Southwell => solve_southwell(problem, tolerance, max_sweeps, cancel)?,
        };

        if !solution.converged {
            log::warn!(
                "{self} did not converge after {} steps (residual {:.3e}, tolerance {:.3e}); keeping last iterate",
                solution.sweeps,
                solution.residual,
                tolerance
            );
        }
        Ok(solution)
    }
}

/// `M + R (F E) - E`.
fn residual_vector(problem: &ChannelProblem<'_>, exitance: &[f64]) -> Vec<f64> {
    let fe = problem.form_factors.mul_vec(exitance);
    fe.iter()
        .enumerate()
        .map(|(i, &g)| problem.emission[i] + problem.reflectance[i] * g - exitance[i])
        .collect()
}

fn squared_residual(problem: &ChannelProblem<'_>, exitance: &[f64]) -> f64 {
    residual_vector(problem, exitance).iter().map(|r| r * r).sum()
}

/// Diagonal of `I - diag(R) F`.
fn diagonal(problem: &ChannelProblem<'_>, i: usize) -> f64 {
    1.0 - problem.reflectance[i] * problem.form_factors.get(i, i)
}

fn check_cancel(cancel: &CancelToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(RadiosityError::Cancelled.into());
    }
    Ok(())
}

fn solve_direct(problem: &ChannelProblem<'_>, cancel: &CancelToken) -> Result<ChannelSolution> {
    check_cancel(cancel)?;
    let n = problem.form_factors.dim();
    let a: Vec<Vec<f64>> = (0..n)
        .map(|i| {
            problem
                .form_factors
                .row(i)
                .iter()
                .enumerate()
                .map(|(j, &f)| {
                    let identity = if i == j { 1.0 } else { 0.0 };
                    identity - problem.reflectance[i] * f as f64
                })
                .collect()
        })
        .collect();
    let exitance = solve_dense(a, problem.emission.to_vec())?;
    let residual = squared_residual(problem, &exitance);
    Ok(ChannelSolution {
        exitance,
        converged: true,
        sweeps: 1,
        residual,
        residual_history: vec![residual],
    })
}

/// Dense `A x = b` by Gaussian elimination with partial pivoting.
fn solve_dense(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Result<Vec<f64>> {
    let n = a.len();

    for col in 0..n {
        let mut pivot_row = col;
        let mut pivot_val = a[col][col].abs();
        for (r, row) in a.iter().enumerate().skip(col + 1) {
            let v = row[col].abs();
            if v > pivot_val {
                pivot_val = v;
                pivot_row = r;
            }
        }
        anyhow::ensure!(
            pivot_val > 1e-14,
            "Radiosity system is singular at column {col} (reflectance of 1 in a closed cavity?)"
        );
        if pivot_row != col {
            a.swap(pivot_row, col);
            b.swap(pivot_row, col);
        }

        let (upper, lower) = a.split_at_mut(col + 1);
        let pivot = &upper[col];
        for (offset, row) in lower.iter_mut().enumerate() {
            let factor = row[col] / pivot[col];
            if factor == 0.0 {
                continue;
            }
            row[col] = 0.0;
            for c in (col + 1)..n {
                row[c] -= factor * pivot[c];
            }
            b[col + 1 + offset] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut rhs = b[i];
        for j in (i + 1)..n {
            rhs -= a[i][j] * x[j];
        }
        x[i] = rhs / a[i][i];
    }

    for (i, xi) in x.iter().enumerate() {
        xi.is_finite()
            .then_some(())
            .with_context(|| format!("Non-finite exitance at patch {i}: {xi}"))?;
    }
    Ok(x)
}

fn solve_jacobi(
    problem: &ChannelProblem<'_>,
    tolerance: f64,
    max_sweeps: usize,
    cancel: &CancelToken,
) -> Result<ChannelSolution> {
    let n = problem.form_factors.dim();
    let mut exitance = problem.emission.to_vec();
    let mut residual = squared_residual(problem, &exitance);
    let mut history = Vec::new();
    let mut sweeps = 0;

    while residual >= tolerance && sweeps < max_sweeps {
        check_cancel(cancel)?;
        let previous = &exitance;
        let next: Vec<f64> = (0..n)
            .into_par_iter()
            .map(|i| {
                let gathered: f64 = problem
                    .form_factors
                    .row(i)
                    .iter()
                    .enumerate()
                    .filter(|&(j, _)| j != i)
                    .map(|(j, &f)| f as f64 * previous[j])
                    .sum();
                (problem.emission[i] + problem.reflectance[i] * gathered) / diagonal(problem, i)
            })
            .collect();
        exitance = next;
        sweeps += 1;
        residual = squared_residual(problem, &exitance);
        history.push(residual);
    }

    Ok(ChannelSolution {
        exitance,
        converged: residual < tolerance,
        sweeps,
        residual,
        residual_history: history,
    })
}

fn solve_gauss_seidel(
    problem: &ChannelProblem<'_>,
    tolerance: f64,
    max_sweeps: usize,
    cancel: &CancelToken,
) -> Result<ChannelSolution> {
    let n = problem.form_factors.dim();
    let mut exitance = problem.emission.to_vec();
    let mut residual = squared_residual(problem, &exitance);
    let mut history = Vec::new();
    let mut sweeps = 0;

    while residual >= tolerance && sweeps < max_sweeps {
        check_cancel(cancel)?;
        for i in 0..n {
            let gathered: f64 = problem
                .form_factors
                .row(i)
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .map(|(j, &f)| f as f64 * exitance[j])
                .sum();
            exitance[i] =
                (problem.emission[i] + problem.reflectance[i] * gathered) / diagonal(problem, i);
        }
        sweeps += 1;
        residual = squared_residual(problem, &exitance);
        history.push(residual);
    }

    Ok(ChannelSolution {
        exitance,
        converged: residual < tolerance,
        sweeps,
        residual,
        residual_history: history,
    })
}

/// Progressive shooting.
///
/// Starts from `E = 0`, `r = M`. Each shot picks the patch with the largest
/// `A_i |r_i|`, adds `r_i / (1 - R_i F_ii)` to its exitance and pushes that
/// change through column `i` into every other residual.
///
/// Unshot energy `sum A_i |r_i|` (recorded from the initial emission on) is
/// only guaranteed not to grow when `A_i F_ij = A_j F_ji`; a shot that raises
/// it on a non-reciprocal matrix is counted and reported.
fn solve_southwell(
    problem: &ChannelProblem<'_>,
    tolerance: f64,
    max_sweeps: usize,
    cancel: &CancelToken,
) -> Result<ChannelSolution> {
    let n = problem.form_factors.dim();
    let f = problem.form_factors;
    let areas = problem.areas;
    let mut exitance = vec![0.0; n];
    let mut unshot_residual = problem.emission.to_vec();
    let unshot = |r: &[f64]| -> f64 { r.iter().zip(areas).map(|(ri, a)| a * ri.abs()).sum() };

    let max_shots = max_sweeps.saturating_mul(n);
    let mut energy = unshot(&unshot_residual);
    let mut history = vec![energy];
    let mut shots = 0;
    let mut increases = 0;

    while energy >= tolerance && shots < max_shots {
        if shots % n == 0 {
            check_cancel(cancel)?;
        }
        let Some(i) = (0..n)
            .filter(|&i| areas[i] > 0.0)
            .max_by(|&a, &b| {
                let ea = areas[a] * unshot_residual[a].abs();
                let eb = areas[b] * unshot_residual[b].abs();
                ea.total_cmp(&eb)
            })
        else {
            break;
        };

        let delta = unshot_residual[i] / diagonal(problem, i);
        exitance[i] += delta;
        unshot_residual[i] = 0.0;
        for (j, r) in unshot_residual.iter_mut().enumerate() {
            if j != i {
                *r += problem.reflectance[j] * f.get(j, i) * delta;
            }
        }

        shots += 1;
        let next = unshot(&unshot_residual);
        if next > energy {
            increases += 1;
        }
        energy = next;
        history.push(energy);
    }
    if increases > 0 {
        log::warn!(
            "Southwell: unshot energy grew on {increases} of {shots} shots; \
             the form-factor matrix is not reciprocal"
        );
    }

    // Zero-area patches are never shot; they receive by a final gather.
    for i in (0..n).filter(|&i| areas[i] <= 0.0) {
        let gathered: f64 = (0..n)
            .filter(|&j| j != i)
            .map(|j| f.get(i, j) * exitance[j])
            .sum();
        exitance[i] = (problem.emission[i] + problem.reflectance[i] * gathered) / diagonal(problem, i);
    }

    Ok(ChannelSolution {
        exitance,
        converged: energy < tolerance,
        sweeps: shots,
        residual: energy,
        residual_history: history,
    })
}
