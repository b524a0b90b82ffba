//! Jacobian storage and the Newton iteration matrix `I - c J`, dense or banded.

use anyhow::{anyhow, bail, Result};
use nalgebra::linalg::LU;
use nalgebra::{DMatrix, DVector, Dyn};

/// Sink for Jacobian entries produced by formula differentiation.
pub trait JacobianMatrix {
    fn dimension(&self) -> usize;

    /// Adds `value` to entry (row, col).
    fn add(&mut self, row: usize, col: usize, value: f64);
}

impl JacobianMatrix for DMatrix<f64> {
    fn dimension(&self) -> usize {
        self.nrows()
    }

    fn add(&mut self, row: usize, col: usize, value: f64) {
        self[(row, col)] += value;
    }
}

/// Computes `out += J v` without materializing `J`.
pub struct JacobianTimesVector<'a> {
    pub vector: &'a [f64],
    pub out: &'a mut [f64],
}

impl JacobianMatrix for JacobianTimesVector<'_> {
    fn dimension(&self) -> usize {
        self.out.len()
    }

    fn add(&mut self, row: usize, col: usize, value: f64) {
        self.out[row] += value * self.vector[col];
    }
}

/// Square band matrix with `lower` sub- and `upper` super-diagonals.
///
/// Rows reserve `lower` extra super-diagonals for the fill-in produced by
/// partial pivoting during factorization.
#[derive(Debug, Clone)]
pub struct BandedMatrix {
    n: usize,
    lower: usize,
    upper: usize,
    data: Vec<f64>,
}

impl BandedMatrix {
    pub fn new(n: usize, lower: usize, upper: usize) -> Self {
        let width = 2 * lower + upper + 1;
        Self {
            n,
            lower,
            upper,
            data: vec![0.0; n * width],
        }
    }

    pub fn lower(&self) -> usize {
        self.lower
    }

    pub fn upper(&self) -> usize {
        self.upper
    }

    fn width(&self) -> usize {
        2 * self.lower + self.upper + 1
    }

    fn storage_index(&self, row: usize, col: usize) -> Option<usize> {
        if col + self.lower < row || col > row + self.upper + self.lower {
            return None;
        }
        Some(row * self.width() + col + self.lower - row)
    }

    /// Whether (row, col) lies inside the declared band.
    pub fn in_band(&self, row: usize, col: usize) -> bool {
        col + self.lower >= row && col <= row + self.upper
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.storage_index(row, col)
            .map(|idx| self.data[idx])
            .unwrap_or(0.0)
    }

    fn get_mut(&mut self, row: usize, col: usize) -> Option<&mut f64> {
        let idx = self.storage_index(row, col)?;
        self.data.get_mut(idx)
    }

    pub fn fill_zero(&mut self) {
        self.data.iter_mut().for_each(|v| *v = 0.0);
    }
}

impl JacobianMatrix for BandedMatrix {
    fn dimension(&self) -> usize {
        self.n
    }

    /// Entries outside the declared band are dropped.
    fn add(&mut self, row: usize, col: usize, value: f64) {
        if !self.in_band(row, col) {
            return;
        }
        if let Some(entry) = self.get_mut(row, col) {
            *entry += value;
        }
    }
}

/// LU factorization of a band matrix with partial pivoting.
#[derive(Debug, Clone)]
pub struct BandedLu {
    factors: BandedMatrix,
    pivots: Vec<usize>,
}

impl BandedLu {
    pub fn factor(mut a: BandedMatrix) -> Result<Self> {
        let n = a.n;
        let ml = a.lower;
        let reach = a.lower + a.upper;
        let mut pivots = vec![0usize; n];

        for k in 0..n {
            let last_row = (k + ml).min(n.saturating_sub(1));
            let mut pivot = k;
            let mut pivot_abs = a.get(k, k).abs();
            for i in (k + 1)..=last_row {
                let candidate = a.get(i, k).abs();
                if candidate > pivot_abs {
                    pivot = i;
                    pivot_abs = candidate;
                }
            }
            if pivot_abs == 0.0 || !pivot_abs.is_finite() {
                bail!("Iteration matrix is singular (column {}).", k);
            }
            pivots[k] = pivot;

            let last_col = (k + reach).min(n - 1);
            if pivot != k {
                for j in k..=last_col {
                    let upper = a.get(k, j);
                    let lower = a.get(pivot, j);
                    if let Some(entry) = a.get_mut(k, j) {
                        *entry = lower;
                    }
                    if let Some(entry) = a.get_mut(pivot, j) {
                        *entry = upper;
                    }
                }
            }

            let diagonal = a.get(k, k);
            for i in (k + 1)..=last_row {
                let factor = a.get(i, k) / diagonal;
                if let Some(entry) = a.get_mut(i, k) {
                    *entry = factor;
                }
                if factor == 0.0 {
                    continue;
                }
                for j in (k + 1)..=last_col {
                    let update = factor * a.get(k, j);
                    if let Some(entry) = a.get_mut(i, j) {
                        *entry -= update;
                    }
                }
            }
        }

        Ok(Self { factors: a, pivots })
    }

    pub fn solve_in_place(&self, b: &mut [f64]) {
        let a = &self.factors;
        let n = a.n;
        let reach = a.lower + a.upper;

        for k in 0..n {
            let pivot = self.pivots[k];
            if pivot != k {
                b.swap(k, pivot);
            }
            let last_row = (k + a.lower).min(n - 1);
            for i in (k + 1)..=last_row {
                b[i] -= a.get(i, k) * b[k];
            }
        }

        for i in (0..n).rev() {
            let last_col = (i + reach).min(n - 1);
            let mut sum = b[i];
            for j in (i + 1)..=last_col {
                sum -= a.get(i, j) * b[j];
            }
            b[i] = sum / a.get(i, i);
        }
    }
}

/// Jacobian plus the cached factorization of `I - c J`.
pub enum LinearSolver {
    Dense {
        jacobian: DMatrix<f64>,
        lu: Option<LU<f64, Dyn, Dyn>>,
    },
    Banded {
        jacobian: BandedMatrix,
        lu: Option<BandedLu>,
    },
}

impl LinearSolver {
    pub fn dense(n: usize) -> Self {
        LinearSolver::Dense {
            jacobian: DMatrix::zeros(n, n),
            lu: None,
        }
    }

    pub fn banded(n: usize, lower: usize, upper: usize) -> Self {
        LinearSolver::Banded {
            jacobian: BandedMatrix::new(n, lower, upper),
            lu: None,
        }
    }

    /// Clears the Jacobian, drops the factorization and hands out the sink.
    pub fn reset_jacobian(&mut self) -> &mut dyn JacobianMatrix {
        match self {
            LinearSolver::Dense { jacobian, lu } => {
                *lu = None;
                jacobian.fill(0.0);
                jacobian
            }
            LinearSolver::Banded { jacobian, lu } => {
                *lu = None;
                jacobian.fill_zero();
                jacobian
            }
        }
    }

    pub fn invalidate(&mut self) {
        match self {
            LinearSolver::Dense { lu, .. } => *lu = None,
            LinearSolver::Banded { lu, .. } => *lu = None,
        }
    }

    pub fn is_factored(&self) -> bool {
        match self {
            LinearSolver::Dense { lu, .. } => lu.is_some(),
            LinearSolver::Banded { lu, .. } => lu.is_some(),
        }
    }

    /// Factors `I - c J`.
    pub fn factor(&mut self, c: f64) -> Result<()> {
        match self {
            LinearSolver::Dense { jacobian, lu } => {
                let n = jacobian.nrows();
                let matrix = DMatrix::<f64>::identity(n, n) - &*jacobian * c;
                let decomposition = matrix.lu();
                if !decomposition.is_invertible() {
                    *lu = None;
                    bail!("Iteration matrix is singular.");
                }
                *lu = Some(decomposition);
            }
            LinearSolver::Banded { jacobian, lu } => {
                let n = jacobian.n;
                let mut matrix = BandedMatrix::new(n, jacobian.lower, jacobian.upper);
                for row in 0..n {
                    let first = row.saturating_sub(jacobian.lower);
                    let last = (row + jacobian.upper).min(n - 1);
                    for col in first..=last {
                        let identity = if row == col { 1.0 } else { 0.0 };
                        matrix.add(row, col, identity - c * jacobian.get(row, col));
                    }
                }
                *lu = Some(BandedLu::factor(matrix)?);
            }
        }
        Ok(())
    }

    /// Solves `(I - c J) x = b` in place with the current factorization.
    pub fn solve_in_place(&self, b: &mut [f64]) -> Result<()> {
        match self {
            LinearSolver::Dense { lu, .. } => {
                let lu = lu
                    .as_ref()
                    .ok_or_else(|| anyhow!("Iteration matrix is not factored."))?;
                let rhs = DVector::from_column_slice(b);
                let solution = lu
                    .solve(&rhs)
                    .ok_or_else(|| anyhow!("Iteration matrix is singular."))?;
                b.copy_from_slice(solution.as_slice());
            }
            LinearSolver::Banded { lu, .. } => {
                let lu = lu
                    .as_ref()
                    .ok_or_else(|| anyhow!("Iteration matrix is not factored."))?;
                lu.solve_in_place(b);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tridiagonal(n: usize) -> (BandedMatrix, DMatrix<f64>) {
        let mut banded = BandedMatrix::new(n, 1, 1);
        let mut dense = DMatrix::zeros(n, n);
        for i in 0..n {
            banded.add(i, i, 4.0 + i as f64);
            dense[(i, i)] = 4.0 + i as f64;
            if i + 1 < n {
                banded.add(i, i + 1, -1.0);
                banded.add(i + 1, i, 2.0);
                dense[(i, i + 1)] = -1.0;
                dense[(i + 1, i)] = 2.0;
            }
        }
        (banded, dense)
    }

    #[test]
    fn banded_lu_matches_dense_solve() {
        let (banded, dense) = tridiagonal(6);
        let rhs: Vec<f64> = (0..6).map(|i| i as f64 - 2.5).collect();
        let expected = dense
            .lu()
            .solve(&DVector::from_column_slice(&rhs))
            .expect("dense solve");

        let lu = BandedLu::factor(banded).expect("banded factor");
        let mut x = rhs.clone();
        lu.solve_in_place(&mut x);
        for i in 0..6 {
            assert_relative_eq!(x[i], expected[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn banded_lu_pivots_on_small_diagonal() {
        let mut banded = BandedMatrix::new(3, 1, 1);
        banded.add(0, 0, 1e-14);
        banded.add(0, 1, 1.0);
        banded.add(1, 0, 1.0);
        banded.add(1, 1, 1.0);
        banded.add(1, 2, 1.0);
        banded.add(2, 1, 1.0);
        banded.add(2, 2, 3.0);
        let lu = BandedLu::factor(banded).expect("factor");
        let mut x = vec![1.0, 2.0, 4.0];
        lu.solve_in_place(&mut x);
        // Residual check against the original matrix.
        let r0 = 1e-14 * x[0] + x[1] - 1.0;
        let r1 = x[0] + x[1] + x[2] - 2.0;
        let r2 = x[1] + 3.0 * x[2] - 4.0;
        assert!(r0.abs() < 1e-10 && r1.abs() < 1e-10 && r2.abs() < 1e-10);
    }

    #[test]
    fn banded_matrix_ignores_out_of_band_entries() {
        let mut banded = BandedMatrix::new(4, 1, 0);
        banded.add(0, 3, 5.0);
        banded.add(1, 0, 2.0);
        assert_eq!(banded.get(0, 3), 0.0);
        assert_eq!(banded.get(1, 0), 2.0);
    }

    #[test]
    fn singular_matrix_is_reported() {
        let mut solver = LinearSolver::dense(2);
        {
            let jac = solver.reset_jacobian();
            jac.add(0, 0, 1.0);
            jac.add(1, 1, 1.0);
        }
        let err = solver.factor(1.0).expect_err("I - J is zero");
        assert!(err.to_string().contains("singular"));

        let mut banded = LinearSolver::banded(2, 0, 0);
        {
            let jac = banded.reset_jacobian();
            jac.add(0, 0, 1.0);
            jac.add(1, 1, 1.0);
        }
        assert!(banded.factor(1.0).is_err());
    }

    #[test]
    fn dense_and_banded_iteration_matrices_agree() {
        let (banded_jac, dense_jac) = tridiagonal(5);
        let mut dense = LinearSolver::dense(5);
        let mut banded = LinearSolver::banded(5, 1, 1);
        {
            let sink = dense.reset_jacobian();
            for i in 0..5 {
                for j in 0..5 {
                    if dense_jac[(i, j)] != 0.0 {
                        sink.add(i, j, dense_jac[(i, j)]);
                    }
                }
            }
        }
        {
            let sink = banded.reset_jacobian();
            for i in 0..5 {
                for j in 0..5 {
                    let v = banded_jac.get(i, j);
                    if v != 0.0 {
                        sink.add(i, j, v);
                    }
                }
            }
        }
        dense.factor(0.1).unwrap();
        banded.factor(0.1).unwrap();
        let mut a = vec![1.0, -1.0, 0.5, 2.0, 3.0];
        let mut b = a.clone();
        dense.solve_in_place(&mut a).unwrap();
        banded.solve_in_place(&mut b).unwrap();
        for i in 0..5 {
            assert_relative_eq!(a[i], b[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn jacobian_times_vector_accumulates_products() {
        let v = [1.0, 2.0];
        let mut out = [0.0, 0.0];
        {
            let mut sink = JacobianTimesVector {
                vector: &v,
                out: &mut out,
            };
            sink.add(0, 1, 3.0);
            sink.add(1, 0, -1.0);
            sink.add(1, 1, 0.5);
        }
        assert_eq!(out, [6.0, 0.0]);
    }
}
