//! Normal-matrix assembly and Cholesky factorization.
//!
//! The Jacobian arrives as column-grouped triplets; the Gauss-Newton normal
//! matrix is the sum of the sparse outer products of those columns,
//! `H = J Jᵀ = Σ_c j_c j_cᵀ`, accumulated into a symmetric matrix and
//! factored with a Cholesky decomposition. Removing a block of columns
//! (outlier rejection) downdates the factor column by column instead of
//! refactorizing.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use tracing::debug;

use crate::starcal_errors::StarcalError;

use super::triplet_list::TripletList;

/// Scatter the triplets into per-column runs of `(row, value)`.
fn columns_of(triplets: &TripletList) -> Vec<Vec<(usize, f64)>> {
    let mut columns: Vec<Vec<(usize, f64)>> = vec![Vec::new(); triplets.next_free_index()];
    for t in triplets.iter() {
        columns[t.col as usize].push((t.row as usize, t.value));
    }
    columns
}

/// Assemble `H = J Jᵀ` (size `n_par × n_par`) from a triplet list.
pub(crate) fn build_hessian(n_par: usize, triplets: &TripletList) -> DMatrix<f64> {
    let mut hessian = DMatrix::<f64>::zeros(n_par, n_par);
    for column in columns_of(triplets) {
        for &(i, vi) in &column {
            for &(j, vj) in &column {
                hessian[(i, j)] += vi * vj;
            }
        }
    }
    debug!(dim = n_par, "normal matrix assembled");
    hessian
}

/// A factored normal matrix.
pub(crate) struct HessianFactor {
    chol: Cholesky<f64, Dyn>,
    n_par: usize,
}

impl HessianFactor {
    /// Factor `hessian`; a non-positive-definite matrix is reported as
    /// [`StarcalError::FactorizationFailed`].
    pub fn factor(hessian: DMatrix<f64>) -> Result<Self, StarcalError> {
        let n_par = hessian.nrows();
        let chol = Cholesky::new(hessian).ok_or(StarcalError::FactorizationFailed)?;
        Ok(HessianFactor { chol, n_par })
    }

    pub fn solve(&self, rhs: &DVector<f64>) -> DVector<f64> {
        self.chol.solve(rhs)
    }

    /// Apply `H ← H − H_out H_outᵀ` directly on the factor, one rank-one
    /// downdate per outlier column. A downdate that drives the factor out
    /// of positive definiteness surfaces as `FactorizationFailed`.
    pub fn downdate(&mut self, outlier_triplets: &TripletList) -> Result<(), StarcalError> {
        for column in columns_of(outlier_triplets) {
            if column.is_empty() {
                continue;
            }
            let mut v = DVector::<f64>::zeros(self.n_par);
            for (row, value) in column {
                v[row] += value;
            }
            self.chol.rank_one_update(&v, -1.0);
        }
        if self
            .chol
            .l_dirty()
            .diagonal()
            .iter()
            .any(|d| !d.is_finite() || *d <= 0.0)
        {
            return Err(StarcalError::FactorizationFailed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two columns: j_0 = (1, 1, 0), j_1 = (0, 1, 2).
    fn sample_triplets() -> TripletList {
        let mut t = TripletList::new();
        t.add_triplet(0, 0, 1.0);
        t.add_triplet(1, 0, 1.0);
        t.set_next_free_index(1);
        t.add_triplet(1, 1, 1.0);
        t.add_triplet(2, 1, 2.0);
        t.set_next_free_index(2);
        t
    }

    #[test]
    fn test_build_hessian() {
        let h = build_hessian(3, &sample_triplets());
        // H = j0 j0^T + j1 j1^T
        let expected = [
            [1.0, 1.0, 0.0],
            [1.0, 2.0, 2.0],
            [0.0, 2.0, 4.0],
        ];
        for i in 0..3 {
            for j in 0..3 {
                assert!((h[(i, j)] - expected[i][j]).abs() < 1e-15);
            }
        }
    }

    #[test]
    fn test_factor_solve() {
        // H diagonal-dominant, well conditioned
        let mut t = TripletList::new();
        for i in 0..3 {
            t.add_triplet(i, i, 2.0);
            t.set_next_free_index(i + 1);
        }
        let factor = HessianFactor::factor(build_hessian(3, &t)).unwrap();
        let rhs = DVector::from_vec(vec![4.0, 8.0, 12.0]);
        let x = factor.solve(&rhs);
        assert!((x[0] - 1.0).abs() < 1e-12);
        assert!((x[1] - 2.0).abs() < 1e-12);
        assert!((x[2] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_singular_fails() {
        let mut t = TripletList::new();
        t.add_triplet(0, 0, 1.0);
        t.set_next_free_index(1);
        // parameter 1 is unconstrained: H is singular
        assert!(HessianFactor::factor(build_hessian(2, &t)).is_err());
    }

    #[test]
    fn test_downdate_matches_rebuild() {
        // full problem: three columns over two parameters
        let mut full = TripletList::new();
        let cols = [(0usize, 3.0, 1usize, 1.0), (0, 1.0, 1, 2.0), (0, 0.5, 1, -1.0)];
        for (k, &(r0, v0, r1, v1)) in cols.iter().enumerate() {
            full.add_triplet(r0, k, v0);
            full.add_triplet(r1, k, v1);
            full.set_next_free_index(k + 1);
        }
        let mut factor = HessianFactor::factor(build_hessian(2, &full)).unwrap();

        // remove the last column by downdate
        let mut outlier = TripletList::new();
        outlier.add_triplet(0, 0, 0.5);
        outlier.add_triplet(1, 0, -1.0);
        outlier.set_next_free_index(1);
        factor.downdate(&outlier).unwrap();

        // rebuild from the two remaining columns
        let mut reduced = TripletList::new();
        for (k, &(r0, v0, r1, v1)) in cols.iter().take(2).enumerate() {
            reduced.add_triplet(r0, k, v0);
            reduced.add_triplet(r1, k, v1);
            reduced.set_next_free_index(k + 1);
        }
        let rebuilt = HessianFactor::factor(build_hessian(2, &reduced)).unwrap();

        let rhs = DVector::from_vec(vec![1.0, -2.0]);
        let a = factor.solve(&rhs);
        let b = rebuilt.solve(&rhs);
        assert!((a[0] - b[0]).abs() < 1e-9);
        assert!((a[1] - b[1]).abs() < 1e-9);
    }
}
