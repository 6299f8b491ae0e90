//! The low-rank basis `Ψ` consumed by the placement engine.

use nalgebra::{DMatrix, DVector};

use crate::{PlacementError, Result};

/// Relative tolerance used to decide that `Ψ` has full column rank.
const RANK_TOL: f64 = 1e-10;

/// A validated `n × r` basis matrix, optionally carrying the training mean.
///
/// Rows are candidate locations, columns are basis vectors. The engine never
/// mutates the basis.
#[derive(Debug, Clone)]
pub struct LowRankBasis {
    psi: DMatrix<f64>,
    mean: Option<DVector<f64>>,
}

impl LowRankBasis {
    /// Wrap `psi`, checking that it is non-empty, finite, has `r <= n` and
    /// full column rank.
    pub fn new(psi: DMatrix<f64>) -> Result<Self> {
        let (n, r) = psi.shape();
        if n == 0 || r == 0 {
            return Err(PlacementError::config(
                "basis",
                format!("basis must be non-empty, got {n}x{r}"),
            ));
        }
        if r > n {
            return Err(PlacementError::config(
                "basis",
                format!("rank {r} exceeds the number of locations {n}"),
            ));
        }
        if let Some(pos) = psi.iter().position(|v| !v.is_finite()) {
            // Column-major storage.
            return Err(PlacementError::config(
                "basis",
                format!("entry ({}, {}) is not finite", pos % n, pos / n),
            ));
        }

        let gram = psi.transpose() * &psi;
        let scale = gram.diagonal().max();
        let min_eig = gram.symmetric_eigenvalues().min();
        if scale <= 0.0 || min_eig <= RANK_TOL * scale {
            return Err(PlacementError::config(
                "basis",
                "basis columns are linearly dependent",
            ));
        }
        let off = (&gram - DMatrix::identity(r, r)).amax();
        if off > 1e-6 {
            log::debug!("basis columns are not orthonormal (max |ΨᵀΨ - I| = {off:.3e})");
        }

        Ok(Self { psi, mean: None })
    }

    /// Keep the leading `sparsity` columns of a left-singular-vector matrix.
    ///
    /// This is how a basis is normally built: `Ψ = U[:, ..r]`.
    pub fn from_singular_vectors(u: &DMatrix<f64>, sparsity: usize) -> Result<Self> {
        if sparsity == 0 || sparsity > u.ncols() {
            return Err(PlacementError::config(
                "signal sparsity",
                format!(
                    "must be in 1..={} for a matrix with {} columns, got {sparsity}",
                    u.ncols(),
                    u.ncols()
                ),
            ));
        }
        Self::new(u.columns(0, sparsity).into_owned())
    }

    /// Attach the training-set mean (length `n`) used to un-center
    /// reconstructions.
    pub fn with_mean(mut self, mean: DVector<f64>) -> Result<Self> {
        if mean.len() != self.locations() {
            return Err(PlacementError::config(
                "mean",
                format!(
                    "length {} does not match {} locations",
                    mean.len(),
                    self.locations()
                ),
            ));
        }
        if mean.iter().any(|v| !v.is_finite()) {
            return Err(PlacementError::config("mean", "contains non-finite values"));
        }
        self.mean = Some(mean);
        Ok(self)
    }

    /// Number of candidate locations `n`.
    pub fn locations(&self) -> usize {
        self.psi.nrows()
    }

    /// Basis rank `r` (signal sparsity).
    pub fn rank(&self) -> usize {
        self.psi.ncols()
    }

    /// The `n × r` basis matrix `Ψ`.
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.psi
    }

    /// Training-set mean, if one was attached.
    pub fn mean(&self) -> Option<&DVector<f64>> {
        self.mean.as_ref()
    }

    /// Row `i` of `Ψ` as a column vector `ψ_i`.
    pub fn row(&self, i: usize) -> DVector<f64> {
        self.psi.row(i).transpose()
    }

    /// `Σ_i weights[i] ψ_i ψ_iᵀ`, the weighted Fisher information (`r × r`).
    pub fn weighted_gram(&self, weights: &[f64]) -> DMatrix<f64> {
        debug_assert_eq!(weights.len(), self.locations());
        let r = self.rank();
        let mut gram = DMatrix::zeros(r, r);
        for (i, &w) in weights.iter().enumerate() {
            if w == 0.0 {
                continue;
            }
            let row = self.psi.row(i);
            gram.ger(w, &row.transpose(), &row.transpose(), 1.0);
        }
        gram
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wide_basis() {
        let err = LowRankBasis::new(DMatrix::identity(2, 3)).unwrap_err();
        assert!(matches!(err, PlacementError::Configuration { parameter: "basis", .. }));
    }

    #[test]
    fn rejects_non_finite_entries() {
        let mut psi = DMatrix::identity(4, 2);
        psi[(2, 1)] = f64::NAN;
        let err = LowRankBasis::new(psi).unwrap_err();
        assert_eq!(
            err,
            PlacementError::Configuration {
                parameter: "basis",
                reason: "entry (2, 1) is not finite".into()
            }
        );
    }

    #[test]
    fn rejects_dependent_columns() {
        let psi = DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 1.0, 2.0, 0.0, 0.0]);
        assert!(LowRankBasis::new(psi).is_err());
    }

    #[test]
    fn truncation_keeps_leading_columns() {
        let u = DMatrix::<f64>::identity(5, 5);
        let b = LowRankBasis::from_singular_vectors(&u, 2).unwrap();
        assert_eq!(b.rank(), 2);
        assert_eq!(b.locations(), 5);
        assert_eq!(b.matrix()[(1, 1)], 1.0);
        assert!(LowRankBasis::from_singular_vectors(&u, 6).is_err());
        assert!(LowRankBasis::from_singular_vectors(&u, 0).is_err());
    }

    #[test]
    fn weighted_gram_matches_dense_product() {
        let psi = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.5, 0.5, 0.0, 2.0]);
        let b = LowRankBasis::new(psi.clone()).unwrap();
        let w = [0.5, 1.0, 0.25];
        let dense = psi.transpose() * DMatrix::from_diagonal(&DVector::from_column_slice(&w)) * &psi;
        assert!((b.weighted_gram(&w) - dense).amax() < 1e-12);
    }

    #[test]
    fn mean_length_is_checked() {
        let b = LowRankBasis::new(DMatrix::identity(3, 1)).unwrap();
        assert!(b.clone().with_mean(DVector::zeros(2)).is_err());
        assert!(b.with_mean(DVector::zeros(3)).unwrap().mean().is_some());
    }
}
