//! Field reconstruction from a monitored subset, and error statistics.
//!
//! Given measurements `y = C(S) x` the basis coefficients are recovered by
//! least squares, `β = (C Ψ)⁺ (y - C μ)`, and the field is `x̂ = Ψ β + μ`
//! (`μ` is the training mean when the basis carries one, zero otherwise).

use nalgebra::{DMatrix, DVector};

use crate::basis::LowRankBasis;
use crate::selection::SelectionMatrix;
use crate::{PlacementError, Result};

/// Relative singular-value cutoff of the pseudo-inverse.
const SVD_TOL: f64 = 1e-10;

/// Least-squares reconstructor for a fixed basis and monitored set.
#[derive(Debug, Clone)]
pub struct Reconstructor<'a> {
    basis: &'a LowRankBasis,
    selection: SelectionMatrix,
    /// `(C Ψ)⁺`, `r × |S|`.
    pinv: DMatrix<f64>,
    rank: usize,
}

impl<'a> Reconstructor<'a> {
    /// Precompute the least-squares operator for `selection`.
    pub fn new(basis: &'a LowRankBasis, selection: &SelectionMatrix) -> Result<Self> {
        if selection.candidates() != basis.locations() {
            return Err(PlacementError::config(
                "selection",
                format!(
                    "selection over {} candidates used with a basis of {} locations",
                    selection.candidates(),
                    basis.locations()
                ),
            ));
        }
        let measured = selection.select_rows(basis.matrix())?;
        let r = basis.rank();
        let (pinv, rank) = if selection.is_empty() {
            (DMatrix::zeros(r, 0), 0)
        } else {
            let svd = measured.svd(true, true);
            let tol = SVD_TOL * svd.singular_values.max().max(f64::MIN_POSITIVE);
            let rank = svd.rank(tol);
            let pinv = svd
                .pseudo_inverse(tol)
                .map_err(|e| PlacementError::SolverFailed {
                    reason: format!("pseudo-inverse of measured basis rows: {e}"),
                })?;
            (pinv, rank)
        };
        if rank < r {
            log::warn!(
                "measured rows span {rank} of {r} basis directions; \
                 reconstruction is a minimum-norm estimate"
            );
        }
        Ok(Self {
            basis,
            selection: selection.clone(),
            pinv,
            rank,
        })
    }

    /// Whether `C Ψ` has full column rank, so signals in `span(Ψ)` are
    /// recovered exactly.
    pub fn is_exact(&self) -> bool {
        self.rank == self.basis.rank()
    }

    /// The monitored locations measurements are read from.
    pub fn selection(&self) -> &SelectionMatrix {
        &self.selection
    }

    /// Basis coefficients `β` for one vector of `|S|` measurements, ordered
    /// as [`SelectionMatrix::indices`].
    pub fn coefficients(&self, measurements: &DVector<f64>) -> Result<DVector<f64>> {
        if measurements.len() != self.selection.len() {
            return Err(PlacementError::config(
                "measurements",
                format!(
                    "expected {} values, got {}",
                    self.selection.len(),
                    measurements.len()
                ),
            ));
        }
        let mut centered = measurements.clone();
        if let Some(mean) = self.basis.mean() {
            for (y, &i) in centered.iter_mut().zip(self.selection.indices()) {
                *y -= mean[i];
            }
        }
        Ok(&self.pinv * centered)
    }

    /// Reconstruct the full `n`-vector from `|S|` measurements.
    pub fn reconstruct(&self, measurements: &DVector<f64>) -> Result<DVector<f64>> {
        let beta = self.coefficients(measurements)?;
        let mut x = self.basis.matrix() * beta;
        if let Some(mean) = self.basis.mean() {
            x += mean;
        }
        Ok(x)
    }

    /// Reconstruct every column of an `n × T` snapshot matrix from its
    /// monitored rows.
    pub fn reconstruct_snapshots(&self, snapshots: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        let n = self.basis.locations();
        if snapshots.nrows() != n {
            return Err(PlacementError::config(
                "snapshots",
                format!("expected {n} rows, got {}", snapshots.nrows()),
            ));
        }
        let mut measured = self.selection.select_rows(snapshots)?;
        if let Some(mean) = self.basis.mean() {
            for (row, &i) in self.selection.indices().iter().enumerate() {
                measured.row_mut(row).add_scalar_mut(-mean[i]);
            }
        }
        let mut out = self.basis.matrix() * (&self.pinv * measured);
        if let Some(mean) = self.basis.mean() {
            for mut col in out.column_iter_mut() {
                col += mean;
            }
        }
        Ok(out)
    }
}

fn check_shapes(truth: &DMatrix<f64>, estimate: &DMatrix<f64>) -> Result<()> {
    if truth.shape() != estimate.shape() {
        return Err(PlacementError::config(
            "snapshots",
            format!(
                "truth is {:?} but estimate is {:?}",
                truth.shape(),
                estimate.shape()
            ),
        ));
    }
    if truth.nrows() == 0 {
        return Err(PlacementError::config("snapshots", "no locations"));
    }
    Ok(())
}

/// Root-mean-square error over locations, one value per snapshot (column).
pub fn rmse_per_snapshot(truth: &DMatrix<f64>, estimate: &DMatrix<f64>) -> Result<Vec<f64>> {
    check_shapes(truth, estimate)?;
    let n = truth.nrows() as f64;
    Ok((truth - estimate)
        .column_iter()
        .map(|c| (c.norm_squared() / n).sqrt())
        .collect())
}

/// Empirical variance of the reconstruction error at each location across
/// snapshots (sample variance, `T - 1` denominator).
pub fn error_variance(truth: &DMatrix<f64>, estimate: &DMatrix<f64>) -> Result<DVector<f64>> {
    check_shapes(truth, estimate)?;
    let t = truth.ncols();
    if t < 2 {
        return Err(PlacementError::config(
            "snapshots",
            format!("sample variance needs at least 2 snapshots, got {t}"),
        ));
    }
    let error = truth - estimate;
    Ok(DVector::from_iterator(
        error.nrows(),
        error.row_iter().map(|row| {
            let mean = row.mean();
            row.iter().map(|e| (e - mean) * (e - mean)).sum::<f64>() / (t - 1) as f64
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basis() -> LowRankBasis {
        let psi = DMatrix::from_row_slice(
            4,
            2,
            &[0.5, 0.5, 0.5, -0.5, 0.5, 0.5, 0.5, -0.5],
        );
        LowRankBasis::new(psi).unwrap()
    }

    #[test]
    fn signal_in_span_is_recovered_exactly() {
        let b = basis();
        let beta = DVector::from_column_slice(&[2.0, -1.0]);
        let x = b.matrix() * &beta;
        let s = SelectionMatrix::new([0, 1], 4).unwrap();
        let rec = Reconstructor::new(&b, &s).unwrap();
        assert!(rec.is_exact());
        let y = DVector::from_column_slice(&[x[0], x[1]]);
        let x_hat = rec.reconstruct(&y).unwrap();
        assert!((x_hat - x).amax() < 1e-12);
    }

    #[test]
    fn mean_is_removed_and_restored() {
        let mean = DVector::from_column_slice(&[10.0, 20.0, 30.0, 40.0]);
        let b = basis().with_mean(mean.clone()).unwrap();
        let s = SelectionMatrix::new([2, 3], 4).unwrap();
        let rec = Reconstructor::new(&b, &s).unwrap();
        // Measuring the mean exactly reconstructs the mean.
        let y = DVector::from_column_slice(&[30.0, 40.0]);
        assert!((rec.reconstruct(&y).unwrap() - mean).amax() < 1e-12);
    }

    #[test]
    fn snapshots_match_column_by_column() {
        let b = basis();
        let snapshots = DMatrix::from_fn(4, 3, |i, j| (i as f64) * 0.3 - (j as f64));
        let s = SelectionMatrix::new([0, 1, 3], 4).unwrap();
        let rec = Reconstructor::new(&b, &s).unwrap();
        let batch = rec.reconstruct_snapshots(&snapshots).unwrap();
        for j in 0..3 {
            let col = snapshots.column(j);
            let y = DVector::from_iterator(3, s.indices().iter().map(|&i| col[i]));
            let single = rec.reconstruct(&y).unwrap();
            assert!((batch.column(j) - single).amax() < 1e-12);
        }
    }

    #[test]
    fn underdetermined_selection_is_flagged() {
        let b = basis();
        let s = SelectionMatrix::new([0, 2], 4).unwrap();
        let rec = Reconstructor::new(&b, &s).unwrap();
        assert!(!rec.is_exact());
        assert!(rec.reconstruct(&DVector::zeros(3)).is_err());
    }

    #[test]
    fn rmse_and_error_variance() {
        let truth = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
        let estimate = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 5.0, 0.0, 2.0, 0.0]);
        let rmse = rmse_per_snapshot(&truth, &estimate).unwrap();
        assert_eq!(rmse[0], 0.0);
        assert!((rmse[1] - 2.0_f64.sqrt()).abs() < 1e-12);
        assert!((rmse[2] - 2.0_f64.sqrt()).abs() < 1e-12);

        // Errors at location 0: [0, 0, -2]; at location 1: [0, -2, 0].
        let var = error_variance(&truth, &estimate).unwrap();
        assert!((var[0] - 4.0 / 3.0).abs() < 1e-12);
        assert!((var[1] - 4.0 / 3.0).abs() < 1e-12);

        assert!(error_variance(&truth.columns(0, 1).into_owned(), &estimate.columns(0, 1).into_owned()).is_err());
        assert!(rmse_per_snapshot(&truth, &DMatrix::zeros(3, 3)).is_err());
    }
}
