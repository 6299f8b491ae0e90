//! Reconstruction error variance of a measured subset.
//!
//! Measuring rows `S` of `x = Ψβ + noise` (unit noise variance) and solving
//! the least-squares problem for `β` gives the estimator covariance
//! `(Ψᵀ CᵀC Ψ)⁻¹`. Propagated back through `Ψ`, the error variance at location
//! `j` is `ψ_jᵀ (Ψᵀ CᵀC Ψ)⁻¹ ψ_j`. The worst-case coordinate variance is the
//! maximum over all `n` locations, measured or not.

use nalgebra::{Cholesky, DMatrix, Dyn};

use crate::basis::LowRankBasis;
use crate::selection::SelectionMatrix;
use crate::{PlacementError, Result};

/// Smallest accepted ratio between the extreme eigenvalues of the Gram matrix.
const CONDITION_TOL: f64 = 1e-12;

/// Per-location error variance of a design.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VarianceReport {
    /// `V_j(S)` for every candidate location `j`.
    pub per_location: Vec<f64>,
    /// `max_j V_j(S)`.
    pub worst_case: f64,
    /// `false` when the Gram matrix was singular and a pseudo-inverse was used.
    /// The estimate then ignores the unobservable directions and is biased low.
    pub exact: bool,
}

impl VarianceReport {
    fn from_values(per_location: Vec<f64>, exact: bool) -> Self {
        let worst_case = per_location.iter().copied().fold(0.0, f64::max);
        Self {
            per_location,
            worst_case,
            exact,
        }
    }

    /// Location attaining the worst-case variance (lowest index on ties).
    pub fn worst_location(&self) -> Option<usize> {
        self.per_location
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
                Some((_, bv)) if bv >= v => best,
                _ => Some((i, v)),
            })
            .map(|(i, _)| i)
    }
}

/// Evaluates `V(S)` for a fixed basis.
#[derive(Debug, Clone, Copy)]
pub struct VarianceModel<'a> {
    basis: &'a LowRankBasis,
}

impl<'a> VarianceModel<'a> {
    /// Variance model over `basis`.
    pub fn new(basis: &'a LowRankBasis) -> Self {
        Self { basis }
    }

    /// `V(S)` through the exact inverse of `Ψᵀ C(S)ᵀ C(S) Ψ`.
    ///
    /// Fails with [`PlacementError::NumericalSingularity`] when `|S| < r` or the
    /// measured rows do not span the basis.
    pub fn exact(&self, selection: &SelectionMatrix) -> Result<VarianceReport> {
        self.check_candidates(selection)?;
        let r = self.basis.rank();
        let measured = selection.select_rows(self.basis.matrix())?;
        let singular = || PlacementError::NumericalSingularity {
            selected: selection.len(),
            rank: numerical_rank(&measured),
        };
        if selection.len() < r {
            return Err(singular());
        }

        let gram = measured.transpose() * &measured;
        let chol = factor(gram).ok_or_else(singular)?;
        let values = diag_quadratic(&chol, self.basis.matrix()).ok_or_else(singular)?;
        Ok(VarianceReport::from_values(values, true))
    }

    /// `V(S)`, falling back to the pseudo-inverse of the Gram matrix when it is
    /// singular. The fallback is flagged through [`VarianceReport::exact`].
    pub fn evaluate(&self, selection: &SelectionMatrix) -> Result<VarianceReport> {
        match self.exact(selection) {
            Ok(report) => Ok(report),
            Err(PlacementError::NumericalSingularity { selected, rank }) => {
                log::warn!(
                    "gram matrix of {selected} measured locations has rank {rank} < {}; \
                     variance estimated with a pseudo-inverse",
                    self.basis.rank()
                );
                Ok(self.pseudo_inverse(selection))
            }
            Err(e) => Err(e),
        }
    }

    /// `V` with every candidate location measured: the best achievable
    /// variance, against which thresholds are expressed.
    pub fn fully_monitored(&self) -> VarianceReport {
        let full = SelectionMatrix::full(self.basis.locations());
        // A validated basis has full column rank, so the exact path applies.
        self.exact(&full)
            .unwrap_or_else(|_| self.pseudo_inverse(&full))
    }

    /// `diag(Ψ M(h)⁻¹ Ψᵀ)` for the relaxed Fisher information
    /// `M(h) = Σ h_i ψ_i ψ_iᵀ`.
    ///
    /// Returns `None` when `M(h)` is not positive definite, i.e. the variance
    /// is unbounded.
    pub fn weighted(&self, h: &[f64]) -> Option<Vec<f64>> {
        debug_assert_eq!(h.len(), self.basis.locations());
        let chol = factor(self.basis.weighted_gram(h))?;
        diag_quadratic(&chol, self.basis.matrix())
    }

    fn pseudo_inverse(&self, selection: &SelectionMatrix) -> VarianceReport {
        let psi = self.basis.matrix();
        let r = self.basis.rank();
        // Candidates were checked by `exact`.
        let measured = psi.select_rows(selection.indices());
        let gram = measured.transpose() * &measured;
        let tol = CONDITION_TOL * gram.amax().max(1.0);
        let pinv = gram
            .pseudo_inverse(tol)
            .unwrap_or_else(|_| DMatrix::zeros(r, r));
        let projected = psi * pinv;
        let values = (0..psi.nrows())
            .map(|j| projected.row(j).dot(&psi.row(j)).max(0.0))
            .collect();
        VarianceReport::from_values(values, false)
    }

    fn check_candidates(&self, selection: &SelectionMatrix) -> Result<()> {
        if selection.candidates() != self.basis.locations() {
            return Err(PlacementError::config(
                "selection",
                format!(
                    "selection over {} candidates used with a basis of {} locations",
                    selection.candidates(),
                    self.basis.locations()
                ),
            ));
        }
        Ok(())
    }
}

/// Cholesky factor of a Gram matrix, or `None` if it is numerically singular.
pub(crate) fn factor(gram: DMatrix<f64>) -> Option<Cholesky<f64, Dyn>> {
    let chol = gram.cholesky()?;
    let diag = chol.l_dirty().diagonal();
    let (lo, hi) = (diag.min(), diag.max());
    if !(lo > 0.0) || (lo * lo) < CONDITION_TOL * hi * hi {
        return None;
    }
    Some(chol)
}

/// `diag(Ψ G⁻¹ Ψᵀ)` given the Cholesky factor of `G`: squared column norms of
/// `L⁻¹ Ψᵀ`.
pub(crate) fn diag_quadratic(chol: &Cholesky<f64, Dyn>, psi: &DMatrix<f64>) -> Option<Vec<f64>> {
    let y = chol.l_dirty().solve_lower_triangular(&psi.transpose())?;
    let values: Vec<f64> = y.column_iter().map(|c| c.norm_squared()).collect();
    values.iter().all(|v| v.is_finite()).then_some(values)
}

fn numerical_rank(measured: &DMatrix<f64>) -> usize {
    if measured.nrows() == 0 {
        return 0;
    }
    let tol = 1e-10 * measured.amax().max(1.0);
    measured.rank(tol)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_column(n: usize) -> LowRankBasis {
        let v = 1.0 / (n as f64).sqrt();
        LowRankBasis::new(DMatrix::from_element(n, 1, v)).unwrap()
    }

    #[test]
    fn fully_monitored_orthonormal_basis_is_leverage() {
        // For orthonormal Ψ, V_j(all) = ||ψ_j||².
        let b = uniform_column(5);
        let report = VarianceModel::new(&b).fully_monitored();
        assert!(report.exact);
        for v in &report.per_location {
            assert!((v - 0.2).abs() < 1e-12, "v = {v}");
        }
        assert!((report.worst_case - 0.2).abs() < 1e-12);
    }

    #[test]
    fn single_measurement_of_rank_one_basis() {
        let b = uniform_column(5);
        let s = SelectionMatrix::new([3], 5).unwrap();
        let report = VarianceModel::new(&b).exact(&s).unwrap();
        for v in &report.per_location {
            assert!((v - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn too_few_measurements_is_singular() {
        let b = LowRankBasis::new(DMatrix::identity(4, 2)).unwrap();
        let s = SelectionMatrix::new([0], 4).unwrap();
        let err = VarianceModel::new(&b).exact(&s).unwrap_err();
        assert_eq!(err, PlacementError::NumericalSingularity { selected: 1, rank: 1 });
        assert!(!err.is_fatal());
    }

    #[test]
    fn rank_deficient_rows_fall_back_to_pseudo_inverse() {
        // Rows 2 and 3 carry no information about the basis.
        let b = LowRankBasis::new(DMatrix::identity(4, 2)).unwrap();
        let s = SelectionMatrix::new([0, 2, 3], 4).unwrap();
        let model = VarianceModel::new(&b);
        assert!(model.exact(&s).is_err());
        let report = model.evaluate(&s).unwrap();
        assert!(!report.exact);
        assert!(report.per_location.iter().all(|v| v.is_finite() && *v >= 0.0));
        assert!((report.per_location[0] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn weighted_matches_exact_on_indicators() {
        let psi = DMatrix::from_row_slice(
            4,
            2,
            &[0.5, 0.5, 0.5, -0.5, 0.5, 0.5, 0.5, -0.5],
        );
        let b = LowRankBasis::new(psi).unwrap();
        let model = VarianceModel::new(&b);
        let s = SelectionMatrix::new([0, 1], 4).unwrap();
        let exact = model.exact(&s).unwrap();
        let weighted = model.weighted(&s.indicator()).unwrap();
        for (a, b) in exact.per_location.iter().zip(&weighted) {
            assert!((a - b).abs() < 1e-12);
        }
        assert!(model.weighted(&[0.0; 4]).is_none());
    }

    #[test]
    fn more_measurements_never_increase_variance() {
        let psi = DMatrix::from_row_slice(
            5,
            2,
            &[0.6, 0.1, 0.2, 0.7, 0.5, 0.3, 0.1, 0.4, 0.3, 0.2],
        );
        let b = LowRankBasis::new(psi).unwrap();
        let model = VarianceModel::new(&b);
        let small = model.exact(&SelectionMatrix::new([0, 1], 5).unwrap()).unwrap();
        let large = model
            .exact(&SelectionMatrix::new([0, 1, 3], 5).unwrap())
            .unwrap();
        for (s, l) in small.per_location.iter().zip(&large.per_location) {
            assert!(l <= &(s + 1e-12));
        }
    }

    #[test]
    fn worst_location_prefers_lowest_index() {
        let r = VarianceReport::from_values(vec![0.1, 0.3, 0.3], true);
        assert_eq!(r.worst_location(), Some(1));
    }
}
