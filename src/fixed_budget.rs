//! D-optimal placement with a fixed sensor budget.

use crate::basis::LowRankBasis;
use crate::relaxation::{DOptimalProblem, RelaxationSolver};
use crate::selection::SelectionMatrix;
use crate::solver::InteriorPointSolver;
use crate::variance::{VarianceModel, VarianceReport};
use crate::Result;

/// Result of a fixed-budget placement.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FixedBudgetPlacement {
    /// The `k` monitored locations, ascending.
    pub monitored: Vec<usize>,
    /// The remaining `n - k` locations, ascending.
    pub unmonitored: Vec<usize>,
    /// Relaxed indicator before rounding.
    pub relaxed: Vec<f64>,
    /// `log det M(h)` at the relaxed optimum, an upper bound on
    /// `log det(Ψᵀ CᵀC Ψ)` over all `k`-subsets.
    pub relaxed_log_det: f64,
    pub variance: VarianceReport,
}

/// Chooses exactly `k` locations by relaxing `max log det(Ψᵀ CᵀC Ψ)` and
/// keeping the `k` largest relaxed entries.
#[derive(Debug, Clone)]
pub struct FixedBudgetPlacer<S = InteriorPointSolver> {
    solver: S,
}

impl Default for FixedBudgetPlacer<InteriorPointSolver> {
    fn default() -> Self {
        Self::new(InteriorPointSolver::default())
    }
}

impl<S: RelaxationSolver> FixedBudgetPlacer<S> {
    /// Placer backed by `solver`.
    pub fn new(solver: S) -> Self {
        Self { solver }
    }

    /// The relaxation solver in use.
    pub fn solver(&self) -> &S {
        &self.solver
    }

    /// Place `sensors` sensors; requires `r <= sensors <= n`.
    pub fn place(&self, basis: &LowRankBasis, sensors: usize) -> Result<FixedBudgetPlacement> {
        let problem = DOptimalProblem::new(basis, sensors)?;
        let solution = self.solver.solve_d_optimal(&problem)?;
        log::debug!(
            "D-optimal relaxation: log det {:.6} after {} iterations",
            solution.objective,
            solution.iterations
        );

        let selection = SelectionMatrix::new(top_k(&solution.h, sensors), basis.locations())?;
        let variance = VarianceModel::new(basis).evaluate(&selection)?;
        if !variance.exact {
            log::warn!(
                "rounded design of {sensors} locations does not span the basis; \
                 reported variance is approximate"
            );
        }

        Ok(FixedBudgetPlacement {
            monitored: selection.indices().to_vec(),
            unmonitored: selection.complement(),
            relaxed: solution.h,
            relaxed_log_det: solution.objective,
            variance,
        })
    }
}

/// Indices of the `k` largest entries, lowest index first on ties.
fn top_k(h: &[f64], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..h.len()).collect();
    order.sort_by(|&a, &b| h[b].total_cmp(&h[a]).then(a.cmp(&b)));
    order.truncate(k);
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PlacementError;
    use nalgebra::DMatrix;

    fn placer() -> FixedBudgetPlacer {
        FixedBudgetPlacer::default()
    }

    #[test]
    fn top_k_breaks_ties_by_index() {
        assert_eq!(top_k(&[0.5, 0.9, 0.5, 0.5], 2), vec![1, 0]);
        assert_eq!(top_k(&[0.2, 0.2, 0.2], 3), vec![0, 1, 2]);
    }

    #[test]
    fn picks_the_informative_rows() {
        // Rows 0 and 3 carry the two basis directions; the rest are weak.
        let mut psi = DMatrix::from_element(6, 2, 0.05);
        psi[(0, 0)] = 1.0;
        psi[(3, 1)] = 1.0;
        let basis = LowRankBasis::new(psi).unwrap();
        let placement = placer().place(&basis, 2).unwrap();
        assert_eq!(placement.monitored, vec![0, 3]);
        assert_eq!(placement.unmonitored, vec![1, 2, 4, 5]);
        assert!(placement.variance.exact);
        assert!(placement.variance.worst_case.is_finite());
    }

    #[test]
    fn budget_equal_to_n_monitors_everything() {
        let basis = LowRankBasis::new(DMatrix::identity(4, 2)).unwrap();
        let placement = placer().place(&basis, 4).unwrap();
        assert_eq!(placement.monitored, vec![0, 1, 2, 3]);
        assert!(placement.unmonitored.is_empty());
    }

    #[test]
    fn budget_below_rank_is_a_configuration_error() {
        let basis = LowRankBasis::new(DMatrix::identity(4, 3)).unwrap();
        let err = placer().place(&basis, 2).unwrap_err();
        assert!(matches!(err, PlacementError::Configuration { .. }));
    }
}
