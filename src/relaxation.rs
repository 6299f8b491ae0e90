//! Convex relaxations of the subset-selection problems.
//!
//! Both placers relax the binary "location `i` is monitored" indicator to
//! `h_i ∈ [0, 1]` and hand the resulting convex program to a
//! [`RelaxationSolver`]. The solver sees only the problem description and
//! returns the relaxed `h`; rounding and freezing stay with the placers.
//!
//! # D-optimal relaxation
//!
//! ```text
//!   maximize   log det M(h)        M(h) = Σ_i h_i ψ_i ψ_iᵀ
//!   subject to Σ_i h_i = k,  0 <= h_i <= 1
//! ```
//!
//! # Variance-constrained relaxation
//!
//! ```text
//!   minimize   Σ_{i free} w_i h_i
//!   subject to ψ_jᵀ M(h)⁻¹ ψ_j <= ρ   for all j
//!              0 <= h_i <= 1 (free),  h_i = 1 (monitored),  h_i = 0 (unmonitored)
//! ```
//!
//! The variance constraint is the Schur complement of the linear matrix
//! inequality `[[M(h), ψ_j], [ψ_jᵀ, ρ]] ⪰ 0`. Each `ψ_jᵀ M(h)⁻¹ ψ_j` is convex
//! and non-increasing in `h`, so the relaxation is feasible exactly when it is
//! feasible with every free location set to 1.

use crate::basis::LowRankBasis;
use crate::variance::VarianceModel;
use crate::{PlacementError, Result};

/// Relative slack required between the worst-case variance and `ρ` for a
/// point to count as strictly feasible; also the relative tolerance within
/// which a variance counts as meeting `ρ`.
pub(crate) const FEASIBILITY_MARGIN: f64 = 1e-9;

/// `worst <= ρ`, up to [`FEASIBILITY_MARGIN`].
pub(crate) fn within_threshold(worst: f64, threshold: f64) -> bool {
    worst <= threshold * (1.0 + FEASIBILITY_MARGIN)
}

/// A convex-relaxation backend: objective and constraints in, relaxed `h` out.
pub trait RelaxationSolver {
    /// Solve the D-optimal (log-det) relaxation.
    fn solve_d_optimal(&self, problem: &DOptimalProblem<'_>) -> Result<RelaxedSolution>;

    /// Solve the weighted-ℓ1, variance-constrained relaxation.
    fn solve_variance(&self, problem: &VarianceProblem<'_>) -> Result<RelaxedSolution>;
}

/// Output of a relaxation solve.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RelaxedSolution {
    /// Relaxed indicator over all `n` locations; fixed entries hold their
    /// fixed value.
    pub h: Vec<f64>,
    /// Objective value at `h` (log-det, or weighted ℓ1).
    pub objective: f64,
    /// Inner iterations spent (gradient steps or Newton steps).
    pub iterations: usize,
}

/// Status of a location inside a variance-constrained relaxation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Assignment {
    /// `h_i` is a decision variable in `[0, 1]`.
    Free,
    /// Fixed at `h_i = 1`.
    Monitored,
    /// Fixed at `h_i = 0`.
    Unmonitored,
}

/// `max log det M(h)` over the capped simplex `{0 <= h <= 1, Σh = k}`.
#[derive(Debug, Clone, Copy)]
pub struct DOptimalProblem<'a> {
    basis: &'a LowRankBasis,
    budget: usize,
}

impl<'a> DOptimalProblem<'a> {
    /// Requires `r <= budget <= n`; fewer than `r` sensors cannot make `M(h)`
    /// invertible after rounding.
    pub fn new(basis: &'a LowRankBasis, budget: usize) -> Result<Self> {
        let (n, r) = (basis.locations(), basis.rank());
        if budget < r || budget > n {
            return Err(PlacementError::config(
                "sensor budget",
                format!("must be in {r}..={n} (basis rank ..= locations), got {budget}"),
            ));
        }
        Ok(Self { basis, budget })
    }

    /// The basis the problem is posed over.
    pub fn basis(&self) -> &'a LowRankBasis {
        self.basis
    }

    /// Number of sensors `k` to place.
    pub fn budget(&self) -> usize {
        self.budget
    }
}

/// Weighted-ℓ1 minimization under the worst-case variance constraint.
#[derive(Debug, Clone, Copy)]
pub struct VarianceProblem<'a> {
    basis: &'a LowRankBasis,
    threshold: f64,
    weights: &'a [f64],
    assignment: &'a [Assignment],
}

impl<'a> VarianceProblem<'a> {
    pub fn new(
        basis: &'a LowRankBasis,
        threshold: f64,
        weights: &'a [f64],
        assignment: &'a [Assignment],
    ) -> Result<Self> {
        let n = basis.locations();
        if !(threshold.is_finite() && threshold > 0.0) {
            return Err(PlacementError::config(
                "variance threshold",
                format!("must be positive and finite, got {threshold}"),
            ));
        }
        if weights.len() != n || assignment.len() != n {
            return Err(PlacementError::config(
                "relaxation",
                format!(
                    "expected {n} weights and assignments, got {} and {}",
                    weights.len(),
                    assignment.len()
                ),
            ));
        }
        if let Some(w) = weights.iter().find(|w| !(w.is_finite() && **w > 0.0)) {
            return Err(PlacementError::config(
                "reweighting vector",
                format!("weights must be positive and finite, got {w}"),
            ));
        }
        Ok(Self {
            basis,
            threshold,
            weights,
            assignment,
        })
    }

    pub fn basis(&self) -> &'a LowRankBasis {
        self.basis
    }

    /// Absolute variance threshold `ρ`.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Reweighting weights `w` of the ℓ1 objective.
    pub fn weights(&self) -> &'a [f64] {
        self.weights
    }

    /// Per-location decision state.
    pub fn assignment(&self) -> &'a [Assignment] {
        self.assignment
    }

    /// Indices of the decision variables, ascending.
    pub fn free_indices(&self) -> Vec<usize> {
        self.assignment
            .iter()
            .enumerate()
            .filter_map(|(i, a)| (*a == Assignment::Free).then_some(i))
            .collect()
    }

    /// `h` with monitored entries at 1 and everything else at 0.
    pub fn fixed_indicator(&self) -> Vec<f64> {
        self.assignment
            .iter()
            .map(|a| if *a == Assignment::Monitored { 1.0 } else { 0.0 })
            .collect()
    }

    /// `h` with every location that is not unmonitored set to 1.
    pub fn saturated_indicator(&self) -> Vec<f64> {
        self.assignment
            .iter()
            .map(|a| if *a == Assignment::Unmonitored { 0.0 } else { 1.0 })
            .collect()
    }

    /// Worst-case variance with every free location measured, the best the
    /// relaxation can reach.
    ///
    /// Errors with [`PlacementError::SolverInfeasible`] when even that point
    /// exceeds the threshold.
    pub fn check_feasible(&self) -> Result<f64> {
        feasible_worst_case(self.basis, &self.saturated_indicator(), self.threshold)
    }

    /// Whether a worst-case variance leaves room for an interior point, i.e.
    /// the constraint can be met without measuring every free location.
    pub fn is_strictly_feasible(&self, worst: f64) -> bool {
        worst < self.threshold * (1.0 - FEASIBILITY_MARGIN)
    }
}

/// Worst-case `V(h)`, or `∞` when `M(h)` is singular.
pub(crate) fn worst_case(basis: &LowRankBasis, h: &[f64]) -> f64 {
    VarianceModel::new(basis)
        .weighted(h)
        .map(|v| v.into_iter().fold(0.0, f64::max))
        .unwrap_or(f64::INFINITY)
}

/// Worst-case `V(h)` if it meets `threshold`, otherwise
/// [`PlacementError::SolverInfeasible`].
pub(crate) fn feasible_worst_case(basis: &LowRankBasis, h: &[f64], threshold: f64) -> Result<f64> {
    let worst = worst_case(basis, h);
    if within_threshold(worst, threshold) {
        Ok(worst)
    } else {
        Err(PlacementError::SolverInfeasible {
            worst_variance: worst,
            threshold,
        })
    }
}

/// Euclidean projection of `y` onto `{h : 0 <= h_i <= 1, Σ h_i = total}`.
///
/// The projection is `h_i = clamp(y_i - τ, 0, 1)` for the shift `τ` solving
/// `Σ clamp(y_i - τ, 0, 1) = total`; the sum is monotone in `τ`, so `τ` is
/// found by bisection.
pub(crate) fn project_capped_simplex(y: &[f64], total: f64) -> Vec<f64> {
    debug_assert!(total >= 0.0 && total <= y.len() as f64);
    let mass = |tau: f64| -> f64 { y.iter().map(|&v| (v - tau).clamp(0.0, 1.0)).sum() };

    let hi_y = y.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let lo_y = y.iter().copied().fold(f64::INFINITY, f64::min);
    // mass(lo) = n >= total, mass(hi) = 0 <= total.
    let (mut lo, mut hi) = (lo_y - 1.0, hi_y);
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if mass(mid) > total {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= 1e-15 * (1.0 + hi.abs()) {
            break;
        }
    }
    let tau = 0.5 * (lo + hi);
    y.iter().map(|&v| (v - tau).clamp(0.0, 1.0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    #[test]
    fn projection_hits_the_budget() {
        let y = [0.3, 2.0, -1.0, 0.9, 0.4];
        let h = project_capped_simplex(&y, 2.0);
        let sum: f64 = h.iter().sum();
        assert!((sum - 2.0).abs() < 1e-9, "sum = {sum}");
        assert!(h.iter().all(|&v| (0.0..=1.0).contains(&v)));
        // The largest entry saturates, the smallest is clipped to zero.
        assert_eq!(h[1], 1.0);
        assert_eq!(h[2], 0.0);
    }

    #[test]
    fn projection_is_identity_on_feasible_points() {
        let y = [0.25, 0.75, 0.5, 0.5];
        let h = project_capped_simplex(&y, 2.0);
        for (a, b) in y.iter().zip(&h) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn budget_outside_rank_and_size_is_rejected() {
        let b = LowRankBasis::new(DMatrix::identity(5, 2)).unwrap();
        assert!(DOptimalProblem::new(&b, 1).is_err());
        assert!(DOptimalProblem::new(&b, 6).is_err());
        assert_eq!(DOptimalProblem::new(&b, 5).unwrap().budget(), 5);
    }

    #[test]
    fn feasibility_is_decided_with_all_free_locations_measured() {
        let b = LowRankBasis::new(DMatrix::from_element(4, 1, 0.5)).unwrap();
        let w = [1.0; 4];
        // Fully monitored variance is 0.25; excluding one location gives 1/3.
        let assign = [
            Assignment::Free,
            Assignment::Free,
            Assignment::Free,
            Assignment::Unmonitored,
        ];
        let ok = VarianceProblem::new(&b, 0.4, &w, &assign).unwrap();
        assert!((ok.check_feasible().unwrap() - 1.0 / 3.0).abs() < 1e-12);

        let tight = VarianceProblem::new(&b, 0.3, &w, &assign).unwrap();
        assert!(matches!(
            tight.check_feasible(),
            Err(PlacementError::SolverInfeasible { .. })
        ));
    }

    #[test]
    fn threshold_equal_to_best_variance_is_feasible_on_the_boundary() {
        let b = LowRankBasis::new(DMatrix::from_element(4, 1, 0.5)).unwrap();
        let w = [1.0; 4];
        let assign = [Assignment::Free; 4];
        // Every location measured gives exactly 0.25.
        let edge = VarianceProblem::new(&b, 0.25, &w, &assign).unwrap();
        let worst = edge.check_feasible().unwrap();
        assert!((worst - 0.25).abs() < 1e-12);
        assert!(!edge.is_strictly_feasible(worst));

        let loose = VarianceProblem::new(&b, 0.3, &w, &assign).unwrap();
        assert!(loose.is_strictly_feasible(loose.check_feasible().unwrap()));
        assert!(within_threshold(0.25 * (1.0 + 1e-12), 0.25));
        assert!(!within_threshold(0.2501, 0.25));
    }

    #[test]
    fn non_positive_weights_are_rejected() {
        let b = LowRankBasis::new(DMatrix::from_element(2, 1, 0.5_f64.sqrt())).unwrap();
        let assign = [Assignment::Free; 2];
        assert!(VarianceProblem::new(&b, 1.0, &[1.0, 0.0], &assign).is_err());
        assert!(VarianceProblem::new(&b, -1.0, &[1.0, 1.0], &assign).is_err());
        assert!(VarianceProblem::new(&b, 1.0, &[1.0], &assign).is_err());
    }
}
