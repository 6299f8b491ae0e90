//! Sensor network design under a low-rank signal model.
//!
//! A spatial field over `n` candidate locations is modelled as `x = Ψ β`, where
//! `Ψ` is an `n × r` basis (typically the leading left singular vectors of a
//! centered training snapshot matrix). Measuring a subset `S` of locations and
//! regressing the basis coefficients gives a reconstruction whose error
//! variance at location `j` is
//!
//! ```text
//!   V_j(S) = ψ_jᵀ (Ψᵀ C(S)ᵀ C(S) Ψ)⁻¹ ψ_j
//! ```
//!
//! with `C(S)` the row-selection operator. Two placement strategies are
//! provided:
//!
//! - [`FixedBudgetPlacer`]: choose exactly `k` locations maximizing the
//!   D-optimality surrogate `log det(Ψᵀ CᵀC Ψ)` (one convex relaxation, then
//!   rounding).
//! - [`IterativePlacer`]: grow the network without a budget until the
//!   worst-case variance is below `ρ`, by iteratively reweighted ℓ1 network
//!   design (IRL1ND).
//!
//! [`NetworkPlanner`] validates a configuration, dispatches to one of them and
//! returns the final monitored/unmonitored partition.
//!
//! ```rust
//! use nalgebra::DMatrix;
//! use netdesign::{LowRankBasis, NetworkPlanner, PlannerConfig};
//!
//! // Two basis vectors over six locations, concentrated on locations 0 and 1.
//! let psi = DMatrix::identity(6, 2);
//! let basis = LowRankBasis::new(psi).unwrap();
//!
//! let design = NetworkPlanner::new(basis, PlannerConfig::fixed_budget(2))
//!     .plan()
//!     .unwrap();
//! assert_eq!(design.monitored, vec![0, 1]);
//! assert!(design.variance.worst_case.is_finite());
//! ```

use thiserror::Error;

pub mod basis;
pub mod fixed_budget;
pub mod iterative;
pub mod planner;
pub mod reconstruct;
pub mod relaxation;
pub mod selection;
pub mod solver;
pub mod variance;

pub use basis::LowRankBasis;
pub use fixed_budget::{FixedBudgetPlacement, FixedBudgetPlacer};
pub use iterative::{
    forced_freeze_candidate, IterativeConfig, IterativePlacement, IterativePlacer, OuterStep,
    StepKind, WarmStart,
};
pub use planner::{
    CancellationToken, NetworkDesign, NetworkPlanner, PlannerConfig, RunLimits, Strategy,
    StrategyKind,
};
pub use reconstruct::{error_variance, rmse_per_snapshot, Reconstructor};
pub use relaxation::{DOptimalProblem, RelaxationSolver, RelaxedSolution, VarianceProblem};
pub use selection::SelectionMatrix;
pub use solver::{InteriorPointSolver, SolverSettings};
pub use variance::{VarianceModel, VarianceReport};

/// Errors returned by the placement engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlacementError {
    /// A parameter or input failed validation before any solver call.
    #[error("invalid {parameter}: {reason}")]
    Configuration {
        parameter: &'static str,
        reason: String,
    },
    /// A location index was not in `0..n`.
    #[error("location index {index} out of range for {n} candidate locations")]
    IndexOutOfRange { index: usize, n: usize },
    /// The Gram matrix of the measured rows is not invertible.
    #[error("gram matrix of {selected} measured locations is singular (numerical rank {rank})")]
    NumericalSingularity { selected: usize, rank: usize },
    /// The convex relaxation has no strictly feasible point.
    #[error(
        "relaxation infeasible: best achievable worst-case variance {worst_variance:.6e} \
         does not satisfy threshold {threshold:.6e}"
    )]
    SolverInfeasible { worst_variance: f64, threshold: f64 },
    /// The solver produced non-finite iterates or ran out of iterations.
    #[error("relaxation solver failed: {reason}")]
    SolverFailed { reason: String },
    /// The iterative placer hit its outer-iteration cap.
    #[error("placement did not terminate after {outer_iterations} outer iterations ({decided}/{n} locations decided)")]
    NonTermination {
        outer_iterations: usize,
        decided: usize,
        n: usize,
    },
    /// The run was cancelled between outer iterations.
    #[error("placement cancelled after {outer_iterations} outer iterations")]
    Cancelled { outer_iterations: usize },
    /// The wall-clock deadline passed between outer iterations.
    #[error("placement deadline exceeded after {outer_iterations} outer iterations")]
    DeadlineExceeded { outer_iterations: usize },
}

impl PlacementError {
    pub(crate) fn config(parameter: &'static str, reason: impl Into<String>) -> Self {
        Self::Configuration {
            parameter,
            reason: reason.into(),
        }
    }

    /// Whether the error ends the run.
    ///
    /// Only [`PlacementError::NumericalSingularity`] is recoverable: callers of
    /// [`VarianceModel::evaluate`] get a pseudo-inverse estimate instead.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::NumericalSingularity { .. })
    }
}

pub type Result<T> = std::result::Result<T, PlacementError>;
