//! Top-level entry point: validate a configuration, run one placer and
//! report the final partition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::basis::LowRankBasis;
use crate::fixed_budget::FixedBudgetPlacer;
use crate::iterative::{IterativeConfig, IterativePlacer};
use crate::relaxation::{within_threshold, DOptimalProblem};
use crate::selection::SelectionMatrix;
use crate::solver::{InteriorPointSolver, SolverSettings};
use crate::variance::{VarianceModel, VarianceReport};
use crate::{PlacementError, Result};

/// Which placer to run.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Strategy {
    /// Exactly `sensors` locations, D-optimal.
    FixedBudget { sensors: usize },
    /// As few locations as needed to keep the worst-case variance below the
    /// threshold (IRL1ND).
    VarianceConstrained(IterativeConfig),
}

impl Strategy {
    /// The strategy without its parameters.
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::FixedBudget { .. } => StrategyKind::FixedBudget,
            Self::VarianceConstrained(_) => StrategyKind::VarianceConstrained,
        }
    }
}

/// Tag of a [`Strategy`], recorded on the finished design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StrategyKind {
    FixedBudget,
    VarianceConstrained,
}

/// Hard limits on an iterative run, checked between outer iterations.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RunLimits {
    /// Outer-iteration cap. `None` means `n · (n_it + 1)`.
    pub max_outer_iterations: Option<usize>,
    /// Wall-clock budget for the whole run.
    pub deadline: Option<Duration>,
}

impl RunLimits {
    /// Cap the number of outer iterations.
    pub fn with_max_outer_iterations(mut self, cap: usize) -> Self {
        self.max_outer_iterations = Some(cap);
        self
    }

    /// Abort once `deadline` has elapsed since the run started.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_outer_iterations == Some(0) {
            return Err(PlacementError::config(
                "max outer iterations",
                "must be at least 1",
            ));
        }
        if self.deadline == Some(Duration::ZERO) {
            return Err(PlacementError::config("deadline", "must be non-zero"));
        }
        Ok(())
    }
}

/// Cooperative cancellation flag shared between a running planner and its
/// caller.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; every clone observes it.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether [`cancel`](Self::cancel) has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Everything a run needs besides the basis.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PlannerConfig {
    pub strategy: Strategy,
    pub limits: RunLimits,
    pub solver: SolverSettings,
}

impl PlannerConfig {
    /// D-optimal placement of exactly `sensors` locations.
    pub fn fixed_budget(sensors: usize) -> Self {
        Self::new(Strategy::FixedBudget { sensors })
    }

    /// IRL1ND placement under a variance threshold.
    pub fn variance_constrained(config: IterativeConfig) -> Self {
        Self::new(Strategy::VarianceConstrained(config))
    }

    /// Default limits and solver settings for `strategy`.
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            limits: RunLimits::default(),
            solver: SolverSettings::default(),
        }
    }

    /// Replace the run limits.
    pub fn with_limits(mut self, limits: RunLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Replace the solver settings.
    pub fn with_solver(mut self, solver: SolverSettings) -> Self {
        self.solver = solver;
        self
    }
}

/// Final partition of the candidate locations.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NetworkDesign {
    pub strategy: StrategyKind,
    /// Monitored locations `S`, ascending.
    pub monitored: Vec<usize>,
    /// Unmonitored locations `Sc`, ascending.
    pub unmonitored: Vec<usize>,
    /// `V(S)` over every location.
    pub variance: VarianceReport,
    /// Absolute threshold `ρ`; `None` for fixed-budget designs.
    pub threshold: Option<f64>,
    /// Worst-case variance with every location monitored.
    pub fully_monitored_worst: f64,
    /// Outer iterations spent (0 for fixed-budget designs).
    pub outer_iterations: usize,
}

impl NetworkDesign {
    /// `max V(S) <= ρ` up to a relative `1e-9`; always true without a
    /// threshold.
    pub fn meets_threshold(&self) -> bool {
        self.threshold
            .map_or(true, |rho| within_threshold(self.variance.worst_case, rho))
    }

    /// `C(S)` over the `|S| + |Sc|` candidate locations.
    ///
    /// Fails if the monitored and unmonitored lists do not partition
    /// `0..n` (possible only for a hand-built or deserialized design).
    pub fn selection(&self) -> Result<SelectionMatrix> {
        let n = self.monitored.len() + self.unmonitored.len();
        let mut seen = vec![false; n];
        for &i in self.monitored.iter().chain(&self.unmonitored) {
            if i >= n {
                return Err(PlacementError::IndexOutOfRange { index: i, n });
            }
            if std::mem::replace(&mut seen[i], true) {
                return Err(PlacementError::config(
                    "design",
                    format!("location {i} appears more than once in the partition"),
                ));
            }
        }
        SelectionMatrix::new(self.monitored.iter().copied(), n)
    }

    /// Worst-case variance relative to the fully monitored network.
    pub fn variance_ratio(&self) -> f64 {
        self.variance.worst_case / self.fully_monitored_worst
    }
}

/// Runs one placement strategy over a basis.
#[derive(Debug, Clone)]
pub struct NetworkPlanner {
    basis: LowRankBasis,
    config: PlannerConfig,
}

impl NetworkPlanner {
    /// Pair a basis with a configuration; nothing is validated until
    /// [`plan`](Self::plan) or [`validate`](Self::validate).
    pub fn new(basis: LowRankBasis, config: PlannerConfig) -> Self {
        Self { basis, config }
    }

    /// The basis being planned over.
    pub fn basis(&self) -> &LowRankBasis {
        &self.basis
    }

    /// The configuration the planner was built with.
    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Check every parameter against the basis without solving anything.
    pub fn validate(&self) -> Result<()> {
        self.config.solver.validate()?;
        self.config.limits.validate()?;
        match &self.config.strategy {
            Strategy::FixedBudget { sensors } => {
                DOptimalProblem::new(&self.basis, *sensors).map(|_| ())
            }
            Strategy::VarianceConstrained(c) => c.validate(self.basis.locations()),
        }
    }

    /// Validate, run the configured strategy and evaluate the final design.
    pub fn plan(&self) -> Result<NetworkDesign> {
        self.plan_with(&CancellationToken::new())
    }

    /// Like [`plan`](Self::plan), stopping with
    /// [`PlacementError::Cancelled`] once `token` is cancelled.
    pub fn plan_with(&self, token: &CancellationToken) -> Result<NetworkDesign> {
        self.validate()?;
        let started = Instant::now();
        let solver = InteriorPointSolver::new(self.config.solver);
        let model = VarianceModel::new(&self.basis);
        log::info!(
            "planning {:?} design over {} locations, basis rank {}",
            self.config.strategy.kind(),
            self.basis.locations(),
            self.basis.rank()
        );

        let design = match &self.config.strategy {
            Strategy::FixedBudget { sensors } => {
                if token.is_cancelled() {
                    return Err(PlacementError::Cancelled {
                        outer_iterations: 0,
                    });
                }
                let placement = FixedBudgetPlacer::new(solver).place(&self.basis, *sensors)?;
                NetworkDesign {
                    strategy: StrategyKind::FixedBudget,
                    monitored: placement.monitored,
                    unmonitored: placement.unmonitored,
                    variance: placement.variance,
                    threshold: None,
                    fully_monitored_worst: model.fully_monitored().worst_case,
                    outer_iterations: 0,
                }
            }
            Strategy::VarianceConstrained(config) => {
                let placement = IterativePlacer::new(&self.basis, config)?.run(
                    &solver,
                    &self.config.limits,
                    token,
                )?;
                let selection =
                    SelectionMatrix::new(placement.monitored.iter().copied(), self.basis.locations())?;
                let variance = model.evaluate(&selection)?;
                if !within_threshold(variance.worst_case, placement.threshold) {
                    log::warn!(
                        "final worst-case variance {:.6e} exceeds threshold {:.6e}",
                        variance.worst_case,
                        placement.threshold
                    );
                }
                NetworkDesign {
                    strategy: StrategyKind::VarianceConstrained,
                    monitored: placement.monitored,
                    unmonitored: placement.unmonitored,
                    variance,
                    threshold: Some(placement.threshold),
                    fully_monitored_worst: placement.fully_monitored_worst,
                    outer_iterations: placement.outer_iterations,
                }
            }
        };

        log::info!(
            "design ready in {:.2?}: {} of {} locations monitored, worst-case variance {:.6e}",
            started.elapsed(),
            design.monitored.len(),
            self.basis.locations(),
            design.variance.worst_case
        );
        Ok(design)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    fn uniform_column(n: usize) -> LowRankBasis {
        LowRankBasis::new(DMatrix::from_element(n, 1, 1.0 / (n as f64).sqrt())).unwrap()
    }

    #[test]
    fn cancelled_token_stops_before_the_first_iteration() {
        let token = CancellationToken::new();
        let observer = token.clone();
        token.cancel();
        assert!(observer.is_cancelled());

        let planner = NetworkPlanner::new(
            uniform_column(5),
            PlannerConfig::variance_constrained(IterativeConfig::new(2.0)),
        );
        assert_eq!(
            planner.plan_with(&token),
            Err(PlacementError::Cancelled {
                outer_iterations: 0
            })
        );
    }

    #[test]
    fn iteration_cap_raises_non_termination() {
        let planner = NetworkPlanner::new(
            uniform_column(5),
            PlannerConfig::variance_constrained(IterativeConfig::new(2.0))
                .with_limits(RunLimits::default().with_max_outer_iterations(1)),
        );
        assert!(matches!(
            planner.plan(),
            Err(PlacementError::NonTermination {
                outer_iterations: 1,
                n: 5,
                ..
            })
        ));
    }

    #[test]
    fn expired_deadline_stops_before_the_first_iteration() {
        let planner = NetworkPlanner::new(
            uniform_column(5),
            PlannerConfig::variance_constrained(IterativeConfig::new(2.0))
                .with_limits(RunLimits::default().with_deadline(Duration::from_nanos(1))),
        );
        let err = planner.plan().unwrap_err();
        assert_eq!(
            err,
            PlacementError::DeadlineExceeded {
                outer_iterations: 0
            }
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn selection_rejects_an_inconsistent_partition() {
        let mut design = NetworkPlanner::new(uniform_column(4), PlannerConfig::fixed_budget(2))
            .plan()
            .unwrap();
        design.unmonitored = vec![design.monitored[0], 3];
        assert!(matches!(
            design.selection(),
            Err(PlacementError::Configuration { parameter: "design", .. })
        ));
        design.unmonitored = vec![7, 3];
        assert_eq!(
            design.selection(),
            Err(PlacementError::IndexOutOfRange { index: 7, n: 4 })
        );
    }

    #[test]
    fn invalid_limits_are_rejected_before_solving() {
        let planner = NetworkPlanner::new(
            uniform_column(3),
            PlannerConfig::fixed_budget(1)
                .with_limits(RunLimits::default().with_max_outer_iterations(0)),
        );
        assert!(matches!(
            planner.validate(),
            Err(PlacementError::Configuration { .. })
        ));
    }

    #[test]
    fn fixed_budget_design_has_no_threshold() {
        let planner = NetworkPlanner::new(uniform_column(4), PlannerConfig::fixed_budget(2));
        let design = planner.plan().unwrap();
        assert_eq!(design.strategy, StrategyKind::FixedBudget);
        assert_eq!(design.monitored.len(), 2);
        assert_eq!(design.threshold, None);
        assert!(design.meets_threshold());
        assert_eq!(design.selection().unwrap().len(), 2);
        // Two of four equal-weight rows: V = 1/2 against 1/4 fully monitored.
        assert!((design.variance_ratio() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn variance_constrained_design_meets_threshold() {
        let planner = NetworkPlanner::new(
            uniform_column(5),
            PlannerConfig::variance_constrained(IterativeConfig::new(2.0)),
        );
        let design = planner.plan().unwrap();
        assert_eq!(design.monitored.len() + design.unmonitored.len(), 5);
        assert!(design.meets_threshold());
        assert!(design.outer_iterations > 0);
    }
}
