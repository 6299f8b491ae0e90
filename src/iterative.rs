//! Iteratively reweighted ℓ1 network design (IRL1ND).
//!
//! No sensor budget is given. Instead the network grows until the worst-case
//! coordinate variance is below `ρ = ratio · max V(all locations)`. Every outer
//! iteration solves the weighted-ℓ1 relaxation (see [`crate::relaxation`]) and
//! then walks a fixed sequence of phases:
//!
//! ```text
//!   Solve -> Freeze -> BreakStall -> Reweight -> (Solve | Complete)
//! ```
//!
//! - **Freeze** moves `h_i >= 1 - ε` into the monitored set `S` and
//!   `h_i <= ε` into the unmonitored set `Sc`. An `Sc` freeze is admitted only
//!   if the remaining problem stays feasible; otherwise the location stays
//!   undecided for another round.
//! - **BreakStall** forces the highest-`h` undecided location into `S` when
//!   the relaxation stops moving (`||h - h_prev|| <= ε` without any freeze) or
//!   after `n_it` iterations since the last forced freeze.
//! - **Reweight** sets `w_i = 1 / (h_i + ε)` and clamps frozen entries.
//!
//! Decided locations are never revisited, and every iteration either freezes
//! a location or advances the inner counter, so a run finishes within
//! `n · n_it` outer iterations. Because every admitted freeze keeps the
//! relaxation feasible, the final `S` satisfies `max V(S) <= ρ`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::basis::LowRankBasis;
use crate::planner::{CancellationToken, RunLimits};
use crate::relaxation::{feasible_worst_case, Assignment, RelaxationSolver, VarianceProblem};
use crate::variance::VarianceModel;
use crate::{PlacementError, Result};

/// Initial relaxed indicator `h_prev`, which also sets the first weights
/// `w = 1 / (h_prev + ε)`.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WarmStart {
    /// `h = 0`, i.e. uniform weights `1/ε`.
    #[default]
    Zeros,
    /// Every entry set to the same value in `[0, 1]`.
    Uniform(f64),
    /// Caller-supplied indicator of length `n`.
    Given(Vec<f64>),
    /// Entries drawn uniformly from `[0, 1)` with a seeded generator.
    Seeded { seed: u64 },
}

impl WarmStart {
    fn materialize(&self, n: usize) -> Vec<f64> {
        match self {
            Self::Zeros => vec![0.0; n],
            Self::Uniform(v) => vec![*v; n],
            Self::Given(h) => h.clone(),
            Self::Seeded { seed } => {
                let mut rng = StdRng::seed_from_u64(*seed);
                (0..n).map(|_| rng.random::<f64>()).collect()
            }
        }
    }

    fn validate(&self, n: usize) -> Result<()> {
        let in_unit = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        match self {
            Self::Uniform(v) if !in_unit(*v) => Err(PlacementError::config(
                "warm start",
                format!("uniform value must be in [0, 1], got {v}"),
            )),
            Self::Given(h) if h.len() != n => Err(PlacementError::config(
                "warm start",
                format!("expected {n} entries, got {}", h.len()),
            )),
            Self::Given(h) if !h.iter().all(|&v| in_unit(v)) => Err(PlacementError::config(
                "warm start",
                "entries must be in [0, 1]",
            )),
            _ => Ok(()),
        }
    }
}

/// Parameters of an IRL1ND run.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IterativeConfig {
    /// `ρ / max V(all locations)`; must be at least 1.
    pub variance_threshold_ratio: f64,
    /// Reweighting constant and freeze threshold, in `(0, 0.5)`.
    pub epsilon: f64,
    /// Outer iterations without a forced freeze before one is forced (`n_it`).
    pub max_inner_iterations: usize,
    pub warm_start: WarmStart,
    /// Locations already known to be monitored.
    pub initial_monitored: Vec<usize>,
    /// Locations already known to stay unmonitored.
    pub initial_unmonitored: Vec<usize>,
}

impl Default for IterativeConfig {
    fn default() -> Self {
        Self {
            variance_threshold_ratio: 1.1,
            epsilon: 1e-2,
            max_inner_iterations: 20,
            warm_start: WarmStart::Zeros,
            initial_monitored: Vec::new(),
            initial_unmonitored: Vec::new(),
        }
    }
}

impl IterativeConfig {
    /// Defaults for a threshold of `ratio` times the fully monitored
    /// worst-case variance.
    pub fn new(variance_threshold_ratio: f64) -> Self {
        Self {
            variance_threshold_ratio,
            ..Self::default()
        }
    }

    /// Relaxed values at or below `epsilon` are frozen as unmonitored.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Reweighting rounds without progress before a forced freeze.
    pub fn with_max_inner_iterations(mut self, n_it: usize) -> Self {
        self.max_inner_iterations = n_it;
        self
    }

    /// Initial point for the first relaxation.
    pub fn with_warm_start(mut self, warm_start: WarmStart) -> Self {
        self.warm_start = warm_start;
        self
    }

    /// Seed the partition with known decisions.
    pub fn with_initial_sets(mut self, monitored: Vec<usize>, unmonitored: Vec<usize>) -> Self {
        self.initial_monitored = monitored;
        self.initial_unmonitored = unmonitored;
        self
    }

    /// Check every parameter against a basis of `n` locations.
    pub fn validate(&self, n: usize) -> Result<()> {
        let ratio = self.variance_threshold_ratio;
        if !ratio.is_finite() || ratio <= 0.0 {
            return Err(PlacementError::config(
                "variance threshold ratio",
                format!("must be positive and finite, got {ratio}"),
            ));
        }
        if ratio < 1.0 {
            return Err(PlacementError::config(
                "variance threshold ratio",
                format!("{ratio} asks for lower variance than the fully monitored network"),
            ));
        }
        if !(self.epsilon > 0.0 && self.epsilon < 0.5) {
            return Err(PlacementError::config(
                "epsilon",
                format!("must be in (0, 0.5), got {}", self.epsilon),
            ));
        }
        if self.max_inner_iterations == 0 {
            return Err(PlacementError::config(
                "max inner iterations",
                "must be at least 1",
            ));
        }
        self.warm_start.validate(n)?;
        for &i in self.initial_monitored.iter().chain(&self.initial_unmonitored) {
            if i >= n {
                return Err(PlacementError::IndexOutOfRange { index: i, n });
            }
        }
        if let Some(i) = self
            .initial_monitored
            .iter()
            .find(|&&i| self.initial_unmonitored.contains(&i))
        {
            return Err(PlacementError::config(
                "initial sets",
                format!("location {i} is both monitored and unmonitored"),
            ));
        }
        Ok(())
    }
}

/// Phase of the outer-iteration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StepKind {
    /// Solve the reweighted relaxation.
    Solve,
    /// Freeze entries that crossed `1 - ε` or `ε`.
    Freeze,
    /// Force one location into `S` if the relaxation stalled.
    BreakStall,
    /// Update `w` and clamp frozen entries.
    Reweight,
    /// Every location is decided.
    Complete,
}

/// What one outer iteration did.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OuterStep {
    /// 1-based outer iteration number.
    pub iteration: usize,
    /// Weighted-ℓ1 objective of the relaxation.
    pub objective: f64,
    /// `||h - h_prev||₂` for this solve.
    pub change: f64,
    pub newly_monitored: Vec<usize>,
    pub newly_unmonitored: Vec<usize>,
    /// Locations below `ε` kept undecided to preserve feasibility.
    pub blocked: Vec<usize>,
    /// Location forced into `S` by stall breaking.
    pub forced: Option<usize>,
}

impl OuterStep {
    /// Number of locations decided in this iteration.
    pub fn decided(&self) -> usize {
        self.newly_monitored.len() + self.newly_unmonitored.len() + usize::from(self.forced.is_some())
    }
}

/// Final partition of an IRL1ND run.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IterativePlacement {
    /// Monitored locations, ascending.
    pub monitored: Vec<usize>,
    /// Unmonitored locations, ascending.
    pub unmonitored: Vec<usize>,
    /// Absolute threshold `ρ`.
    pub threshold: f64,
    /// Worst-case variance of the fully monitored network.
    pub fully_monitored_worst: f64,
    pub outer_iterations: usize,
    pub forced_freezes: usize,
}

/// Relaxed values closer than this count as tied.
const TIE_TOL: f64 = 1e-9;

/// Highest-`h` undecided location, lowest index on ties.
///
/// Returns `None` once every location is decided.
pub fn forced_freeze_candidate(h: &[f64], assignment: &[Assignment]) -> Option<usize> {
    debug_assert_eq!(h.len(), assignment.len());
    h.iter()
        .zip(assignment)
        .enumerate()
        .filter(|(_, (_, a))| **a == Assignment::Free)
        .fold(None, |best: Option<(usize, f64)>, (i, (&v, _))| match best {
            Some((_, bv)) if v <= bv + TIE_TOL => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

/// IRL1ND state for one run over a fixed basis.
#[derive(Debug, Clone)]
pub struct IterativePlacer<'a> {
    basis: &'a LowRankBasis,
    threshold: f64,
    fully_monitored_worst: f64,
    epsilon: f64,
    max_inner_iterations: usize,

    h: Vec<f64>,
    h_prev: Vec<f64>,
    weights: Vec<f64>,
    assignment: Vec<Assignment>,
    monitored: Vec<usize>,
    unmonitored: Vec<usize>,

    phase: StepKind,
    inner: usize,
    outer: usize,
    forced_freezes: usize,
    current: OuterStep,
}

impl<'a> IterativePlacer<'a> {
    /// Validate `config` and compute the absolute threshold `ρ`.
    pub fn new(basis: &'a LowRankBasis, config: &IterativeConfig) -> Result<Self> {
        let n = basis.locations();
        config.validate(n)?;

        let fully_monitored_worst = VarianceModel::new(basis).fully_monitored().worst_case;
        let threshold = config.variance_threshold_ratio * fully_monitored_worst;

        let mut assignment = vec![Assignment::Free; n];
        let mut monitored = Vec::new();
        let mut unmonitored = Vec::new();
        for &i in &config.initial_monitored {
            if assignment[i] == Assignment::Free {
                assignment[i] = Assignment::Monitored;
                monitored.push(i);
            }
        }
        for &i in &config.initial_unmonitored {
            if assignment[i] == Assignment::Free {
                assignment[i] = Assignment::Unmonitored;
                unmonitored.push(i);
            }
        }

        let h_prev = config.warm_start.materialize(n);
        let weights = h_prev.iter().map(|h| 1.0 / (h + config.epsilon)).collect();
        let mut h = h_prev.clone();
        clamp_decided(&mut h, &assignment);

        let phase = if monitored.len() + unmonitored.len() == n {
            StepKind::Complete
        } else {
            StepKind::Solve
        };

        log::info!(
            "IRL1ND: n={n}, r={}, rho={threshold:.4e} ({}x fully monitored {fully_monitored_worst:.4e}), \
             epsilon={:.1e}, n_it={}",
            basis.rank(),
            config.variance_threshold_ratio,
            config.epsilon,
            config.max_inner_iterations
        );

        Ok(Self {
            basis,
            threshold,
            fully_monitored_worst,
            epsilon: config.epsilon,
            max_inner_iterations: config.max_inner_iterations,
            h,
            h_prev,
            weights,
            assignment,
            monitored,
            unmonitored,
            phase,
            inner: 0,
            outer: 0,
            forced_freezes: 0,
            current: OuterStep::default(),
        })
    }

    /// Absolute variance threshold `ρ`.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// The phase [`advance`](Self::advance) will execute next.
    pub fn phase(&self) -> StepKind {
        self.phase
    }

    /// Whether every location has been decided.
    pub fn is_complete(&self) -> bool {
        self.phase == StepKind::Complete
    }

    /// Monitored locations in the order they were frozen.
    pub fn monitored(&self) -> &[usize] {
        &self.monitored
    }

    /// Unmonitored locations in the order they were frozen.
    pub fn unmonitored(&self) -> &[usize] {
        &self.unmonitored
    }

    /// Current relaxed indicator (frozen entries clamped).
    pub fn relaxed(&self) -> &[f64] {
        &self.h
    }

    /// Current reweighting weights `w`.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Per-location decision state.
    pub fn assignment(&self) -> &[Assignment] {
        &self.assignment
    }

    /// Outer iterations completed so far.
    pub fn outer_iterations(&self) -> usize {
        self.outer
    }

    /// Number of locations in `S` or `Sc`.
    pub fn decided(&self) -> usize {
        self.monitored.len() + self.unmonitored.len()
    }

    /// Execute the current phase and move to the next one.
    pub fn advance<S: RelaxationSolver + ?Sized>(&mut self, solver: &S) -> Result<StepKind> {
        self.phase = match self.phase {
            StepKind::Solve => {
                self.solve(solver)?;
                StepKind::Freeze
            }
            StepKind::Freeze => {
                self.freeze();
                StepKind::BreakStall
            }
            StepKind::BreakStall => {
                self.break_stall();
                StepKind::Reweight
            }
            StepKind::Reweight => {
                self.reweight();
                if self.decided() == self.basis.locations() {
                    StepKind::Complete
                } else {
                    StepKind::Solve
                }
            }
            StepKind::Complete => StepKind::Complete,
        };
        Ok(self.phase)
    }

    /// Run one full outer iteration (from `Solve` back to `Solve` or
    /// `Complete`).
    pub fn step<S: RelaxationSolver + ?Sized>(&mut self, solver: &S) -> Result<OuterStep> {
        if self.is_complete() {
            return Ok(OuterStep {
                iteration: self.outer,
                ..OuterStep::default()
            });
        }
        loop {
            match self.advance(solver)? {
                StepKind::Solve | StepKind::Complete => break,
                _ => {}
            }
        }
        let step = std::mem::take(&mut self.current);
        log::debug!(
            "IRL1ND iter {}: |S|={} |Sc|={} (+{} / +{}, forced {:?}, blocked {}), change {:.3e}",
            step.iteration,
            self.monitored.len(),
            self.unmonitored.len(),
            step.newly_monitored.len(),
            step.newly_unmonitored.len(),
            step.forced,
            step.blocked.len(),
            step.change
        );
        Ok(step)
    }

    /// Step until every location is decided, honoring `limits` and `token`
    /// between outer iterations.
    pub fn run<S: RelaxationSolver + ?Sized>(
        mut self,
        solver: &S,
        limits: &RunLimits,
        token: &CancellationToken,
    ) -> Result<IterativePlacement> {
        let n = self.basis.locations();
        let cap = limits
            .max_outer_iterations
            .unwrap_or_else(|| n.saturating_mul(self.max_inner_iterations + 1).max(1));
        let started = std::time::Instant::now();

        while !self.is_complete() {
            if token.is_cancelled() {
                return Err(PlacementError::Cancelled {
                    outer_iterations: self.outer,
                });
            }
            if limits.deadline.is_some_and(|d| started.elapsed() >= d) {
                return Err(PlacementError::DeadlineExceeded {
                    outer_iterations: self.outer,
                });
            }
            if self.outer >= cap {
                return Err(PlacementError::NonTermination {
                    outer_iterations: self.outer,
                    decided: self.decided(),
                    n,
                });
            }
            self.step(solver)?;
        }

        log::info!(
            "IRL1ND finished in {:.2?}: {} monitored, {} unmonitored after {} outer iterations ({} forced)",
            started.elapsed(),
            self.monitored.len(),
            self.unmonitored.len(),
            self.outer,
            self.forced_freezes
        );
        Ok(self.into_placement())
    }

    fn into_placement(self) -> IterativePlacement {
        let mut monitored = self.monitored;
        let mut unmonitored = self.unmonitored;
        monitored.sort_unstable();
        unmonitored.sort_unstable();
        IterativePlacement {
            monitored,
            unmonitored,
            threshold: self.threshold,
            fully_monitored_worst: self.fully_monitored_worst,
            outer_iterations: self.outer,
            forced_freezes: self.forced_freezes,
        }
    }

    fn solve<S: RelaxationSolver + ?Sized>(&mut self, solver: &S) -> Result<()> {
        let problem =
            VarianceProblem::new(self.basis, self.threshold, &self.weights, &self.assignment)?;
        let solution = solver.solve_variance(&problem)?;
        let change = solution
            .h
            .iter()
            .zip(&self.h_prev)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt();

        self.outer += 1;
        self.inner += 1;
        self.h = solution.h;
        self.current = OuterStep {
            iteration: self.outer,
            objective: solution.objective,
            change,
            ..OuterStep::default()
        };
        Ok(())
    }

    fn freeze(&mut self) {
        let eps = self.epsilon;
        for i in 0..self.h.len() {
            if self.assignment[i] == Assignment::Free && self.h[i] >= 1.0 - eps {
                self.assignment[i] = Assignment::Monitored;
                self.monitored.push(i);
                self.current.newly_monitored.push(i);
            }
        }

        let mut candidates: Vec<usize> = (0..self.h.len())
            .filter(|&i| self.assignment[i] == Assignment::Free && self.h[i] <= eps)
            .collect();
        if candidates.is_empty() {
            return;
        }

        // Variance with every still-possible location measured.
        let mut upper: Vec<f64> = self
            .assignment
            .iter()
            .map(|a| if *a == Assignment::Unmonitored { 0.0 } else { 1.0 })
            .collect();
        for &i in &candidates {
            upper[i] = 0.0;
        }
        let admitted = if feasible_worst_case(self.basis, &upper, self.threshold).is_ok() {
            candidates
        } else {
            for &i in &candidates {
                upper[i] = 1.0;
            }
            candidates.sort_by(|&a, &b| self.h[a].total_cmp(&self.h[b]).then(a.cmp(&b)));
            let mut admitted = Vec::new();
            for i in candidates {
                upper[i] = 0.0;
                if feasible_worst_case(self.basis, &upper, self.threshold).is_ok() {
                    admitted.push(i);
                } else {
                    upper[i] = 1.0;
                    self.current.blocked.push(i);
                }
            }
            admitted.sort_unstable();
            log::warn!(
                "IRL1ND iter {}: kept {} locations below epsilon undecided to preserve feasibility",
                self.outer,
                self.current.blocked.len()
            );
            admitted
        };

        for i in admitted {
            self.assignment[i] = Assignment::Unmonitored;
            self.unmonitored.push(i);
            self.current.newly_unmonitored.push(i);
        }
    }

    fn break_stall(&mut self) {
        let froze = !self.current.newly_monitored.is_empty()
            || !self.current.newly_unmonitored.is_empty();
        let stalled = self.current.change <= self.epsilon && !froze;
        if !(stalled || self.inner >= self.max_inner_iterations) {
            return;
        }
        if let Some(i) = forced_freeze_candidate(&self.h, &self.assignment) {
            log::debug!(
                "IRL1ND iter {}: forcing location {i} (h = {:.4}) into the monitored set",
                self.outer,
                self.h[i]
            );
            self.assignment[i] = Assignment::Monitored;
            self.monitored.push(i);
            self.current.forced = Some(i);
            self.forced_freezes += 1;
        }
        self.inner = 0;
    }

    fn reweight(&mut self) {
        self.h_prev.clone_from(&self.h);
        for (w, h) in self.weights.iter_mut().zip(&self.h) {
            *w = 1.0 / (h + self.epsilon);
        }
        clamp_decided(&mut self.h, &self.assignment);
    }
}

fn clamp_decided(h: &mut [f64], assignment: &[Assignment]) {
    for (x, a) in h.iter_mut().zip(assignment) {
        match a {
            Assignment::Monitored => *x = 1.0,
            Assignment::Unmonitored => *x = 0.0,
            Assignment::Free => {}
        }
    }
}
