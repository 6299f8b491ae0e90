//! Default [`RelaxationSolver`]: projected gradient ascent for the log-det
//! relaxation and a log-barrier interior-point method for the
//! variance-constrained one.
//!
//! # Barrier formulation
//!
//! With `F` the free locations, `s_j = ρ - v_j(h)` the constraint slacks and
//! `t > 0` the barrier parameter, each centering step minimizes
//!
//! ```text
//!   Φ_t(h) = t Σ_{i∈F} w_i h_i  -  Σ_j log s_j  -  Σ_{i∈F} [log h_i + log(1 - h_i)]
//! ```
//!
//! by damped Newton steps. Writing `A = Ψ M(h)⁻¹ Ψᵀ`, the derivatives of the
//! matrix-fractional constraints are
//!
//! ```text
//!   ∂v_j/∂h_i        = -A_ji²
//!   ∂²v_j/∂h_i∂h_l   = 2 A_ji A_jl A_il
//! ```
//!
//! which give the gradient and Hessian of `Φ_t` in closed form. `t` grows
//! geometrically until the duality-gap bound `m / t` (with `m` the number of
//! inequality constraints) drops below the configured tolerance.

use nalgebra::{DMatrix, DVector};

use crate::basis::LowRankBasis;
use crate::relaxation::{
    project_capped_simplex, DOptimalProblem, RelaxationSolver, RelaxedSolution, VarianceProblem,
};
use crate::variance::diag_quadratic;
use crate::{PlacementError, Result};

/// Armijo sufficient-decrease fraction for the Newton line search.
const ARMIJO: f64 = 0.25;
/// Backtracking factor.
const BACKTRACK: f64 = 0.5;
/// Fraction of the distance to the box boundary a Newton step may cover.
const BOUNDARY_FRACTION: f64 = 0.99;
/// Smallest step before a line search gives up.
const MIN_STEP: f64 = 1e-14;
/// Largest projected-gradient step.
const MAX_STEP: f64 = 1e6;

/// Tolerances and iteration limits of [`InteriorPointSolver`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SolverSettings {
    /// Maximum projected-gradient iterations for the log-det relaxation.
    pub max_gradient_iterations: usize,
    /// Stop once a projected-gradient step moves no entry by more than this.
    pub gradient_tolerance: f64,
    /// Initial barrier parameter `t`.
    pub initial_barrier: f64,
    /// Factor by which `t` grows between centering rounds.
    pub barrier_growth: f64,
    /// Target bound `m / t` on the duality gap.
    pub duality_gap: f64,
    /// Stop centering once half the squared Newton decrement is below this.
    pub newton_tolerance: f64,
    /// Newton steps allowed per centering round.
    pub max_newton_steps: usize,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_gradient_iterations: 2_000,
            gradient_tolerance: 1e-9,
            initial_barrier: 1.0,
            barrier_growth: 10.0,
            duality_gap: 1e-8,
            newton_tolerance: 1e-10,
            max_newton_steps: 100,
        }
    }
}

impl SolverSettings {
    /// Looser tolerances for large candidate sets or quick sweeps.
    pub fn fast() -> Self {
        Self {
            max_gradient_iterations: 500,
            gradient_tolerance: 1e-7,
            duality_gap: 1e-6,
            newton_tolerance: 1e-8,
            max_newton_steps: 50,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let positive = |name: &'static str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(PlacementError::config(name, format!("must be positive, got {v}")))
            }
        };
        positive("gradient tolerance", self.gradient_tolerance)?;
        positive("initial barrier parameter", self.initial_barrier)?;
        positive("duality gap", self.duality_gap)?;
        positive("newton tolerance", self.newton_tolerance)?;
        if !(self.barrier_growth.is_finite() && self.barrier_growth > 1.0) {
            return Err(PlacementError::config(
                "barrier growth",
                format!("must exceed 1, got {}", self.barrier_growth),
            ));
        }
        if self.max_gradient_iterations == 0 || self.max_newton_steps == 0 {
            return Err(PlacementError::config(
                "solver iterations",
                "iteration limits must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Dense first/second-order solver for both relaxations.
#[derive(Debug, Clone, Default)]
pub struct InteriorPointSolver {
    settings: SolverSettings,
}

impl InteriorPointSolver {
    /// Solver with the given tolerances and iteration caps.
    pub fn new(settings: SolverSettings) -> Self {
        Self { settings }
    }

    /// Tolerances in use.
    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }
}

impl RelaxationSolver for InteriorPointSolver {
    fn solve_d_optimal(&self, problem: &DOptimalProblem<'_>) -> Result<RelaxedSolution> {
        let basis = problem.basis();
        let n = basis.locations();
        let k = problem.budget() as f64;

        let mut h = vec![k / n as f64; n];
        let mut value = log_det(basis, &h).ok_or_else(|| PlacementError::SolverFailed {
            reason: "information matrix singular at the uniform start".into(),
        })?;
        let mut step = 1.0;
        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.settings.max_gradient_iterations {
            iterations += 1;
            let grad = leverage(basis, &h).ok_or_else(|| PlacementError::SolverFailed {
                reason: format!("information matrix singular at iteration {iterations}"),
            })?;

            // Backtrack until the quadratic upper model certifies ascent.
            let accepted = loop {
                let moved: Vec<f64> = h.iter().zip(&grad).map(|(x, g)| x + step * g).collect();
                let trial = project_capped_simplex(&moved, k);
                let diff: Vec<f64> = trial.iter().zip(&h).map(|(a, b)| a - b).collect();
                let max_move = diff.iter().fold(0.0_f64, |m, d| m.max(d.abs()));
                if max_move < self.settings.gradient_tolerance {
                    break None;
                }
                let lin: f64 = grad.iter().zip(&diff).map(|(g, d)| g * d).sum();
                let sq: f64 = diff.iter().map(|d| d * d).sum();
                match log_det(basis, &trial) {
                    Some(v) if v >= value + lin - sq / (2.0 * step) => break Some((trial, v)),
                    _ => {
                        step *= BACKTRACK;
                        if step < MIN_STEP {
                            break None;
                        }
                    }
                }
            };

            match accepted {
                Some((trial, v)) => {
                    h = trial;
                    value = v;
                    step = (step * 2.0).min(MAX_STEP);
                }
                None => {
                    converged = true;
                    break;
                }
            }
        }

        if !converged {
            log::warn!(
                "log-det relaxation stopped at the iteration limit ({}) before converging",
                self.settings.max_gradient_iterations
            );
        }
        log::debug!("log-det relaxation: value {value:.6} after {iterations} iterations");
        Ok(RelaxedSolution {
            h,
            objective: value,
            iterations,
        })
    }

    fn solve_variance(&self, problem: &VarianceProblem<'_>) -> Result<RelaxedSolution> {
        let free = problem.free_indices();
        let mut h = problem.fixed_indicator();
        if free.is_empty() {
            return Ok(RelaxedSolution {
                h,
                objective: 0.0,
                iterations: 0,
            });
        }

        // Monotonicity of V(h): feasible iff feasible with every free entry at 1.
        let worst = problem.check_feasible()?;
        if !problem.is_strictly_feasible(worst) {
            // No interior: measuring every free location is the only solution.
            log::debug!(
                "variance relaxation: threshold {:.6e} met only with all {} free locations measured",
                problem.threshold(),
                free.len()
            );
            let h = problem.saturated_indicator();
            let weights = problem.weights();
            return Ok(RelaxedSolution {
                objective: free.iter().map(|&i| weights[i]).sum(),
                h,
                iterations: 0,
            });
        }
        let ratio = worst / problem.threshold();
        // M(c·1_F + 1_S) ⪰ c·M(1_F + 1_S), so V <= worst / c < ρ for c > ratio.
        let start = 0.5 + 0.5 * ratio;
        for &i in &free {
            h[i] = start;
        }

        let constraints = (problem.basis().locations() + 2 * free.len()) as f64;
        let mut t = self.settings.initial_barrier;
        let mut iterations = 0;
        loop {
            iterations += self.center(problem, &free, t, &mut h)?;
            if constraints / t < self.settings.duality_gap {
                break;
            }
            t *= self.settings.barrier_growth;
        }

        let weights = problem.weights();
        let objective = free.iter().map(|&i| weights[i] * h[i]).sum();
        log::debug!(
            "variance relaxation: {} free locations, objective {objective:.6}, {iterations} newton steps",
            free.len()
        );
        Ok(RelaxedSolution {
            h,
            objective,
            iterations,
        })
    }
}

impl InteriorPointSolver {
    /// Newton centering for a fixed barrier parameter; returns the steps taken.
    fn center(
        &self,
        problem: &VarianceProblem<'_>,
        free: &[usize],
        t: f64,
        h: &mut [f64],
    ) -> Result<usize> {
        for step in 0..self.settings.max_newton_steps {
            let point = BarrierPoint::evaluate(problem, free, t, h).ok_or_else(|| {
                PlacementError::SolverFailed {
                    reason: "iterate left the barrier domain".into(),
                }
            })?;
            let newton = point
                .hessian
                .clone()
                .cholesky()
                .ok_or_else(|| PlacementError::SolverFailed {
                    reason: "newton system is not positive definite".into(),
                })?;
            let delta = newton.solve(&(-&point.gradient));
            let decrement = -point.gradient.dot(&delta);
            if !decrement.is_finite() {
                return Err(PlacementError::SolverFailed {
                    reason: format!("non-finite newton decrement at t = {t:.3e}"),
                });
            }
            if decrement / 2.0 <= self.settings.newton_tolerance {
                return Ok(step);
            }

            // Largest step keeping the free entries strictly inside (0, 1).
            let mut s: f64 = 1.0;
            for (c, &i) in free.iter().enumerate() {
                let d = delta[c];
                if d > 0.0 {
                    s = s.min(BOUNDARY_FRACTION * (1.0 - h[i]) / d);
                } else if d < 0.0 {
                    s = s.min(BOUNDARY_FRACTION * h[i] / -d);
                }
            }

            let mut trial = h.to_vec();
            loop {
                for (c, &i) in free.iter().enumerate() {
                    trial[i] = h[i] + s * delta[c];
                }
                match barrier_value(problem, free, t, &trial) {
                    Some(v) if v <= point.value - ARMIJO * s * decrement => break,
                    _ => {
                        s *= BACKTRACK;
                        if s < MIN_STEP {
                            log::debug!("newton line search stalled at t = {t:.3e}");
                            return Ok(step);
                        }
                    }
                }
            }
            h.copy_from_slice(&trial);
        }
        log::debug!(
            "newton centering used all {} steps at t = {t:.3e}",
            self.settings.max_newton_steps
        );
        Ok(self.settings.max_newton_steps)
    }
}

/// Barrier value, gradient and Hessian at a strictly feasible point.
struct BarrierPoint {
    value: f64,
    gradient: DVector<f64>,
    hessian: DMatrix<f64>,
}

impl BarrierPoint {
    fn evaluate(problem: &VarianceProblem<'_>, free: &[usize], t: f64, h: &[f64]) -> Option<Self> {
        let basis = problem.basis();
        let rho = problem.threshold();
        let weights = problem.weights();
        let f = free.len();

        let chol = basis.weighted_gram(h).cholesky()?;
        // Y = L⁻¹ Ψᵀ, so A = YᵀY and v_j = ||Y_j||².
        let y = chol.l_dirty().solve_lower_triangular(&basis.matrix().transpose())?;
        let slack: Vec<f64> = y.column_iter().map(|c| rho - c.norm_squared()).collect();
        if slack.iter().any(|s| !(*s > 0.0)) {
            return None;
        }
        let a_free = y.transpose() * y.select_columns(free.iter());

        // Rows scaled by 1/s_j and 1/sqrt(s_j).
        let sq_scaled = DMatrix::from_fn(a_free.nrows(), f, |j, c| a_free[(j, c)].powi(2) / slack[j]);
        let root_scaled = DMatrix::from_fn(a_free.nrows(), f, |j, c| a_free[(j, c)] / slack[j].sqrt());
        let cross = root_scaled.transpose() * &root_scaled;

        let mut hessian = sq_scaled.transpose() * &sq_scaled;
        let mut gradient = DVector::zeros(f);
        let mut value = -slack.iter().map(|s| s.ln()).sum::<f64>();
        for (c, &i) in free.iter().enumerate() {
            let x = h[i];
            if !(x > 0.0 && x < 1.0) {
                return None;
            }
            value += t * weights[i] * x - x.ln() - (1.0 - x).ln();
            let pull: f64 = root_scaled.column(c).norm_squared();
            gradient[c] = t * weights[i] - pull - 1.0 / x + 1.0 / (1.0 - x);
            for (d, &l) in free.iter().enumerate() {
                hessian[(c, d)] += 2.0 * a_free[(l, c)] * cross[(c, d)];
            }
            hessian[(c, c)] += 1.0 / (x * x) + 1.0 / ((1.0 - x) * (1.0 - x));
        }
        value
            .is_finite()
            .then_some(Self {
                value,
                gradient,
                hessian,
            })
    }
}

/// `Φ_t(h)`, or `None` outside the barrier domain.
fn barrier_value(problem: &VarianceProblem<'_>, free: &[usize], t: f64, h: &[f64]) -> Option<f64> {
    let weights = problem.weights();
    let mut value = 0.0;
    for &i in free {
        let x = h[i];
        if !(x > 0.0 && x < 1.0) {
            return None;
        }
        value += t * weights[i] * x - x.ln() - (1.0 - x).ln();
    }
    let chol = problem.basis().weighted_gram(h).cholesky()?;
    let variances = diag_quadratic(&chol, problem.basis().matrix())?;
    for v in variances {
        let s = problem.threshold() - v;
        if !(s > 0.0) {
            return None;
        }
        value -= s.ln();
    }
    value.is_finite().then_some(value)
}

/// `log det M(h)`, or `None` if `M(h)` is not positive definite.
fn log_det(basis: &LowRankBasis, h: &[f64]) -> Option<f64> {
    let chol = basis.weighted_gram(h).cholesky()?;
    let v = 2.0 * chol.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>();
    v.is_finite().then_some(v)
}

/// `∂ log det M(h) / ∂h_i = ψ_iᵀ M(h)⁻¹ ψ_i`.
fn leverage(basis: &LowRankBasis, h: &[f64]) -> Option<Vec<f64>> {
    let chol = basis.weighted_gram(h).cholesky()?;
    diag_quadratic(&chol, basis.matrix())
}
