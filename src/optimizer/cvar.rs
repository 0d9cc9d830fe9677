//! CVaR Optimizer - Rockafellar-Uryasev linear program
//!
//! Variables `x = [w (n), zeta, u (m)]` for n assets and m training periods:
//!
//! ```text
//! max  mean(r).w - (zeta + sum(u) / ((1 - alpha) m)) - lambda * score.w
//! s.t. u_i >= -(r_i . w) - zeta,  u_i >= 0
//!      sum(w) = 1,  0 <= w_j <= max_weight(regime)
//! ```

use ndarray::Axis;
use tracing::{debug, warn};

use super::solver::{self, ConicProblem, SolverSettings, TripletMatrix};
use super::weights::{cap_is_feasible, clip_and_normalize, enforce_cap, equal_weights};
use super::{
    Allocation, AllocationMethod, Diagnostics, OptimizationInput, PortfolioOptimizer, SolveStatus,
};
use crate::error::{AllocError, CycleFlag};
use crate::types::WeightVector;

#[derive(Debug, Clone)]
pub struct CvarOptimizer {
    alpha: f64,
    risk_penalty: f64,
    solver: SolverSettings,
}

impl Default for CvarOptimizer {
    fn default() -> Self {
        Self::new(0.95, 0.10)
    }
}

impl CvarOptimizer {
    pub fn new(alpha: f64, risk_penalty: f64) -> Self {
        Self {
            alpha,
            risk_penalty,
            solver: SolverSettings::default(),
        }
    }

    pub fn with_solver(mut self, solver: SolverSettings) -> Self {
        self.solver = solver;
        self
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn risk_penalty(&self) -> f64 {
        self.risk_penalty
    }

    pub fn solver_settings(&self) -> SolverSettings {
        self.solver
    }

    pub fn validate(&self) -> Result<(), AllocError> {
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(AllocError::Config(format!(
                "alpha {} must lie in (0, 1)",
                self.alpha
            )));
        }
        if !self.risk_penalty.is_finite() || self.risk_penalty < 0.0 {
            return Err(AllocError::Config(format!(
                "risk_penalty {} must be non-negative",
                self.risk_penalty
            )));
        }
        Ok(())
    }

    fn build_problem(&self, input: &OptimizationInput<'_>, cap: f64) -> ConicProblem {
        let n = input.n_assets();
        let m = input.n_periods();
        let zeta = n;
        let u = |i: usize| n + 1 + i;
        let n_vars = n + 1 + m;

        let mean = input
            .returns
            .mean_axis(Axis(1))
            .unwrap_or_else(|| ndarray::Array1::zeros(n));

        let mut q = vec![0.0; n_vars];
        for j in 0..n {
            q[j] = -mean[j] + self.risk_penalty * input.risk_scores[j];
        }
        q[zeta] = 1.0;
        let tail_scale = 1.0 / ((1.0 - self.alpha) * m as f64);
        for i in 0..m {
            q[u(i)] = tail_scale;
        }

        let n_ineq = 2 * m + 2 * n;
        let mut a = TripletMatrix::new(1 + n_ineq, n_vars);
        let mut b = vec![0.0; 1 + n_ineq];

        // sum(w) = 1
        for j in 0..n {
            a.push(0, j, 1.0);
        }
        b[0] = 1.0;

        let mut row = 1;
        // -(r_i . w) - zeta - u_i <= 0
        for i in 0..m {
            for j in 0..n {
                a.push(row, j, -input.returns[[j, i]]);
            }
            a.push(row, zeta, -1.0);
            a.push(row, u(i), -1.0);
            row += 1;
        }
        // -u_i <= 0
        for i in 0..m {
            a.push(row, u(i), -1.0);
            row += 1;
        }
        // -w_j <= 0
        for j in 0..n {
            a.push(row, j, -1.0);
            row += 1;
        }
        // w_j <= cap
        for j in 0..n {
            a.push(row, j, 1.0);
            b[row] = cap;
            row += 1;
        }

        ConicProblem {
            p: TripletMatrix::new(n_vars, n_vars),
            q,
            a,
            b,
            n_equalities: 1,
            n_inequalities: n_ineq,
        }
    }
}

impl PortfolioOptimizer for CvarOptimizer {
    fn method(&self) -> AllocationMethod {
        AllocationMethod::Cvar
    }

    fn optimize(&self, input: &OptimizationInput<'_>) -> Result<Allocation, AllocError> {
        let n = input.n_assets();
        let cap = input.max_weight()?;
        let mut flags = Vec::new();

        let (weights, status) = if !cap_is_feasible(n, cap) {
            warn!(
                regime = %input.regime,
                assets = n,
                max_weight = cap,
                "Cap admits only equal weights, skipping CVaR solve"
            );
            flags.push(CycleFlag::CapRelaxed);
            (equal_weights(n), SolveStatus::ClosedForm)
        } else {
            debug!(
                regime = %input.regime,
                assets = n,
                periods = input.n_periods(),
                alpha = self.alpha,
                "Solving CVaR program"
            );
            let solution = solver::solve(self.build_problem(input, cap), &self.solver);
            let raw: Vec<f64> = if solution.x.len() >= n {
                solution.x[..n].to_vec()
            } else {
                vec![0.0; n]
            };

            let normalized = clip_and_normalize(&raw);
            if normalized.degenerate {
                warn!(regime = %input.regime, "CVaR solve produced degenerate weights");
                flags.push(CycleFlag::DegenerateWeights);
            }
            if !solution.status.is_optimal() {
                warn!(status = %solution.status, "CVaR solve not optimal, keeping weights");
            }
            (enforce_cap(&normalized.weights, cap), solution.status)
        };

        let diagnostics = Diagnostics::evaluate(
            AllocationMethod::Cvar,
            status,
            input,
            &weights,
            self.alpha,
            flags,
        );
        debug!(
            cvar = diagnostics.cvar_estimate,
            sharpe = diagnostics.train_sharpe,
            positions = diagnostics.nonzero_positions,
            "CVaR optimization complete"
        );

        Ok(Allocation {
            weights: WeightVector::new(input.assets.to_vec(), weights)?,
            diagnostics,
        })
    }
}
