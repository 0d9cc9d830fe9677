//! Maximum-Sharpe leg of the ensemble
//!
//! The Sharpe ratio `w.mu / sqrt(w' S w)` is scale invariant, so with
//! `y = w / (w.mu)` the problem becomes the convex QP
//!
//! ```text
//! min y' S y   s.t.  mu.y = 1,  y >= 0,  y_j <= cap * sum(y)
//! ```
//!
//! and `w = y / sum(y)`. This needs at least one positive mean; otherwise
//! (or if the QP fails) the capped minimum-variance portfolio is used.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use tracing::{debug, warn};

use super::solver::{self, ConicProblem, SolverSettings, TripletMatrix};
use super::weights::{cap_is_feasible, clip_and_normalize, enforce_cap, equal_weights};
use super::SolveStatus;
use crate::error::CycleFlag;

/// Ridge added to the covariance diagonal
const COV_RIDGE: f64 = 1e-9;

/// Result of the max-Sharpe solve
#[derive(Debug, Clone, PartialEq)]
pub struct SharpeLeg {
    pub weights: Vec<f64>,
    pub status: SolveStatus,
    /// Min-variance fallback was used
    pub fell_back: bool,
    pub flags: Vec<CycleFlag>,
}

#[derive(Debug, Clone)]
pub struct MaxSharpeSolver {
    cap: f64,
    solver: SolverSettings,
}

impl MaxSharpeSolver {
    pub fn new(cap: f64, solver: SolverSettings) -> Self {
        Self { cap, solver }
    }

    pub fn cap(&self) -> f64 {
        self.cap
    }

    /// `returns` is (assets x periods)
    pub fn solve(&self, returns: ArrayView2<'_, f64>) -> SharpeLeg {
        let n = returns.nrows();
        if !cap_is_feasible(n, self.cap) {
            return SharpeLeg {
                weights: equal_weights(n),
                status: SolveStatus::ClosedForm,
                fell_back: false,
                flags: vec![CycleFlag::CapRelaxed],
            };
        }

        let mean = returns
            .mean_axis(Axis(1))
            .unwrap_or_else(|| Array1::zeros(n));
        let cov = sample_covariance(returns);

        if mean.iter().any(|&m| m > 0.0) {
            let solution = solver::solve(self.sharpe_problem(&mean, &cov), &self.solver);
            if solution.status.is_optimal() && solution.x.len() >= n {
                let normalized = clip_and_normalize(&solution.x[..n]);
                if !normalized.degenerate {
                    return SharpeLeg {
                        weights: enforce_cap(&normalized.weights, self.cap),
                        status: solution.status,
                        fell_back: false,
                        flags: Vec::new(),
                    };
                }
            }
            warn!(status = %solution.status, "Max-Sharpe solve failed, using min-variance");
        } else {
            debug!("No positive mean return, using min-variance");
        }

        self.min_variance(&cov)
    }

    fn min_variance(&self, cov: &Array2<f64>) -> SharpeLeg {
        let n = cov.nrows();
        let solution = solver::solve(self.min_variance_problem(cov), &self.solver);
        let raw = if solution.x.len() >= n {
            solution.x[..n].to_vec()
        } else {
            vec![0.0; n]
        };
        let normalized = clip_and_normalize(&raw);
        let mut flags = Vec::new();
        if normalized.degenerate {
            flags.push(CycleFlag::DegenerateWeights);
        }
        SharpeLeg {
            weights: enforce_cap(&normalized.weights, self.cap),
            status: solution.status,
            fell_back: true,
            flags,
        }
    }

    fn quadratic_term(cov: &Array2<f64>) -> TripletMatrix {
        let n = cov.nrows();
        let mut p = TripletMatrix::new(n, n);
        for col in 0..n {
            for row in 0..=col {
                p.push(row, col, cov[[row, col]]);
            }
        }
        p
    }

    fn sharpe_problem(&self, mean: &Array1<f64>, cov: &Array2<f64>) -> ConicProblem {
        let n = mean.len();
        let mut a = TripletMatrix::new(1 + 2 * n, n);
        let mut b = vec![0.0; 1 + 2 * n];

        // mu . y = 1
        for j in 0..n {
            a.push(0, j, mean[j]);
        }
        b[0] = 1.0;
        // -y_j <= 0
        for j in 0..n {
            a.push(1 + j, j, -1.0);
        }
        // y_j - cap * sum(y) <= 0
        for j in 0..n {
            for k in 0..n {
                let coef = if j == k { 1.0 - self.cap } else { -self.cap };
                a.push(1 + n + j, k, coef);
            }
        }

        ConicProblem {
            p: Self::quadratic_term(cov),
            q: vec![0.0; n],
            a,
            b,
            n_equalities: 1,
            n_inequalities: 2 * n,
        }
    }

    fn min_variance_problem(&self, cov: &Array2<f64>) -> ConicProblem {
        let n = cov.nrows();
        let mut a = TripletMatrix::new(1 + 2 * n, n);
        let mut b = vec![0.0; 1 + 2 * n];

        for j in 0..n {
            a.push(0, j, 1.0);
            a.push(1 + j, j, -1.0);
            a.push(1 + n + j, j, 1.0);
            b[1 + n + j] = self.cap;
        }
        b[0] = 1.0;

        ConicProblem {
            p: Self::quadratic_term(cov),
            q: vec![0.0; n],
            a,
            b,
            n_equalities: 1,
            n_inequalities: 2 * n,
        }
    }
}

/// Sample covariance (n - 1 denominator) of an (assets x periods) matrix,
/// with a small ridge on the diagonal
pub fn sample_covariance(returns: ArrayView2<'_, f64>) -> Array2<f64> {
    let (n, m) = returns.dim();
    let mut cov = Array2::<f64>::zeros((n, n));
    if m >= 2 {
        let mean = returns
            .mean_axis(Axis(1))
            .unwrap_or_else(|| Array1::zeros(n));
        let centered = &returns - &mean.insert_axis(Axis(1));
        cov = centered.dot(&centered.t()) / (m - 1) as f64;
    }
    for j in 0..n {
        cov[[j, j]] += COV_RIDGE;
    }
    cov
}
