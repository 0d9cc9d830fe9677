//! Thin layer over the Clarabel interior-point solver
//!
//! Problems are stated in Clarabel's standard form
//! `min 1/2 x'Px + q'x  s.t.  Ax + s = b, s in K`, with `K` a product of a
//! zero cone (equalities) and a nonnegative cone (`Ax <= b` rows).

use clarabel::algebra::*;
use clarabel::solver::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::SolveStatus;

/// Iteration and wall-clock budget for a single solve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverSettings {
    pub max_iter: u32,
    /// Expiry is reported as `SolveStatus::TimeLimit`
    pub time_limit_secs: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iter: 200,
            time_limit_secs: 10.0,
        }
    }
}

/// Sparse matrix assembled from (row, col, value) entries
#[derive(Debug, Clone)]
pub(crate) struct TripletMatrix {
    nrows: usize,
    ncols: usize,
    entries: Vec<(usize, usize, f64)>,
}

impl TripletMatrix {
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, row: usize, col: usize, value: f64) {
        debug_assert!(row < self.nrows && col < self.ncols);
        if value != 0.0 {
            self.entries.push((row, col, value));
        }
    }

    /// Compressed sparse column form, duplicates summed
    pub fn into_csc(mut self) -> CscMatrix<f64> {
        self.entries.sort_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)));

        let mut colptr = vec![0usize; self.ncols + 1];
        let mut rowval: Vec<usize> = Vec::with_capacity(self.entries.len());
        let mut nzval: Vec<f64> = Vec::with_capacity(self.entries.len());
        let mut last: Option<(usize, usize)> = None;

        for (row, col, value) in self.entries {
            if last == Some((row, col)) {
                if let Some(v) = nzval.last_mut() {
                    *v += value;
                }
                continue;
            }
            rowval.push(row);
            nzval.push(value);
            colptr[col + 1] += 1;
            last = Some((row, col));
        }
        for c in 0..self.ncols {
            colptr[c + 1] += colptr[c];
        }

        CscMatrix::new(self.nrows, self.ncols, colptr, rowval, nzval)
    }
}

/// Conic program ready for Clarabel
pub(crate) struct ConicProblem {
    /// Upper triangle of the quadratic term
    pub p: TripletMatrix,
    pub q: Vec<f64>,
    pub a: TripletMatrix,
    pub b: Vec<f64>,
    pub n_equalities: usize,
    pub n_inequalities: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct ConicSolution {
    /// Primal point; empty when the solver could not be set up
    pub x: Vec<f64>,
    pub status: SolveStatus,
}

fn map_status(status: SolverStatus) -> SolveStatus {
    match status {
        SolverStatus::Solved => SolveStatus::Optimal,
        SolverStatus::AlmostSolved => SolveStatus::NearOptimal,
        SolverStatus::PrimalInfeasible
        | SolverStatus::DualInfeasible
        | SolverStatus::AlmostPrimalInfeasible
        | SolverStatus::AlmostDualInfeasible => SolveStatus::Infeasible,
        SolverStatus::MaxIterations => SolveStatus::IterationLimit,
        SolverStatus::MaxTime => SolveStatus::TimeLimit,
        _ => SolveStatus::NumericalFailure,
    }
}

pub(crate) fn solve(problem: ConicProblem, settings: &SolverSettings) -> ConicSolution {
    let failed = ConicSolution {
        x: Vec::new(),
        status: SolveStatus::NumericalFailure,
    };

    let built = DefaultSettingsBuilder::default()
        .max_iter(settings.max_iter)
        .time_limit(settings.time_limit_secs)
        .verbose(false)
        .build();
    let clarabel_settings = match built {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to build solver settings: {}", e);
            return failed;
        }
    };

    let p = problem.p.into_csc();
    let a = problem.a.into_csc();
    let cones = [
        ZeroConeT(problem.n_equalities),
        NonnegativeConeT(problem.n_inequalities),
    ];

    let mut solver =
        match DefaultSolver::new(&p, &problem.q, &a, &problem.b, &cones, clarabel_settings) {
            Ok(solver) => solver,
            Err(e) => {
                warn!("Failed to create solver: {:?}", e);
                return failed;
            }
        };

    solver.solve();

    let status = map_status(solver.solution.status);
    debug!(
        status = %status,
        iterations = solver.solution.iterations,
        objective = solver.solution.obj_val,
        "Conic solve finished"
    );

    ConicSolution {
        x: solver.solution.x.clone(),
        status,
    }
}
