use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::Regime;

/// Errors that stop a run before or outside of a cycle.
///
/// Per-cycle recoveries (solver status, degenerate weights, missing regime
/// labels, ...) are never errors; they travel as [`CycleFlag`]s.
#[derive(Error, Debug)]
pub enum AllocError {
    #[error("invalid returns panel: {0}")]
    InvalidPanel(String),

    #[error("invalid risk score {score} for {asset}")]
    InvalidRiskScore { asset: String, score: f64 },

    #[error("risk scores missing for {0:?}")]
    MissingRiskScores(Vec<String>),

    #[error("unknown regime id {0}")]
    UnknownRegime(i64),

    #[error("no regime constraint configured for {0}")]
    MissingRegimeConstraint(Regime),

    #[error("invalid max_weight {max_weight} for regime {regime}")]
    InvalidConstraint { regime: Regime, max_weight: f64 },

    #[error("{what}: expected {expected} entries, got {got}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("investable universe is empty")]
    EmptyUniverse,

    #[error("invalid walk-forward window: {0}")]
    InvalidWindow(String),

    #[error("config error: {0}")]
    Config(String),
}

/// Recovered per-cycle condition recorded in diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleFlag {
    /// Solver stopped without an optimality certificate
    SolverNonOptimal,
    /// Post-processing collapsed to ~0 and fell back to equal weights
    DegenerateWeights,
    /// No regime label at or before the training end; transition used
    MissingRegimeLabel,
    /// Too little history for the momentum tilt; step skipped
    InsufficientHistory,
    /// External proposal absent or malformed; ensemble used
    ExternalPolicyUnavailable,
    /// n * cap <= 1, equal weights returned without solving
    CapRelaxed,
}

impl fmt::Display for CycleFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleFlag::SolverNonOptimal => write!(f, "SOLVER_NON_OPTIMAL"),
            CycleFlag::DegenerateWeights => write!(f, "DEGENERATE_WEIGHTS"),
            CycleFlag::MissingRegimeLabel => write!(f, "MISSING_REGIME_LABEL"),
            CycleFlag::InsufficientHistory => write!(f, "INSUFFICIENT_HISTORY"),
            CycleFlag::ExternalPolicyUnavailable => write!(f, "EXTERNAL_POLICY_UNAVAILABLE"),
            CycleFlag::CapRelaxed => write!(f, "CAP_RELAXED"),
        }
    }
}
