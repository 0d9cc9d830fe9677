//! Configuration section types

use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

use crate::optimizer::SolverSettings;
use crate::types::RegimeConstraints;

/// Which allocator drives the walk-forward run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Cvar,
    Ensemble,
    Hybrid,
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Cvar => write!(f, "cvar"),
            OptimizerKind::Ensemble => write!(f, "ensemble"),
            OptimizerKind::Hybrid => write!(f, "hybrid"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptimizerConfig {
    pub method: OptimizerKind,
    /// CVaR confidence level
    pub alpha: f64,
    /// Weight of the risk-score penalty in the CVaR objective
    pub risk_penalty: f64,
    /// Interior-point iteration limit per solve
    pub max_iter: u32,
    /// Wall-clock budget per solve in seconds
    pub time_limit_secs: f64,
}

impl OptimizerConfig {
    pub fn solver_settings(&self) -> SolverSettings {
        SolverSettings {
            max_iter: self.max_iter,
            time_limit_secs: self.time_limit_secs,
        }
    }
}

/// Per-asset weight caps by regime
#[derive(Debug, Clone, Deserialize)]
pub struct RegimeConstraintsConfig {
    pub expansion: f64,
    pub transition: f64,
    pub crisis: f64,
}

impl RegimeConstraintsConfig {
    pub fn to_constraints(&self) -> RegimeConstraints {
        RegimeConstraints::from_caps(self.expansion, self.transition, self.crisis)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    /// Wide returns CSV (`date,<asset>...`)
    pub returns_path: PathBuf,
    /// `ticker,risk_score` CSV
    pub risk_scores_path: PathBuf,
    /// `date,regime` CSV
    pub regimes_path: PathBuf,
    /// Directory for cycle, weight and report files
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}
