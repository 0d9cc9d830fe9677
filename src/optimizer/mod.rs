//! Allocation engine
//!
//! Every optimizer is an explicitly constructed, stateless object holding
//! only fixed configuration (alpha, risk penalty, blending tables). Each
//! `optimize` call is a pure function of its input plus that configuration.
//!
//! - [`CvarOptimizer`]: Rockafellar-Uryasev CVaR linear program
//! - [`EnsembleOptimizer`]: regime blend of CVaR and max-Sharpe plus momentum tilt
//! - [`HybridOptimizer`]: regime blend of the ensemble with an external policy

pub mod cvar;
pub mod ensemble;
pub mod hybrid;
pub mod sharpe;
pub mod solver;
pub mod weights;

pub use cvar::CvarOptimizer;
pub use ensemble::{EnsembleOptimizer, EnsembleParams};
pub use hybrid::{ExternalPolicy, HybridOptimizer, HybridParams, PolicyProposal};
pub use sharpe::MaxSharpeSolver;
pub use solver::SolverSettings;

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AllocError, CycleFlag};
use crate::risk;
use crate::types::{Regime, RegimeConstraints, WeightVector};

/// Which allocation path produced a weight vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationMethod {
    Cvar,
    Ensemble,
    HybridExternalEnsemble,
}

impl fmt::Display for AllocationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationMethod::Cvar => write!(f, "CVaR"),
            AllocationMethod::Ensemble => write!(f, "Ensemble"),
            AllocationMethod::HybridExternalEnsemble => write!(f, "Hybrid-External-Ensemble"),
        }
    }
}

/// Outcome of the numerical solve behind a weight vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    Optimal,
    NearOptimal,
    Infeasible,
    IterationLimit,
    TimeLimit,
    NumericalFailure,
    /// Answer known without solving (e.g. the capped simplex is a single point)
    ClosedForm,
}

impl SolveStatus {
    pub fn is_optimal(&self) -> bool {
        matches!(self, SolveStatus::Optimal | SolveStatus::ClosedForm)
    }
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveStatus::Optimal => write!(f, "OPTIMAL"),
            SolveStatus::NearOptimal => write!(f, "NEAR_OPTIMAL"),
            SolveStatus::Infeasible => write!(f, "INFEASIBLE"),
            SolveStatus::IterationLimit => write!(f, "ITERATION_LIMIT"),
            SolveStatus::TimeLimit => write!(f, "TIME_LIMIT"),
            SolveStatus::NumericalFailure => write!(f, "NUMERICAL_FAILURE"),
            SolveStatus::ClosedForm => write!(f, "CLOSED_FORM"),
        }
    }
}

/// Regime-indexed share given to the primary leg of a two-way blend
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlendTable {
    pub expansion: f64,
    pub transition: f64,
    pub crisis: f64,
}

impl BlendTable {
    /// CVaR share in the ensemble (remainder goes to max-Sharpe)
    pub const ENSEMBLE_CVAR_SHARE: BlendTable = BlendTable {
        expansion: 0.40,
        transition: 0.50,
        crisis: 0.70,
    };

    /// External-policy share in the hybrid (remainder goes to the ensemble)
    pub const HYBRID_EXTERNAL_SHARE: BlendTable = BlendTable {
        expansion: 0.60,
        transition: 0.50,
        crisis: 0.30,
    };

    pub fn share(&self, regime: Regime) -> f64 {
        match regime {
            Regime::Expansion => self.expansion,
            Regime::Transition => self.transition,
            Regime::Crisis => self.crisis,
        }
    }

    pub fn validate(&self, name: &str) -> Result<(), AllocError> {
        for regime in Regime::ALL {
            let share = self.share(regime);
            if !(0.0..=1.0).contains(&share) {
                return Err(AllocError::Config(format!(
                    "{} share {} for {} outside [0, 1]",
                    name, share, regime
                )));
            }
        }
        Ok(())
    }
}

/// One cycle's optimization input. `returns` is (assets x periods).
#[derive(Debug, Clone, Copy)]
pub struct OptimizationInput<'a> {
    pub assets: &'a [String],
    pub returns: ArrayView2<'a, f64>,
    pub risk_scores: &'a [f64],
    pub regime: Regime,
    pub constraints: &'a RegimeConstraints,
}

impl<'a> OptimizationInput<'a> {
    pub fn new(
        assets: &'a [String],
        returns: ArrayView2<'a, f64>,
        risk_scores: &'a [f64],
        regime: Regime,
        constraints: &'a RegimeConstraints,
    ) -> Result<Self, AllocError> {
        if assets.is_empty() {
            return Err(AllocError::EmptyUniverse);
        }
        if returns.nrows() != assets.len() {
            return Err(AllocError::DimensionMismatch {
                what: "return matrix rows",
                expected: assets.len(),
                got: returns.nrows(),
            });
        }
        if returns.ncols() == 0 {
            return Err(AllocError::InvalidWindow(
                "training matrix has no periods".to_string(),
            ));
        }
        if risk_scores.len() != assets.len() {
            return Err(AllocError::DimensionMismatch {
                what: "risk scores",
                expected: assets.len(),
                got: risk_scores.len(),
            });
        }
        constraints.validate_for([regime])?;

        Ok(Self {
            assets,
            returns,
            risk_scores,
            regime,
            constraints,
        })
    }

    pub fn n_assets(&self) -> usize {
        self.assets.len()
    }

    pub fn n_periods(&self) -> usize {
        self.returns.ncols()
    }

    pub fn max_weight(&self) -> Result<f64, AllocError> {
        self.constraints.max_weight(self.regime)
    }
}

/// Per-allocation diagnostics record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub method: AllocationMethod,
    pub status: SolveStatus,
    /// In-sample empirical CVaR of the final weights (signed return)
    pub cvar_estimate: f64,
    /// In-sample per-period Sharpe of the final weights
    pub train_sharpe: f64,
    pub nonzero_positions: usize,
    pub flags: Vec<CycleFlag>,
}

impl Diagnostics {
    pub(crate) fn evaluate(
        method: AllocationMethod,
        status: SolveStatus,
        input: &OptimizationInput<'_>,
        weights: &[f64],
        alpha: f64,
        flags: Vec<CycleFlag>,
    ) -> Self {
        let mut diagnostics = Self {
            method,
            status,
            cvar_estimate: risk::portfolio_cvar(input.returns, weights, alpha),
            train_sharpe: risk::in_sample_sharpe(input.returns, weights),
            nonzero_positions: weights
                .iter()
                .filter(|&&w| w > WeightVector::POSITION_THRESHOLD)
                .count(),
            flags: Vec::new(),
        };
        for flag in flags {
            diagnostics.flag(flag);
        }
        if !status.is_optimal() {
            diagnostics.flag(CycleFlag::SolverNonOptimal);
        }
        diagnostics
    }

    pub fn flag(&mut self, flag: CycleFlag) {
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
    }

    pub fn has_flag(&self, flag: CycleFlag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn is_flagged(&self) -> bool {
        !self.flags.is_empty()
    }
}

/// Weights plus the diagnostics of how they were obtained
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub weights: WeightVector,
    pub diagnostics: Diagnostics,
}

/// Common interface of the CVaR, ensemble and hybrid optimizers
pub trait PortfolioOptimizer {
    /// Nominal method of this optimizer
    fn method(&self) -> AllocationMethod;

    /// Produce one cycle's allocation
    fn optimize(&self, input: &OptimizationInput<'_>) -> Result<Allocation, AllocError>;
}

impl<T: PortfolioOptimizer + ?Sized> PortfolioOptimizer for Box<T> {
    fn method(&self) -> AllocationMethod {
        (**self).method()
    }

    fn optimize(&self, input: &OptimizationInput<'_>) -> Result<Allocation, AllocError> {
        (**self).optimize(input)
    }
}
