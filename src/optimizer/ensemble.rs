//! Ensemble Optimizer - CVaR and max-Sharpe blended by regime, then momentum-tilted

use ndarray::{ArrayView2, Axis, Slice};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::sharpe::MaxSharpeSolver;
use super::weights::{blend, cap_is_feasible, clip_and_normalize, enforce_cap};
use super::{
    Allocation, AllocationMethod, BlendTable, CvarOptimizer, Diagnostics, OptimizationInput,
    PortfolioOptimizer,
};
use crate::error::{AllocError, CycleFlag};
use crate::types::WeightVector;

const MOMENTUM_EPS: f64 = 1e-9;

/// Fixed blending and tilt configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnsembleParams {
    /// Per-asset cap of the max-Sharpe leg, independent of regime
    pub sharpe_max_weight: f64,
    /// Trailing periods used for the momentum signal
    pub momentum_lookback: usize,
    pub momentum_strength: f64,
    /// z-scores are clipped to [-clip, clip]
    pub momentum_z_clip: f64,
    /// Share of the CVaR leg per regime
    pub cvar_share: BlendTable,
}

impl Default for EnsembleParams {
    fn default() -> Self {
        Self {
            sharpe_max_weight: 0.15,
            momentum_lookback: 126,
            momentum_strength: 0.15,
            momentum_z_clip: 2.0,
            cvar_share: BlendTable::ENSEMBLE_CVAR_SHARE,
        }
    }
}

impl EnsembleParams {
    pub fn validate(&self) -> Result<(), AllocError> {
        if !(self.sharpe_max_weight > 0.0 && self.sharpe_max_weight <= 1.0) {
            return Err(AllocError::Config(format!(
                "sharpe_max_weight {} must lie in (0, 1]",
                self.sharpe_max_weight
            )));
        }
        if self.momentum_lookback == 0 {
            return Err(AllocError::Config("momentum_lookback must be >= 1".into()));
        }
        if !(self.momentum_z_clip > 0.0) || !self.momentum_strength.is_finite() {
            return Err(AllocError::Config("invalid momentum tilt settings".into()));
        }
        self.cvar_share.validate("ensemble.cvar_share")
    }
}

/// Scale `weights` by `1 + strength * z` where `z` is the clipped
/// cross-sectional z-score of each asset's trailing mean return.
///
/// Returns `None` when fewer than `lookback` periods are available.
/// The result is floored at zero but not renormalised.
pub fn momentum_tilt(
    returns: ArrayView2<'_, f64>,
    weights: &[f64],
    lookback: usize,
    strength: f64,
    z_clip: f64,
) -> Option<Vec<f64>> {
    let periods = returns.ncols();
    if periods < lookback || lookback == 0 {
        return None;
    }

    let recent = returns.slice_axis(Axis(1), Slice::from(periods - lookback..));
    let momentum = recent.mean_axis(Axis(1))?;
    let n = momentum.len() as f64;
    let mu = momentum.sum() / n;
    let sd = (momentum.iter().map(|m| (m - mu).powi(2)).sum::<f64>() / n).sqrt();

    Some(
        weights
            .iter()
            .zip(momentum.iter())
            .map(|(&w, &m)| {
                let z = ((m - mu) / (sd + MOMENTUM_EPS)).clamp(-z_clip, z_clip);
                (w * (1.0 + strength * z)).max(0.0)
            })
            .collect(),
    )
}

#[derive(Debug, Clone)]
pub struct EnsembleOptimizer {
    cvar: CvarOptimizer,
    sharpe: MaxSharpeSolver,
    params: EnsembleParams,
}

impl EnsembleOptimizer {
    pub fn new(cvar: CvarOptimizer, params: EnsembleParams) -> Self {
        let sharpe = MaxSharpeSolver::new(params.sharpe_max_weight, cvar.solver_settings());
        Self {
            cvar,
            sharpe,
            params,
        }
    }

    pub fn params(&self) -> &EnsembleParams {
        &self.params
    }

    pub fn alpha(&self) -> f64 {
        self.cvar.alpha()
    }
}

impl PortfolioOptimizer for EnsembleOptimizer {
    fn method(&self) -> AllocationMethod {
        AllocationMethod::Ensemble
    }

    fn optimize(&self, input: &OptimizationInput<'_>) -> Result<Allocation, AllocError> {
        let cap = input.max_weight()?;
        let cvar = self.cvar.optimize(input)?;
        let sharpe = self.sharpe.solve(input.returns);

        let mut flags: Vec<CycleFlag> = cvar.diagnostics.flags.clone();
        flags.extend(sharpe.flags.iter().copied());

        let share = self.params.cvar_share.share(input.regime);
        info!(
            regime = %input.regime,
            cvar_share = share,
            sharpe_share = 1.0 - share,
            sharpe_fallback = sharpe.fell_back,
            "Blending ensemble legs"
        );
        let blended = blend(cvar.weights.weights(), &sharpe.weights, share);

        let tilted = match momentum_tilt(
            input.returns,
            &blended,
            self.params.momentum_lookback,
            self.params.momentum_strength,
            self.params.momentum_z_clip,
        ) {
            Some(tilted) => tilted,
            None => {
                debug!(
                    periods = input.n_periods(),
                    lookback = self.params.momentum_lookback,
                    "Insufficient history, skipping momentum tilt"
                );
                flags.push(CycleFlag::InsufficientHistory);
                blended
            }
        };

        let normalized = clip_and_normalize(&tilted);
        if normalized.degenerate {
            flags.push(CycleFlag::DegenerateWeights);
        }
        let weights = if cap_is_feasible(input.n_assets(), cap) {
            enforce_cap(&normalized.weights, cap)
        } else {
            normalized.weights
        };

        // Report the first leg that missed optimality
        let status = if cvar.diagnostics.status.is_optimal() && !sharpe.status.is_optimal() {
            sharpe.status
        } else {
            cvar.diagnostics.status
        };

        let diagnostics = Diagnostics::evaluate(
            AllocationMethod::Ensemble,
            status,
            input,
            &weights,
            self.cvar.alpha(),
            flags,
        );
        info!(
            cvar = diagnostics.cvar_estimate,
            sharpe = diagnostics.train_sharpe,
            positions = diagnostics.nonzero_positions,
            "Ensemble complete"
        );

        Ok(Allocation {
            weights: WeightVector::new(input.assets.to_vec(), weights)?,
            diagnostics,
        })
    }
}
