//! Risk measures and performance metrics
//!
//! Implements:
//! - Empirical CVaR (expected shortfall) of a return sample
//! - Rockafellar-Uryasev CVaR of portfolio losses (the LP objective term)
//! - In-sample Sharpe used in optimizer diagnostics
//! - Out-of-sample performance summary for a walk-forward test window

use ndarray::{Array1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Denominator guard used by the in-sample Sharpe diagnostic
const SHARPE_EPS: f64 = 1e-9;
/// Volatility below this is treated as zero
const ZERO_VOL: f64 = 1e-12;

/// Percentile `p` (0..=100) of `sample`, linear interpolation between order statistics
pub fn percentile(sample: &[f64], p: f64) -> f64 {
    if sample.is_empty() {
        return 0.0;
    }
    let mut sorted = sample.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + frac * (sorted[hi] - sorted[lo])
}

/// Mean of the observations at or below the (1 - alpha) percentile.
///
/// Signed in return terms: a worse tail gives a more negative value.
pub fn empirical_cvar(sample: &[f64], alpha: f64) -> f64 {
    if sample.is_empty() {
        return 0.0;
    }
    let var = percentile(sample, (1.0 - alpha) * 100.0);
    let (sum, count) = sample
        .iter()
        .filter(|&&r| r <= var)
        .fold((0.0, 0usize), |(s, c), &r| (s + r, c + 1));
    if count == 0 {
        var
    } else {
        sum / count as f64
    }
}

/// Per-period portfolio returns for an (assets x periods) matrix
pub fn portfolio_returns(returns: ArrayView2<'_, f64>, weights: &[f64]) -> Vec<f64> {
    let w = Array1::from(weights.to_vec());
    returns.t().dot(&w).to_vec()
}

/// Empirical CVaR of the portfolio formed by `weights`
pub fn portfolio_cvar(returns: ArrayView2<'_, f64>, weights: &[f64], alpha: f64) -> f64 {
    empirical_cvar(&portfolio_returns(returns, weights), alpha)
}

/// Value-at-Risk / CVaR pair on the loss side (positive = loss)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossTail {
    pub var: f64,
    pub cvar: f64,
}

/// Rockafellar-Uryasev estimate `min_z z + sum(max(L_i - z, 0)) / ((1 - alpha) n)`
/// for losses `L_i = -r_i . w`.
///
/// The function is piecewise linear and convex in `z` with breakpoints at
/// the sample losses, so the minimum is found exactly by scanning them.
pub fn rockafellar_uryasev_cvar(
    returns: ArrayView2<'_, f64>,
    weights: &[f64],
    alpha: f64,
) -> LossTail {
    let mut losses: Vec<f64> = portfolio_returns(returns, weights)
        .into_iter()
        .map(|r| -r)
        .collect();
    if losses.is_empty() {
        return LossTail { var: 0.0, cvar: 0.0 };
    }
    losses.sort_by(f64::total_cmp);

    let n = losses.len();
    let scale = 1.0 / ((1.0 - alpha) * n as f64);
    let mut suffix = vec![0.0; n + 1];
    for i in (0..n).rev() {
        suffix[i] = suffix[i + 1] + losses[i];
    }

    let mut best = LossTail {
        var: losses[0],
        cvar: f64::INFINITY,
    };
    for (k, &z) in losses.iter().enumerate() {
        let excess = suffix[k + 1] - (n - k - 1) as f64 * z;
        let value = z + scale * excess.max(0.0);
        if value < best.cvar {
            best = LossTail { var: z, cvar: value };
        }
    }
    best
}

/// `w . mean / (std(portfolio) + eps)`, per period (not annualised)
pub fn in_sample_sharpe(returns: ArrayView2<'_, f64>, weights: &[f64]) -> f64 {
    let port = portfolio_returns(returns, weights);
    if port.is_empty() {
        return 0.0;
    }
    let expected: f64 = returns
        .mean_axis(Axis(1))
        .map(|m| m.iter().zip(weights).map(|(m, w)| m * w).sum())
        .unwrap_or(0.0);
    expected / (population_std(&port) + SHARPE_EPS)
}

fn mean(sample: &[f64]) -> f64 {
    sample.iter().sum::<f64>() / sample.len() as f64
}

fn population_std(sample: &[f64]) -> f64 {
    let m = mean(sample);
    (sample.iter().map(|r| (r - m).powi(2)).sum::<f64>() / sample.len() as f64).sqrt()
}

fn sample_std(sample: &[f64]) -> f64 {
    if sample.len() < 2 {
        return 0.0;
    }
    let m = mean(sample);
    (sample.iter().map(|r| (r - m).powi(2)).sum::<f64>() / (sample.len() - 1) as f64).sqrt()
}

/// Out-of-sample performance of one test window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    /// Compounded return over the window
    pub total_return: f64,
    /// Geometric annualisation of the total return
    pub annual_return: f64,
    /// Sample standard deviation, annualised
    pub annual_volatility: f64,
    /// annual_return / annual_volatility, 0 when volatility vanishes
    pub sharpe: f64,
    /// Worst peak-to-trough move of the equity path (<= 0)
    pub max_drawdown: f64,
    /// Mean of returns at or below the 5th percentile
    pub cvar_95: f64,
}

impl Default for PerformanceSummary {
    fn default() -> Self {
        Self {
            total_return: 0.0,
            annual_return: 0.0,
            annual_volatility: 0.0,
            sharpe: 0.0,
            max_drawdown: 0.0,
            cvar_95: 0.0,
        }
    }
}

impl PerformanceSummary {
    pub fn from_returns(returns: &[f64], periods_per_year: f64) -> Self {
        if returns.is_empty() {
            return Self::default();
        }

        let growth: f64 = returns.iter().map(|r| 1.0 + r).product();
        let total_return = growth - 1.0;
        let annual_return = if growth > 0.0 {
            growth.powf(periods_per_year / returns.len() as f64) - 1.0
        } else {
            -1.0
        };
        let annual_volatility = sample_std(returns) * periods_per_year.sqrt();
        let sharpe = if annual_volatility > ZERO_VOL {
            annual_return / annual_volatility
        } else {
            0.0
        };

        // Equity starts at 1.0 so a loss in the first period counts
        let mut equity = 1.0;
        let mut peak: f64 = 1.0;
        let mut max_drawdown: f64 = 0.0;
        for r in returns {
            equity *= 1.0 + r;
            peak = peak.max(equity);
            max_drawdown = max_drawdown.min((equity - peak) / peak);
        }

        Self {
            total_return,
            annual_return,
            annual_volatility,
            sharpe,
            max_drawdown,
            cvar_95: empirical_cvar(returns, 0.95),
        }
    }
}
