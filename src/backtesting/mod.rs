//! Walk-Forward Backtesting Module
//!
//! Drives an optimizer over a returns panel on a rolling, non-overlapping
//! schedule:
//! - Fit weights on `[start - train, start)`
//! - Hold them fixed over `[start, start + test)`
//! - Score the test window out of sample, then advance by `test`
//!
//! The regime for a cycle is resolved from labels dated at or before the
//! last training date only.

use chrono::NaiveDate;
use ndarray::{Array1, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use tracing::{debug, info, warn};

use crate::error::{AllocError, CycleFlag};
use crate::optimizer::{Diagnostics, OptimizationInput, PortfolioOptimizer};
use crate::risk::PerformanceSummary;
use crate::types::{
    Regime, RegimeConstraints, RegimeSeries, ReturnsPanel, RiskScoreVector, WeightVector,
};

/// Walk-forward schedule
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardConfig {
    /// Training periods per cycle
    pub train_window: usize,
    /// Test periods per cycle (also the step)
    pub test_window: usize,
    /// Annualisation base for the test metrics
    pub periods_per_year: f64,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            train_window: 756,
            test_window: 252,
            periods_per_year: 252.0,
        }
    }
}

impl WalkForwardConfig {
    pub fn validate(&self) -> Result<(), AllocError> {
        if self.train_window == 0 || self.test_window == 0 {
            return Err(AllocError::InvalidWindow(format!(
                "train {} / test {} must both be >= 1",
                self.train_window, self.test_window
            )));
        }
        if !(self.periods_per_year > 0.0) {
            return Err(AllocError::InvalidWindow(format!(
                "periods_per_year {} must be positive",
                self.periods_per_year
            )));
        }
        Ok(())
    }
}

/// Row ranges of one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleWindow {
    pub cycle_index: usize,
    pub train: Range<usize>,
    pub test: Range<usize>,
}

/// Every full train+test window that fits in `len` rows. A trailing partial
/// test window is never emitted.
pub fn plan_windows(len: usize, train: usize, test: usize) -> Vec<CycleWindow> {
    let mut windows = Vec::new();
    if train == 0 || test == 0 {
        return windows;
    }

    let mut start = train;
    while start + test <= len {
        windows.push(CycleWindow {
            cycle_index: windows.len(),
            train: start - train..start,
            test: start..start + test,
        });
        start += test;
    }
    windows
}

/// Harness state, logged on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    AwaitingCycle,
    Training,
    Testing,
    Recorded,
    Exhausted,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CyclePhase::AwaitingCycle => write!(f, "AWAITING_CYCLE"),
            CyclePhase::Training => write!(f, "TRAINING"),
            CyclePhase::Testing => write!(f, "TESTING"),
            CyclePhase::Recorded => write!(f, "RECORDED"),
            CyclePhase::Exhausted => write!(f, "EXHAUSTED"),
        }
    }
}

fn enter(phase: &mut CyclePhase, next: CyclePhase, cycle: usize) {
    debug!(cycle, from = %phase, to = %next, "Walk-forward phase");
    *phase = next;
}

/// Index range plus the dates at its ends (inclusive)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub first_date: NaiveDate,
    pub last_date: NaiveDate,
}

impl Span {
    fn of(range: &Range<usize>, dates: &[NaiveDate]) -> Self {
        Self {
            start: range.start,
            end: range.end,
            first_date: dates[range.start],
            last_date: dates[range.end - 1],
        }
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Durable record of one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleResult {
    pub cycle_index: usize,
    pub train_span: Span,
    pub test_span: Span,
    pub regime: Regime,
    /// No label at or before the training end; transition was used
    pub regime_defaulted: bool,
    pub weights: WeightVector,
    pub diagnostics: Diagnostics,
    /// Realised fixed-weight returns over the test window
    pub realized_returns: Vec<f64>,
    pub performance: PerformanceSummary,
}

/// Out-of-sample goals checked against the run averages
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceTargets {
    pub target_sharpe: f64,
    /// Non-positive; the average drawdown must not be worse
    pub target_max_drawdown: f64,
}

impl Default for PerformanceTargets {
    fn default() -> Self {
        Self {
            target_sharpe: 1.0,
            target_max_drawdown: -0.20,
        }
    }
}

/// Aggregate over all cycles of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardReport {
    pub n_cycles: usize,
    pub flagged_cycles: usize,
    pub avg_sharpe: f64,
    pub avg_max_drawdown: f64,
    pub avg_cvar_95: f64,
    pub avg_total_return: f64,
    /// Share of cycles whose test window ended with a positive total return
    pub win_rate: f64,
    pub sharpe_target_met: bool,
    pub drawdown_target_met: bool,
}

impl WalkForwardReport {
    pub fn targets_met(&self) -> bool {
        self.sharpe_target_met && self.drawdown_target_met
    }

    pub fn print(&self) {
        println!("\n=== WALK-FORWARD REPORT ===");
        println!("Cycles:           {}", self.n_cycles);
        println!("Flagged cycles:   {}", self.flagged_cycles);
        println!("Avg Sharpe:       {:.2}", self.avg_sharpe);
        println!("Avg Max DD:       {:.2}%", self.avg_max_drawdown * 100.0);
        println!("Avg CVaR 95:      {:.2}%", self.avg_cvar_95 * 100.0);
        println!("Avg Return:       {:.2}%", self.avg_total_return * 100.0);
        println!("Win Rate:         {:.2}%", self.win_rate * 100.0);
        println!(
            "Sharpe target:    {}",
            if self.sharpe_target_met { "met" } else { "missed" }
        );
        println!(
            "Drawdown target:  {}",
            if self.drawdown_target_met { "met" } else { "missed" }
        );
    }
}

/// Output of one backtest run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardRun {
    pub cycles: Vec<CycleResult>,
    /// Panel assets dropped for lack of a risk score
    pub excluded_assets: Vec<String>,
}

impl WalkForwardRun {
    pub fn summary(&self, targets: &PerformanceTargets) -> WalkForwardReport {
        if self.cycles.is_empty() {
            return WalkForwardReport::default();
        }

        let n = self.cycles.len() as f64;
        let avg = |f: fn(&PerformanceSummary) -> f64| {
            self.cycles.iter().map(|c| f(&c.performance)).sum::<f64>() / n
        };
        let avg_sharpe = avg(|p| p.sharpe);
        let avg_max_drawdown = avg(|p| p.max_drawdown);

        let wins = self
            .cycles
            .iter()
            .filter(|c| c.performance.total_return > 0.0)
            .count();

        WalkForwardReport {
            n_cycles: self.cycles.len(),
            flagged_cycles: self
                .cycles
                .iter()
                .filter(|c| c.diagnostics.is_flagged())
                .count(),
            avg_sharpe,
            avg_max_drawdown,
            avg_cvar_95: avg(|p| p.cvar_95),
            avg_total_return: avg(|p| p.total_return),
            win_rate: wins as f64 / n,
            sharpe_target_met: avg_sharpe >= targets.target_sharpe,
            drawdown_target_met: avg_max_drawdown >= targets.target_max_drawdown,
        }
    }
}

/// Walk-forward harness around one optimizer
pub struct WalkForwardBacktester {
    optimizer: Box<dyn PortfolioOptimizer>,
    config: WalkForwardConfig,
}

impl WalkForwardBacktester {
    pub fn new(optimizer: Box<dyn PortfolioOptimizer>, config: WalkForwardConfig) -> Self {
        Self { optimizer, config }
    }

    pub fn config(&self) -> &WalkForwardConfig {
        &self.config
    }

    /// Run every full cycle. Fails only on malformed configuration, which is
    /// detected before the first cycle.
    pub fn run(
        &self,
        panel: &ReturnsPanel,
        risk_scores: &RiskScoreVector,
        regimes: &RegimeSeries,
        constraints: &RegimeConstraints,
    ) -> Result<WalkForwardRun, AllocError> {
        self.config.validate()?;

        let mut columns = Vec::new();
        let mut excluded_assets = Vec::new();
        for (idx, asset) in panel.assets().iter().enumerate() {
            if risk_scores.get(asset).is_some() {
                columns.push(idx);
            } else {
                excluded_assets.push(asset.clone());
            }
        }
        if !excluded_assets.is_empty() {
            warn!(
                excluded = ?excluded_assets,
                "Assets without a risk score excluded from the universe"
            );
        }
        if columns.is_empty() {
            return Err(AllocError::EmptyUniverse);
        }

        let mut required = regimes.regimes_seen();
        required.insert(Regime::default());
        constraints.validate_for(required)?;

        let assets: Vec<String> = columns
            .iter()
            .map(|&idx| panel.assets()[idx].clone())
            .collect();
        let scores = risk_scores.aligned(&assets)?;

        let windows = plan_windows(
            panel.len(),
            self.config.train_window,
            self.config.test_window,
        );
        info!(
            method = %self.optimizer.method(),
            periods = panel.len(),
            assets = assets.len(),
            cycles = windows.len(),
            train = self.config.train_window,
            test = self.config.test_window,
            "Starting walk-forward run"
        );

        let dates = panel.dates();
        let mut phase = CyclePhase::AwaitingCycle;
        let mut cycles = Vec::with_capacity(windows.len());

        for window in windows {
            let cycle = window.cycle_index;
            enter(&mut phase, CyclePhase::Training, cycle);

            let train_span = Span::of(&window.train, dates);
            let test_span = Span::of(&window.test, dates);

            let (regime, regime_defaulted) = match regimes.regime_at(train_span.last_date) {
                Some(regime) => (regime, false),
                None => {
                    warn!(
                        cycle,
                        train_end = %train_span.last_date,
                        "No regime label at or before training end, using transition"
                    );
                    (Regime::default(), true)
                }
            };

            let train = panel.asset_matrix(window.train.clone(), &columns);
            let input =
                OptimizationInput::new(&assets, train.view(), &scores, regime, constraints)?;
            let mut allocation = self.optimizer.optimize(&input)?;
            if regime_defaulted {
                allocation.diagnostics.flag(CycleFlag::MissingRegimeLabel);
            }

            enter(&mut phase, CyclePhase::Testing, cycle);
            let test = panel
                .slice_rows(window.test.clone())
                .select(Axis(1), &columns);
            let weights = Array1::from(allocation.weights.weights().to_vec());
            let realized_returns = test.dot(&weights).to_vec();
            let performance =
                PerformanceSummary::from_returns(&realized_returns, self.config.periods_per_year);

            info!(
                cycle,
                regime = %regime,
                method = %allocation.diagnostics.method,
                status = %allocation.diagnostics.status,
                test_start = %test_span.first_date,
                test_end = %test_span.last_date,
                positions = allocation.diagnostics.nonzero_positions,
                total_return = performance.total_return,
                sharpe = performance.sharpe,
                max_drawdown = performance.max_drawdown,
                "Cycle complete"
            );

            cycles.push(CycleResult {
                cycle_index: cycle,
                train_span,
                test_span,
                regime,
                regime_defaulted,
                weights: allocation.weights,
                diagnostics: allocation.diagnostics,
                realized_returns,
                performance,
            });
            enter(&mut phase, CyclePhase::Recorded, cycle);
            enter(&mut phase, CyclePhase::AwaitingCycle, cycle);
        }

        enter(&mut phase, CyclePhase::Exhausted, cycles.len());
        info!(cycles = cycles.len(), "Walk-forward run finished");

        Ok(WalkForwardRun {
            cycles,
            excluded_assets,
        })
    }
}
