//! Configuration management for the allocator
//!
//! Loads from YAML/TOML files + environment variables via .env

mod types;

pub use types::*;

use anyhow::{Context, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use crate::backtesting::{PerformanceTargets, WalkForwardBacktester, WalkForwardConfig};
use crate::optimizer::{
    CvarOptimizer, EnsembleOptimizer, EnsembleParams, HybridOptimizer, HybridParams,
    PortfolioOptimizer,
};
use crate::types::Regime;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub optimizer: OptimizerConfig,
    pub regime_constraints: RegimeConstraintsConfig,
    pub ensemble: EnsembleParams,
    pub hybrid: HybridParams,
    pub backtest: WalkForwardConfig,
    pub performance: PerformanceTargets,
    pub data: DataConfig,
    pub log: LogConfig,
}

impl AppConfig {
    fn defaults() -> std::result::Result<ConfigBuilder<DefaultState>, ConfigError> {
        Config::builder()
            // Optimizer defaults
            .set_default("optimizer.method", "ensemble")?
            .set_default("optimizer.alpha", 0.95)?
            .set_default("optimizer.risk_penalty", 0.10)?
            .set_default("optimizer.max_iter", 200)?
            .set_default("optimizer.time_limit_secs", 10.0)?
            // Regime caps
            .set_default("regime_constraints.expansion", 0.12)?
            .set_default("regime_constraints.transition", 0.10)?
            .set_default("regime_constraints.crisis", 0.08)?
            // Ensemble defaults
            .set_default("ensemble.sharpe_max_weight", 0.15)?
            .set_default("ensemble.momentum_lookback", 126)?
            .set_default("ensemble.momentum_strength", 0.15)?
            .set_default("ensemble.momentum_z_clip", 2.0)?
            .set_default("ensemble.cvar_share.expansion", 0.40)?
            .set_default("ensemble.cvar_share.transition", 0.50)?
            .set_default("ensemble.cvar_share.crisis", 0.70)?
            // Hybrid defaults
            .set_default("hybrid.lookback", 21)?
            .set_default("hybrid.policy_max_weight", 0.20)?
            .set_default("hybrid.external_share.expansion", 0.60)?
            .set_default("hybrid.external_share.transition", 0.50)?
            .set_default("hybrid.external_share.crisis", 0.30)?
            // Walk-forward defaults
            .set_default("backtest.train_window", 756)?
            .set_default("backtest.test_window", 252)?
            .set_default("backtest.periods_per_year", 252.0)?
            // Performance targets
            .set_default("performance.target_sharpe", 1.0)?
            .set_default("performance.target_max_drawdown", -0.20)?
            // Data defaults
            .set_default("data.returns_path", "./data/returns.csv")?
            .set_default("data.risk_scores_path", "./data/risk_scores.csv")?
            .set_default("data.regimes_path", "./data/regimes.csv")?
            .set_default("data.output_dir", "./results")?
            // Logging defaults
            .set_default("log.level", "info")?
            .set_default("log.json", false)
    }

    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Self::defaults()
            .context("Failed to set configuration defaults")?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (CVARALLOC__SECTION__KEY)
            .add_source(Environment::with_prefix("CVARALLOC").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        app_config.validate()?;

        Ok(app_config)
    }

    /// Defaults overlaid with an inline YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = Self::defaults()
            .context("Failed to set configuration defaults")?
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        app_config.validate()?;

        Ok(app_config)
    }

    /// Range checks run before any backtest
    pub fn validate(&self) -> Result<()> {
        self.cvar_optimizer()
            .validate()
            .context("Invalid optimizer section")?;
        if self.optimizer.max_iter == 0 || !(self.optimizer.time_limit_secs > 0.0) {
            anyhow::bail!(
                "optimizer.max_iter and optimizer.time_limit_secs must be positive (got {} / {})",
                self.optimizer.max_iter,
                self.optimizer.time_limit_secs
            );
        }
        self.regime_constraints
            .to_constraints()
            .validate_for(Regime::ALL)
            .context("Invalid regime_constraints section")?;
        self.ensemble
            .validate()
            .context("Invalid ensemble section")?;
        self.hybrid.validate().context("Invalid hybrid section")?;
        self.backtest
            .validate()
            .context("Invalid backtest section")?;
        Ok(())
    }

    fn cvar_optimizer(&self) -> CvarOptimizer {
        CvarOptimizer::new(self.optimizer.alpha, self.optimizer.risk_penalty)
            .with_solver(self.optimizer.solver_settings())
    }

    /// The configured optimizer. The hybrid built here has no external
    /// policy attached and therefore always takes the ensemble path.
    pub fn build_optimizer(&self) -> Box<dyn PortfolioOptimizer> {
        let cvar = self.cvar_optimizer();
        match self.optimizer.method {
            OptimizerKind::Cvar => Box::new(cvar),
            OptimizerKind::Ensemble => Box::new(EnsembleOptimizer::new(cvar, self.ensemble)),
            OptimizerKind::Hybrid => Box::new(HybridOptimizer::new(
                EnsembleOptimizer::new(cvar, self.ensemble),
                self.hybrid,
            )),
        }
    }

    pub fn build_backtester(&self) -> WalkForwardBacktester {
        WalkForwardBacktester::new(self.build_optimizer(), self.backtest)
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "method={} alpha={:.2} penalty={:.2} caps={:.2}/{:.2}/{:.2} train={} test={}",
            self.optimizer.method,
            self.optimizer.alpha,
            self.optimizer.risk_penalty,
            self.regime_constraints.expansion,
            self.regime_constraints.transition,
            self.regime_constraints.crisis,
            self.backtest.train_window,
            self.backtest.test_window
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
