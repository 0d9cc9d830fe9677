//! Walk-forward allocation runner
//!
//! Usage: cargo run --release (settings from config/default, config/local and CVARALLOC__*)

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cvar_allocator::config::{AppConfig, OptimizerKind};
use cvar_allocator::persistence::{self, ResultWriter};

fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if config.log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;
    init_logging(&config);
    info!(config = %config, "Configuration loaded");

    let panel = persistence::load_returns(&config.data.returns_path)?;
    let risk_scores = persistence::load_risk_scores(&config.data.risk_scores_path)?;
    let regimes = persistence::load_regimes(&config.data.regimes_path)?;

    if config.optimizer.method == OptimizerKind::Hybrid {
        warn!("No external policy configured, hybrid runs on the ensemble path");
    }

    let backtester = config.build_backtester();
    let run = backtester
        .run(
            &panel,
            &risk_scores,
            &regimes,
            &config.regime_constraints.to_constraints(),
        )
        .context("Walk-forward run failed")?;

    let report = run.summary(&config.performance);
    let writer = ResultWriter::new(&config.data.output_dir)?;
    let cycles_path = writer.write_cycles(&run.cycles)?;
    let weights_path = writer.write_weights(&run.cycles)?;
    let report_path = writer.write_report(&report)?;

    info!(
        cycles = report.n_cycles,
        flagged = report.flagged_cycles,
        excluded = run.excluded_assets.len(),
        avg_sharpe = report.avg_sharpe,
        avg_max_drawdown = report.avg_max_drawdown,
        targets_met = report.targets_met(),
        cycles_file = %cycles_path.display(),
        weights_file = %weights_path.display(),
        report_file = %report_path.display(),
        "Run complete"
    );
    report.print();

    Ok(())
}
