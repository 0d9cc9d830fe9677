//! CSV Persistence Module
//!
//! Loads the run inputs (returns panel, risk scores, regime labels) and
//! stores the per-cycle results of a walk-forward run.

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::backtesting::{CycleResult, WalkForwardReport};
use crate::types::{Regime, RegimeLabel, RegimeSeries, ReturnsPanel, RiskScoreVector};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Accepts `YYYY-MM-DD`, optionally followed by a time component
fn parse_date(raw: &str) -> Result<NaiveDate> {
    let trimmed = raw.trim();
    let day = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(day, DATE_FORMAT)
        .with_context(|| format!("Invalid date '{}'", raw))
}

/// Load a wide returns table: `date,<asset>,<asset>,...`
pub fn load_returns(path: &Path) -> Result<ReturnsPanel> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open returns file {}", path.display()))?;
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);

    let headers = reader
        .headers()
        .context("Failed to read returns header")?
        .clone();
    if headers.len() < 2 {
        bail!("Returns file {} has no asset columns", path.display());
    }
    let assets: Vec<String> = headers.iter().skip(1).map(|h| h.trim().to_string()).collect();

    let mut dates = Vec::new();
    let mut values = Vec::new();
    for (line, result) in reader.records().enumerate() {
        let record = result.context("Failed to read returns row")?;
        if record.len() != headers.len() {
            bail!(
                "Returns row {} has {} fields, expected {}",
                line + 1,
                record.len(),
                headers.len()
            );
        }
        dates.push(parse_date(&record[0])?);
        for (col, cell) in record.iter().skip(1).enumerate() {
            let value: f64 = cell.trim().parse().with_context(|| {
                format!("Invalid return '{}' for {} in row {}", cell, assets[col], line + 1)
            })?;
            values.push(value);
        }
    }

    let values = Array2::from_shape_vec((dates.len(), assets.len()), values)
        .context("Returns table is not rectangular")?;
    let panel = ReturnsPanel::new(dates, assets, values)
        .with_context(|| format!("Invalid returns panel in {}", path.display()))?;

    info!(
        periods = panel.len(),
        assets = panel.assets().len(),
        path = %path.display(),
        "Loaded returns panel"
    );
    Ok(panel)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RiskScoreRow {
    ticker: String,
    risk_score: f64,
}

/// Load `ticker,risk_score` rows; a repeated ticker keeps its last score
pub fn load_risk_scores(path: &Path) -> Result<RiskScoreVector> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open risk score file {}", path.display()))?;
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);

    let mut scores = HashMap::new();
    for result in reader.deserialize() {
        let row: RiskScoreRow = result.context("Failed to deserialize risk score row")?;
        if scores.insert(row.ticker.clone(), row.risk_score).is_some() {
            warn!(ticker = %row.ticker, "Duplicate risk score, keeping the last one");
        }
    }

    let scores = RiskScoreVector::new(scores).context("Invalid risk scores")?;
    info!(assets = scores.len(), path = %path.display(), "Loaded risk scores");
    Ok(scores)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegimeRow {
    date: String,
    regime: i64,
}

/// Load `date,regime` rows with integer regime ids (0, 1, 2)
pub fn load_regimes(path: &Path) -> Result<RegimeSeries> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open regime file {}", path.display()))?;
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);

    let mut labels = Vec::new();
    for result in reader.deserialize() {
        let row: RegimeRow = result.context("Failed to deserialize regime row")?;
        labels.push(RegimeLabel {
            date: parse_date(&row.date)?,
            regime: Regime::from_id(row.regime)
                .with_context(|| format!("Bad regime on {}", row.date))?,
        });
    }

    let series = RegimeSeries::new(labels);
    info!(labels = series.len(), path = %path.display(), "Loaded regime labels");
    Ok(series)
}

/// One row per walk-forward cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle: usize,
    pub train_start: NaiveDate,
    pub train_end: NaiveDate,
    pub test_start: NaiveDate,
    pub test_end: NaiveDate,
    pub regime: Regime,
    pub regime_defaulted: bool,
    pub method: String,
    pub status: String,
    /// `|`-separated flag names, empty when clean
    pub flags: String,
    pub nonzero_positions: usize,
    pub train_cvar: f64,
    pub train_sharpe: f64,
    pub total_return: f64,
    pub annual_return: f64,
    pub annual_volatility: f64,
    pub sharpe: f64,
    pub max_drawdown: f64,
    pub cvar_95: f64,
}

impl From<&CycleResult> for CycleRecord {
    fn from(cycle: &CycleResult) -> Self {
        let flags: Vec<String> = cycle
            .diagnostics
            .flags
            .iter()
            .map(|f| f.to_string())
            .collect();
        Self {
            cycle: cycle.cycle_index,
            train_start: cycle.train_span.first_date,
            train_end: cycle.train_span.last_date,
            test_start: cycle.test_span.first_date,
            test_end: cycle.test_span.last_date,
            regime: cycle.regime,
            regime_defaulted: cycle.regime_defaulted,
            method: cycle.diagnostics.method.to_string(),
            status: cycle.diagnostics.status.to_string(),
            flags: flags.join("|"),
            nonzero_positions: cycle.diagnostics.nonzero_positions,
            train_cvar: cycle.diagnostics.cvar_estimate,
            train_sharpe: cycle.diagnostics.train_sharpe,
            total_return: cycle.performance.total_return,
            annual_return: cycle.performance.annual_return,
            annual_volatility: cycle.performance.annual_volatility,
            sharpe: cycle.performance.sharpe,
            max_drawdown: cycle.performance.max_drawdown,
            cvar_95: cycle.performance.cvar_95,
        }
    }
}

/// Long-format weight row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightRecord {
    pub cycle: usize,
    pub asset: String,
    pub weight: f64,
}

/// Writes run outputs into one directory, tagging every file name with the
/// same timestamp
pub struct ResultWriter {
    output_dir: PathBuf,
    stamp: String,
}

impl ResultWriter {
    pub fn new(output_dir: &Path) -> Result<Self> {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        Self::with_stamp(output_dir, &stamp)
    }

    pub fn with_stamp(output_dir: &Path, stamp: &str) -> Result<Self> {
        fs::create_dir_all(output_dir).with_context(|| {
            format!("Failed to create output directory {}", output_dir.display())
        })?;
        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            stamp: stamp.to_string(),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn create_writer(&self, prefix: &str) -> Result<(csv::Writer<File>, PathBuf)> {
        let path = self
            .output_dir
            .join(format!("{}_{}.csv", prefix, self.stamp));
        let file = File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let writer = WriterBuilder::new().has_headers(true).from_writer(file);
        Ok((writer, path))
    }

    /// `cycles_<stamp>.csv`
    pub fn write_cycles(&self, cycles: &[CycleResult]) -> Result<PathBuf> {
        let (mut writer, path) = self.create_writer("cycles")?;
        for cycle in cycles {
            writer
                .serialize(CycleRecord::from(cycle))
                .context("Failed to write cycle record")?;
        }
        writer.flush().context("Failed to flush cycle writer")?;
        info!(rows = cycles.len(), path = %path.display(), "Wrote cycle results");
        Ok(path)
    }

    /// `weights_<stamp>.csv`, one row per (cycle, asset)
    pub fn write_weights(&self, cycles: &[CycleResult]) -> Result<PathBuf> {
        let (mut writer, path) = self.create_writer("weights")?;
        let mut rows = 0;
        for cycle in cycles {
            for (asset, weight) in cycle.weights.iter() {
                writer
                    .serialize(WeightRecord {
                        cycle: cycle.cycle_index,
                        asset: asset.to_string(),
                        weight,
                    })
                    .context("Failed to write weight record")?;
                rows += 1;
            }
        }
        writer.flush().context("Failed to flush weight writer")?;
        info!(rows, path = %path.display(), "Wrote cycle weights");
        Ok(path)
    }

    /// `report_<stamp>.json`
    pub fn write_report(&self, report: &WalkForwardReport) -> Result<PathBuf> {
        let path = self
            .output_dir
            .join(format!("report_{}.json", self.stamp));
        let json = serde_json::to_string_pretty(report).context("Failed to encode report")?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

/// Read back a cycles file
pub fn load_cycle_records(path: &Path) -> Result<Vec<CycleRecord>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open cycle file {}", path.display()))?;
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);
    let mut records = Vec::new();
    for result in reader.deserialize() {
        records.push(result.context("Failed to deserialize cycle record")?);
    }
    Ok(records)
}
