//! Core types used throughout the allocator
//!
//! Defines the returns panel, regime labels, risk scores, constraints and
//! weight vectors that flow between the optimizers and the backtester.

use chrono::NaiveDate;
use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::ops::Range;

use crate::error::AllocError;

/// Discrete macro regime attached to a date
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Expansion,
    #[default]
    Transition,
    Crisis,
}

impl Regime {
    pub const ALL: [Regime; 3] = [Regime::Expansion, Regime::Transition, Regime::Crisis];

    /// Parse the numeric id produced by the regime classifier
    pub fn from_id(id: i64) -> Result<Self, AllocError> {
        match id {
            0 => Ok(Regime::Expansion),
            1 => Ok(Regime::Transition),
            2 => Ok(Regime::Crisis),
            other => Err(AllocError::UnknownRegime(other)),
        }
    }

    pub fn id(&self) -> u8 {
        match self {
            Regime::Expansion => 0,
            Regime::Transition => 1,
            Regime::Crisis => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Regime::Expansion => "expansion",
            Regime::Transition => "transition",
            Regime::Crisis => "crisis",
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Regime label valid from `date` until the next label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegimeLabel {
    pub date: NaiveDate,
    pub regime: Regime,
}

/// Piecewise-constant regime history, sorted by date
#[derive(Debug, Clone, Default)]
pub struct RegimeSeries {
    labels: Vec<RegimeLabel>,
}

impl RegimeSeries {
    pub fn new(mut labels: Vec<RegimeLabel>) -> Self {
        // Stable sort keeps the supplied order among equal dates, so the
        // dedup below retains the last label given for a date.
        labels.sort_by_key(|l| l.date);
        let mut deduped: Vec<RegimeLabel> = Vec::with_capacity(labels.len());
        for label in labels {
            match deduped.last_mut() {
                Some(last) if last.date == label.date => *last = label,
                _ => deduped.push(label),
            }
        }
        Self { labels: deduped }
    }

    /// Most recent label dated at or before `date`
    pub fn regime_at(&self, date: NaiveDate) -> Option<Regime> {
        let idx = self.labels.partition_point(|l| l.date <= date);
        if idx == 0 {
            None
        } else {
            Some(self.labels[idx - 1].regime)
        }
    }

    /// Distinct regimes present anywhere in the series
    pub fn regimes_seen(&self) -> HashSet<Regime> {
        self.labels.iter().map(|l| l.regime).collect()
    }

    pub fn labels(&self) -> &[RegimeLabel] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Dense period-return table: rows are time periods, columns are assets
#[derive(Debug, Clone)]
pub struct ReturnsPanel {
    dates: Vec<NaiveDate>,
    assets: Vec<String>,
    values: Array2<f64>,
}

impl ReturnsPanel {
    pub fn new(
        dates: Vec<NaiveDate>,
        assets: Vec<String>,
        values: Array2<f64>,
    ) -> Result<Self, AllocError> {
        if values.nrows() != dates.len() || values.ncols() != assets.len() {
            return Err(AllocError::InvalidPanel(format!(
                "shape {:?} does not match {} dates x {} assets",
                values.dim(),
                dates.len(),
                assets.len()
            )));
        }
        if assets.is_empty() {
            return Err(AllocError::InvalidPanel("no assets".to_string()));
        }
        if let Some(w) = dates.windows(2).find(|w| w[1] <= w[0]) {
            return Err(AllocError::InvalidPanel(format!(
                "dates not strictly increasing at {} -> {}",
                w[0], w[1]
            )));
        }
        let mut seen = HashSet::new();
        for asset in &assets {
            if asset.is_empty() {
                return Err(AllocError::InvalidPanel("empty asset id".to_string()));
            }
            if !seen.insert(asset.as_str()) {
                return Err(AllocError::InvalidPanel(format!("duplicate asset {}", asset)));
            }
        }
        if let Some(((row, col), v)) = values.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(AllocError::InvalidPanel(format!(
                "non-finite return {} at {} / {}",
                v, dates[row], assets[col]
            )));
        }

        Ok(Self {
            dates,
            assets,
            values,
        })
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    /// Time-contiguous slice of rows (periods x assets)
    pub fn slice_rows(&self, rows: Range<usize>) -> ArrayView2<'_, f64> {
        self.values.slice(ndarray::s![rows, ..])
    }

    /// Transposed training matrix (assets x periods) restricted to `columns`
    pub fn asset_matrix(&self, rows: Range<usize>, columns: &[usize]) -> Array2<f64> {
        self.slice_rows(rows).select(Axis(1), columns).reversed_axes()
    }
}

/// Per-asset risk scores in [0, 1], higher is riskier
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "HashMap<String, f64>", into = "HashMap<String, f64>")]
pub struct RiskScoreVector {
    scores: HashMap<String, f64>,
}

impl TryFrom<HashMap<String, f64>> for RiskScoreVector {
    type Error = AllocError;

    fn try_from(scores: HashMap<String, f64>) -> Result<Self, Self::Error> {
        Self::new(scores)
    }
}

impl From<RiskScoreVector> for HashMap<String, f64> {
    fn from(vector: RiskScoreVector) -> Self {
        vector.scores
    }
}

impl RiskScoreVector {
    pub fn new(scores: HashMap<String, f64>) -> Result<Self, AllocError> {
        for (asset, &score) in &scores {
            if !score.is_finite() || !(0.0..=1.0).contains(&score) {
                return Err(AllocError::InvalidRiskScore {
                    asset: asset.clone(),
                    score,
                });
            }
        }
        Ok(Self { scores })
    }

    pub fn get(&self, asset: &str) -> Option<f64> {
        self.scores.get(asset).copied()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Scores in the order of `assets`; errors with the uncovered assets
    pub fn aligned(&self, assets: &[String]) -> Result<Vec<f64>, AllocError> {
        let missing: Vec<String> = assets
            .iter()
            .filter(|a| !self.scores.contains_key(a.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(AllocError::MissingRiskScores(missing));
        }
        Ok(assets.iter().map(|a| self.scores[a.as_str()]).collect())
    }
}

/// Position limit for one regime
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeLimit {
    pub max_weight: f64,
}

/// Regime -> position limit, fixed for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegimeConstraints {
    limits: BTreeMap<Regime, RegimeLimit>,
}

impl RegimeConstraints {
    pub fn new(limits: BTreeMap<Regime, RegimeLimit>) -> Self {
        Self { limits }
    }

    pub fn from_caps(expansion: f64, transition: f64, crisis: f64) -> Self {
        let mut limits = BTreeMap::new();
        limits.insert(Regime::Expansion, RegimeLimit { max_weight: expansion });
        limits.insert(Regime::Transition, RegimeLimit { max_weight: transition });
        limits.insert(Regime::Crisis, RegimeLimit { max_weight: crisis });
        Self { limits }
    }

    pub fn max_weight(&self, regime: Regime) -> Result<f64, AllocError> {
        self.limits
            .get(&regime)
            .map(|l| l.max_weight)
            .ok_or(AllocError::MissingRegimeConstraint(regime))
    }

    /// Check that every regime in `regimes` has a usable limit
    pub fn validate_for<I>(&self, regimes: I) -> Result<(), AllocError>
    where
        I: IntoIterator<Item = Regime>,
    {
        for regime in regimes {
            let max_weight = self.max_weight(regime)?;
            if !max_weight.is_finite() || max_weight <= 0.0 || max_weight > 1.0 {
                return Err(AllocError::InvalidConstraint { regime, max_weight });
            }
        }
        Ok(())
    }
}

/// Long-only portfolio weights, one per asset, summing to 1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightVector {
    assets: Vec<String>,
    weights: Vec<f64>,
}

impl WeightVector {
    /// Weights below this count as an empty position
    pub const POSITION_THRESHOLD: f64 = 1e-3;

    pub fn new(assets: Vec<String>, weights: Vec<f64>) -> Result<Self, AllocError> {
        if assets.len() != weights.len() {
            return Err(AllocError::DimensionMismatch {
                what: "weights",
                expected: assets.len(),
                got: weights.len(),
            });
        }
        Ok(Self { assets, weights })
    }

    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn get(&self, asset: &str) -> Option<f64> {
        self.assets
            .iter()
            .position(|a| a == asset)
            .map(|i| self.weights[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.assets
            .iter()
            .map(String::as_str)
            .zip(self.weights.iter().copied())
    }

    pub fn sum(&self) -> f64 {
        self.weights.iter().sum()
    }

    pub fn max_weight(&self) -> f64 {
        self.weights.iter().copied().fold(0.0, f64::max)
    }

    pub fn nonzero_count(&self) -> usize {
        self.weights
            .iter()
            .filter(|&&w| w > Self::POSITION_THRESHOLD)
            .count()
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}
