//! Hybrid Optimizer - ensemble blended with an externally trained policy
//!
//! The policy is a black box consulted once per cycle. Whenever it is absent
//! or its proposal is unusable, the ensemble allocation is returned as is.

use ndarray::{Array2, Axis, Slice};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::weights::{blend, cap_is_feasible, clip_and_normalize, enforce_cap, DEGENERATE_EPS};
use super::{
    Allocation, AllocationMethod, BlendTable, Diagnostics, EnsembleOptimizer, OptimizationInput,
    PortfolioOptimizer,
};
use crate::error::{AllocError, CycleFlag};
use crate::types::{Regime, WeightVector};

/// Answer of an external policy for one cycle
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyProposal {
    /// Raw weights in input asset order
    Proposal(Vec<f64>),
    Unavailable,
}

/// Already-trained weight predictor
#[cfg_attr(test, mockall::automock)]
pub trait ExternalPolicy {
    /// `recent_returns` is (assets x lookback)
    fn predict(
        &self,
        recent_returns: &Array2<f64>,
        regime: Regime,
        risk_scores: &[f64],
    ) -> PolicyProposal;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HybridParams {
    /// Trailing periods handed to the policy
    pub lookback: usize,
    /// Per-asset clip applied to the policy proposal
    pub policy_max_weight: f64,
    /// Share of the external proposal per regime
    pub external_share: BlendTable,
}

impl Default for HybridParams {
    fn default() -> Self {
        Self {
            lookback: 21,
            policy_max_weight: 0.20,
            external_share: BlendTable::HYBRID_EXTERNAL_SHARE,
        }
    }
}

impl HybridParams {
    pub fn validate(&self) -> Result<(), AllocError> {
        if self.lookback == 0 {
            return Err(AllocError::Config("hybrid lookback must be >= 1".into()));
        }
        if !(self.policy_max_weight > 0.0 && self.policy_max_weight <= 1.0) {
            return Err(AllocError::Config(format!(
                "policy_max_weight {} must lie in (0, 1]",
                self.policy_max_weight
            )));
        }
        self.external_share.validate("hybrid.external_share")
    }
}

/// Turn a raw proposal into a capped long-only vector, or `None` if unusable
fn sanitize_proposal(raw: &[f64], n_assets: usize, policy_cap: f64) -> Option<Vec<f64>> {
    if raw.len() != n_assets {
        warn!(
            expected = n_assets,
            got = raw.len(),
            "Policy proposal has wrong length"
        );
        return None;
    }
    if raw.iter().any(|w| !w.is_finite() || *w < 0.0) {
        warn!("Policy proposal has negative or non-finite weights");
        return None;
    }
    let total: f64 = raw.iter().sum();
    if total <= DEGENERATE_EPS {
        warn!(total, "Policy proposal sums to zero");
        return None;
    }

    let normalized: Vec<f64> = raw.iter().map(|w| w / total).collect();
    if cap_is_feasible(n_assets, policy_cap) {
        Some(enforce_cap(&normalized, policy_cap))
    } else {
        Some(normalized)
    }
}

pub struct HybridOptimizer {
    ensemble: EnsembleOptimizer,
    policy: Option<Box<dyn ExternalPolicy>>,
    params: HybridParams,
}

impl HybridOptimizer {
    /// Hybrid without a policy; every cycle takes the ensemble path
    pub fn new(ensemble: EnsembleOptimizer, params: HybridParams) -> Self {
        Self {
            ensemble,
            policy: None,
            params,
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn ExternalPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn has_policy(&self) -> bool {
        self.policy.is_some()
    }

    pub fn params(&self) -> &HybridParams {
        &self.params
    }

    fn proposal(&self, input: &OptimizationInput<'_>) -> Option<Vec<f64>> {
        let policy = self.policy.as_ref()?;

        let periods = input.n_periods();
        let start = periods.saturating_sub(self.params.lookback);
        let recent = input
            .returns
            .slice_axis(Axis(1), Slice::from(start..))
            .to_owned();

        match policy.predict(&recent, input.regime, input.risk_scores) {
            PolicyProposal::Proposal(raw) => {
                sanitize_proposal(&raw, input.n_assets(), self.params.policy_max_weight)
            }
            PolicyProposal::Unavailable => {
                debug!(regime = %input.regime, "External policy unavailable");
                None
            }
        }
    }
}

impl PortfolioOptimizer for HybridOptimizer {
    fn method(&self) -> AllocationMethod {
        AllocationMethod::HybridExternalEnsemble
    }

    fn optimize(&self, input: &OptimizationInput<'_>) -> Result<Allocation, AllocError> {
        let mut ensemble = self.ensemble.optimize(input)?;

        let external = match self.proposal(input) {
            Some(external) => external,
            None => {
                info!(regime = %input.regime, "Hybrid falling back to ensemble");
                ensemble
                    .diagnostics
                    .flag(CycleFlag::ExternalPolicyUnavailable);
                return Ok(ensemble);
            }
        };

        let cap = input.max_weight()?;
        let share = self.params.external_share.share(input.regime);
        info!(
            regime = %input.regime,
            external_share = share,
            ensemble_share = 1.0 - share,
            "Blending external policy with ensemble"
        );

        let blended = blend(&external, ensemble.weights.weights(), share);
        let normalized = clip_and_normalize(&blended);
        let mut flags = ensemble.diagnostics.flags.clone();
        if normalized.degenerate {
            flags.push(CycleFlag::DegenerateWeights);
        }
        let weights = if cap_is_feasible(input.n_assets(), cap) {
            enforce_cap(&normalized.weights, cap)
        } else {
            normalized.weights
        };

        let diagnostics = Diagnostics::evaluate(
            AllocationMethod::HybridExternalEnsemble,
            ensemble.diagnostics.status,
            input,
            &weights,
            self.ensemble.alpha(),
            flags,
        );

        Ok(Allocation {
            weights: WeightVector::new(input.assets.to_vec(), weights)?,
            diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::{CvarOptimizer, EnsembleParams};
    use crate::types::RegimeConstraints;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("H{}", i)).collect()
    }

    fn panel(n: usize, m: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, m), |(j, i)| {
            0.0003 * (j as f64 + 1.0) + ((i * (j + 4)) as f64 * 0.53).sin() * 0.011
        })
    }

    fn ensemble() -> EnsembleOptimizer {
        EnsembleOptimizer::new(CvarOptimizer::default(), EnsembleParams::default())
    }

    #[test]
    fn test_sanitize_rejects_malformed() {
        assert!(sanitize_proposal(&[0.5, 0.5], 3, 0.2).is_none());
        assert!(sanitize_proposal(&[0.5, -0.1, 0.6], 3, 0.5).is_none());
        assert!(sanitize_proposal(&[0.5, f64::NAN, 0.5], 3, 0.5).is_none());
        assert!(sanitize_proposal(&[0.0, 0.0, 0.0], 3, 0.5).is_none());
    }

    #[test]
    fn test_sanitize_normalises_and_clips() {
        let w = sanitize_proposal(&[4.0, 2.0, 2.0, 1.0, 1.0, 0.0], 6, 0.3).unwrap();
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(w.iter().all(|&x| x <= 0.3 + 1e-12));
    }

    #[test]
    fn test_absent_policy_equals_ensemble() {
        let assets = names(10);
        let r = panel(10, 150);
        let scores = vec![0.4; 10];
        let constraints = RegimeConstraints::from_caps(0.25, 0.2, 0.15);
        let input =
            OptimizationInput::new(&assets, r.view(), &scores, Regime::Transition, &constraints)
                .unwrap();

        let hybrid = HybridOptimizer::new(ensemble(), HybridParams::default());
        let alloc = hybrid.optimize(&input).unwrap();
        let reference = ensemble().optimize(&input).unwrap();

        assert_eq!(alloc.weights, reference.weights);
        assert_eq!(alloc.diagnostics.method, AllocationMethod::Ensemble);
        assert!(alloc
            .diagnostics
            .has_flag(CycleFlag::ExternalPolicyUnavailable));
    }

    #[test]
    fn test_unavailable_proposal_equals_ensemble() {
        let assets = names(10);
        let r = panel(10, 150);
        let scores = vec![0.4; 10];
        let constraints = RegimeConstraints::from_caps(0.25, 0.2, 0.15);
        let input =
            OptimizationInput::new(&assets, r.view(), &scores, Regime::Crisis, &constraints)
                .unwrap();

        let mut policy = MockExternalPolicy::new();
        policy
            .expect_predict()
            .times(1)
            .returning(|_, _, _| PolicyProposal::Unavailable);
        let hybrid =
            HybridOptimizer::new(ensemble(), HybridParams::default()).with_policy(Box::new(policy));

        let alloc = hybrid.optimize(&input).unwrap();
        let reference = ensemble().optimize(&input).unwrap();
        assert_eq!(alloc.weights.weights(), reference.weights.weights());
        assert_eq!(alloc.diagnostics.method, AllocationMethod::Ensemble);
    }

    #[test]
    fn test_policy_sees_recent_window_and_regime() {
        let assets = names(6);
        let r = panel(6, 90);
        let scores = vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6];
        let constraints = RegimeConstraints::from_caps(0.5, 0.4, 0.3);
        let input =
            OptimizationInput::new(&assets, r.view(), &scores, Regime::Expansion, &constraints)
                .unwrap();

        let mut policy = MockExternalPolicy::new();
        policy
            .expect_predict()
            .withf(|recent, regime, scores| {
                recent.dim() == (6, 21) && *regime == Regime::Expansion && scores.len() == 6
            })
            .times(1)
            .returning(|_, _, _| PolicyProposal::Proposal(vec![1.0; 6]));
        let hybrid =
            HybridOptimizer::new(ensemble(), HybridParams::default()).with_policy(Box::new(policy));

        let alloc = hybrid.optimize(&input).unwrap();
        assert_eq!(
            alloc.diagnostics.method,
            AllocationMethod::HybridExternalEnsemble
        );
        assert!(!alloc
            .diagnostics
            .has_flag(CycleFlag::ExternalPolicyUnavailable));
    }

    #[test]
    fn test_blend_shares_by_regime() {
        // Wide caps so neither the policy clip nor the regime cap binds
        let assets = names(4);
        let r = panel(4, 60);
        let scores = vec![0.2; 4];
        let constraints = RegimeConstraints::from_caps(1.0, 1.0, 1.0);
        let params = HybridParams {
            policy_max_weight: 1.0,
            ..HybridParams::default()
        };
        let proposal = vec![0.1, 0.2, 0.3, 0.4];

        for regime in Regime::ALL {
            let input =
                OptimizationInput::new(&assets, r.view(), &scores, regime, &constraints).unwrap();
            let reference = ensemble().optimize(&input).unwrap();

            let mut policy = MockExternalPolicy::new();
            let p = proposal.clone();
            policy
                .expect_predict()
                .returning(move |_, _, _| PolicyProposal::Proposal(p.clone()));
            let hybrid = HybridOptimizer::new(ensemble(), params).with_policy(Box::new(policy));
            let alloc = hybrid.optimize(&input).unwrap();

            let share = BlendTable::HYBRID_EXTERNAL_SHARE.share(regime);
            let expected = blend(&proposal, reference.weights.weights(), share);
            for (got, want) in alloc.weights.weights().iter().zip(expected) {
                assert!((got - want).abs() < 1e-9, "{} {} {}", regime, got, want);
            }
        }
    }

    #[test]
    fn test_hybrid_honours_regime_cap() {
        let assets = names(10);
        let r = panel(10, 150);
        let scores = vec![0.3; 10];
        let constraints = RegimeConstraints::from_caps(0.15, 0.12, 0.11);

        let mut policy = MockExternalPolicy::new();
        policy.expect_predict().returning(|_, _, _| {
            PolicyProposal::Proposal(vec![5.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
        });
        let hybrid =
            HybridOptimizer::new(ensemble(), HybridParams::default()).with_policy(Box::new(policy));

        let input =
            OptimizationInput::new(&assets, r.view(), &scores, Regime::Crisis, &constraints)
                .unwrap();
        let alloc = hybrid.optimize(&input).unwrap();
        assert!((alloc.weights.sum() - 1.0).abs() < 1e-9);
        assert!(alloc.weights.max_weight() <= 0.11 + 1e-9);
    }

    #[test]
    fn test_malformed_proposal_falls_back() {
        let assets = names(5);
        let r = panel(5, 40);
        let scores = vec![0.5; 5];
        let constraints = RegimeConstraints::from_caps(0.4, 0.4, 0.4);
        let input =
            OptimizationInput::new(&assets, r.view(), &scores, Regime::Transition, &constraints)
                .unwrap();

        let mut policy = MockExternalPolicy::new();
        policy
            .expect_predict()
            .returning(|_, _, _| PolicyProposal::Proposal(vec![0.5, 0.5]));
        let hybrid =
            HybridOptimizer::new(ensemble(), HybridParams::default()).with_policy(Box::new(policy));

        let alloc = hybrid.optimize(&input).unwrap();
        assert_eq!(alloc.diagnostics.method, AllocationMethod::Ensemble);
        assert!(alloc
            .diagnostics
            .has_flag(CycleFlag::ExternalPolicyUnavailable));
    }
}
