//! End-to-end tests for the allocation engine

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate};
    use cvar_allocator::backtesting::{
        PerformanceTargets, WalkForwardBacktester, WalkForwardConfig, WalkForwardRun,
    };
    use cvar_allocator::optimizer::{
        AllocationMethod, CvarOptimizer, EnsembleOptimizer, EnsembleParams, ExternalPolicy,
        HybridOptimizer, HybridParams, OptimizationInput, PolicyProposal, PortfolioOptimizer,
    };
    use cvar_allocator::persistence::{self, CycleRecord, ResultWriter};
    use cvar_allocator::risk;
    use cvar_allocator::types::{
        Regime, RegimeConstraints, RegimeLabel, RegimeLimit, RegimeSeries, ReturnsPanel,
        RiskScoreVector,
    };
    use cvar_allocator::{AllocError, CycleFlag};
    use ndarray::{Array2, Axis};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};
    use std::collections::{BTreeMap, HashMap};

    // ============================================================================
    // Fixtures
    // ============================================================================

    fn dates(n: usize) -> Vec<NaiveDate> {
        let start = NaiveDate::from_ymd_opt(2015, 1, 1).unwrap();
        (0..n).map(|i| start + Duration::days(i as i64)).collect()
    }

    /// Gaussian returns, one (name, mean, sd) per asset
    fn synthetic_panel(seed: u64, periods: usize, specs: &[(&str, f64, f64)]) -> ReturnsPanel {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut values = Array2::<f64>::zeros((periods, specs.len()));
        for (j, (_, mean, sd)) in specs.iter().enumerate() {
            let dist = Normal::new(*mean, *sd).unwrap();
            for i in 0..periods {
                values[[i, j]] = dist.sample(&mut rng);
            }
        }
        let assets = specs.iter().map(|(name, _, _)| name.to_string()).collect();
        ReturnsPanel::new(dates(periods), assets, values).unwrap()
    }

    fn universe(n: usize) -> Vec<(String, f64, f64)> {
        (0..n)
            .map(|j| {
                (
                    format!("T{:02}", j),
                    0.0002 + 0.0001 * j as f64,
                    0.008 + 0.002 * j as f64,
                )
            })
            .collect()
    }

    fn panel_for(seed: u64, periods: usize, n: usize) -> ReturnsPanel {
        let specs = universe(n);
        let borrowed: Vec<(&str, f64, f64)> = specs
            .iter()
            .map(|(name, m, s)| (name.as_str(), *m, *s))
            .collect();
        synthetic_panel(seed, periods, &borrowed)
    }

    fn flat_scores(panel: &ReturnsPanel, score: f64) -> RiskScoreVector {
        RiskScoreVector::new(
            panel
                .assets()
                .iter()
                .map(|a| (a.clone(), score))
                .collect::<HashMap<_, _>>(),
        )
        .unwrap()
    }

    fn walk_forward(
        optimizer: Box<dyn PortfolioOptimizer>,
        train: usize,
        test: usize,
    ) -> WalkForwardBacktester {
        WalkForwardBacktester::new(
            optimizer,
            WalkForwardConfig {
                train_window: train,
                test_window: test,
                periods_per_year: 252.0,
            },
        )
    }

    /// Policy that never has an answer
    struct OfflinePolicy;

    impl ExternalPolicy for OfflinePolicy {
        fn predict(&self, _: &Array2<f64>, _: Regime, _: &[f64]) -> PolicyProposal {
            PolicyProposal::Unavailable
        }
    }

    // ============================================================================
    // Optimizer properties
    // ============================================================================

    #[test]
    fn test_cvar_prefers_low_risk_high_mean_asset() {
        let panel = synthetic_panel(
            7,
            300,
            &[("A", 0.0010, 0.005), ("B", 0.0003, 0.015), ("C", 0.0000, 0.020)],
        );
        let scores = RiskScoreVector::new(HashMap::from([
            ("A".to_string(), 0.1),
            ("B".to_string(), 0.5),
            ("C".to_string(), 0.9),
        ]))
        .unwrap();
        let assets = panel.assets().to_vec();
        let aligned = scores.aligned(&assets).unwrap();
        let constraints = RegimeConstraints::from_caps(0.6, 0.4, 0.4);
        let train = panel.asset_matrix(0..300, &[0, 1, 2]);

        let input =
            OptimizationInput::new(&assets, train.view(), &aligned, Regime::Expansion, &constraints)
                .unwrap();
        let alloc = CvarOptimizer::default().optimize(&input).unwrap();

        let a = alloc.weights.get("A").unwrap();
        let c = alloc.weights.get("C").unwrap();
        assert!(a > c, "A={} C={}", a, c);
        assert!(a <= 0.6 + 1e-6);
        assert!((alloc.weights.sum() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cvar_alpha_monotonicity() {
        let panel = panel_for(11, 500, 5);
        let matrix = panel.asset_matrix(0..500, &[0, 1, 2, 3, 4]);
        let weights = [0.3, 0.25, 0.2, 0.15, 0.1];

        let cvar_95 = risk::portfolio_cvar(matrix.view(), &weights, 0.95);
        let cvar_99 = risk::portfolio_cvar(matrix.view(), &weights, 0.99);
        assert!(cvar_99 <= cvar_95, "cvar99={} cvar95={}", cvar_99, cvar_95);
        assert!(cvar_95 < 0.0);
    }

    #[test]
    fn test_cvar_optimizer_is_idempotent() {
        let panel = panel_for(3, 200, 8);
        let assets = panel.assets().to_vec();
        let scores = vec![0.3; 8];
        let columns: Vec<usize> = (0..8).collect();
        let train = panel.asset_matrix(0..200, &columns);
        let constraints = RegimeConstraints::from_caps(0.3, 0.25, 0.2);
        let input =
            OptimizationInput::new(&assets, train.view(), &scores, Regime::Crisis, &constraints)
                .unwrap();

        let optimizer = CvarOptimizer::new(0.95, 0.1);
        let first = optimizer.optimize(&input).unwrap();
        let second = optimizer.optimize(&input).unwrap();
        assert_eq!(first.weights.weights(), second.weights.weights());
        assert_eq!(first.diagnostics, second.diagnostics);
    }

    #[test]
    fn test_hybrid_with_offline_policy_matches_ensemble() {
        let panel = panel_for(5, 180, 10);
        let assets = panel.assets().to_vec();
        let scores: Vec<f64> = (0..10).map(|j| j as f64 / 10.0).collect();
        let columns: Vec<usize> = (0..10).collect();
        let train = panel.asset_matrix(0..180, &columns);
        let constraints = RegimeConstraints::from_caps(0.2, 0.15, 0.12);

        let ensemble = EnsembleOptimizer::new(CvarOptimizer::default(), EnsembleParams::default());
        let hybrid = HybridOptimizer::new(ensemble.clone(), HybridParams::default())
            .with_policy(Box::new(OfflinePolicy));

        for regime in Regime::ALL {
            let input =
                OptimizationInput::new(&assets, train.view(), &scores, regime, &constraints)
                    .unwrap();
            let expected = ensemble.optimize(&input).unwrap();
            let got = hybrid.optimize(&input).unwrap();
            assert_eq!(got.weights, expected.weights);
            assert_eq!(got.diagnostics.method, AllocationMethod::Ensemble);
            assert!(got
                .diagnostics
                .has_flag(CycleFlag::ExternalPolicyUnavailable));
        }
    }

    // ============================================================================
    // Walk-forward schedule
    // ============================================================================

    #[test]
    fn test_hundred_periods_yield_two_cycles() {
        let panel = panel_for(1, 100, 4);
        let scores = flat_scores(&panel, 0.2);
        let constraints = RegimeConstraints::from_caps(0.6, 0.6, 0.6);

        let run = walk_forward(Box::new(CvarOptimizer::default()), 60, 20)
            .run(&panel, &scores, &RegimeSeries::default(), &constraints)
            .unwrap();

        assert_eq!(run.cycles.len(), 2);
        assert_eq!(run.cycles[0].cycle_index, 0);
        assert_eq!(run.cycles[1].cycle_index, 1);
        assert_eq!(run.cycles[0].test_span.range(), 60..80);
        assert_eq!(run.cycles[1].test_span.range(), 80..100);
        assert_eq!(run.cycles[0].train_span.range(), 0..60);
        assert_eq!(run.cycles[1].realized_returns.len(), 20);
    }

    #[test]
    fn test_seventy_nine_periods_yield_no_cycle() {
        let panel = panel_for(1, 79, 4);
        let scores = flat_scores(&panel, 0.2);
        let constraints = RegimeConstraints::from_caps(0.6, 0.6, 0.6);

        let run = walk_forward(Box::new(CvarOptimizer::default()), 60, 20)
            .run(&panel, &scores, &RegimeSeries::default(), &constraints)
            .unwrap();
        assert!(run.cycles.is_empty());
        assert_eq!(run.summary(&PerformanceTargets::default()).n_cycles, 0);
    }

    #[test]
    fn test_test_windows_are_disjoint_and_increasing() {
        let panel = panel_for(2, 400, 5);
        let scores = flat_scores(&panel, 0.4);
        let constraints = RegimeConstraints::from_caps(0.5, 0.4, 0.3);

        let run = walk_forward(Box::new(CvarOptimizer::default()), 100, 45)
            .run(&panel, &scores, &RegimeSeries::default(), &constraints)
            .unwrap();

        assert_eq!(run.cycles.len(), 6);
        for pair in run.cycles.windows(2) {
            assert!(pair[0].test_span.end <= pair[1].test_span.start);
            assert!(pair[0].test_span.first_date < pair[1].test_span.first_date);
        }
        for cycle in &run.cycles {
            assert!(cycle.train_span.last_date < cycle.test_span.first_date);
            assert_eq!(cycle.test_span.len(), 45);
        }
    }

    // ============================================================================
    // Regime handling
    // ============================================================================

    #[test]
    fn test_future_labels_do_not_leak_into_earlier_cycles() {
        let panel = panel_for(9, 160, 5);
        let scores = flat_scores(&panel, 0.3);
        let constraints = RegimeConstraints::from_caps(0.5, 0.4, 0.3);
        let d = panel.dates();

        let base = vec![RegimeLabel {
            date: d[0],
            regime: Regime::Expansion,
        }];
        let mut perturbed = base.clone();
        // First test date of cycle 0, after its training end
        perturbed.push(RegimeLabel {
            date: d[60],
            regime: Regime::Crisis,
        });

        let backtester = walk_forward(Box::new(CvarOptimizer::default()), 60, 50);
        let clean = backtester
            .run(&panel, &scores, &RegimeSeries::new(base), &constraints)
            .unwrap();
        let shifted = backtester
            .run(&panel, &scores, &RegimeSeries::new(perturbed), &constraints)
            .unwrap();

        assert_eq!(clean.cycles.len(), 2);
        assert_eq!(clean.cycles[0].regime, Regime::Expansion);
        assert_eq!(shifted.cycles[0].regime, Regime::Expansion);
        assert_eq!(clean.cycles[0].weights, shifted.cycles[0].weights);

        assert_eq!(shifted.cycles[1].regime, Regime::Crisis);
        assert!(shifted.cycles[1].weights.max_weight() <= 0.3 + 1e-6);
    }

    #[test]
    fn test_label_on_last_training_date_is_used() {
        let panel = panel_for(9, 100, 4);
        let scores = flat_scores(&panel, 0.3);
        let constraints = RegimeConstraints::from_caps(0.6, 0.5, 0.4);
        let labels = RegimeSeries::new(vec![RegimeLabel {
            date: panel.dates()[59],
            regime: Regime::Crisis,
        }]);

        let run = walk_forward(Box::new(CvarOptimizer::default()), 60, 20)
            .run(&panel, &scores, &labels, &constraints)
            .unwrap();
        assert_eq!(run.cycles[0].regime, Regime::Crisis);
        assert!(!run.cycles[0].regime_defaulted);
    }

    #[test]
    fn test_missing_or_post_dated_labels_default_to_transition() {
        let panel = panel_for(4, 100, 4);
        let scores = flat_scores(&panel, 0.3);
        let constraints = RegimeConstraints::from_caps(0.6, 0.5, 0.4);
        let post_dated = RegimeSeries::new(vec![RegimeLabel {
            date: panel.dates()[99] + Duration::days(30),
            regime: Regime::Expansion,
        }]);

        for labels in [RegimeSeries::default(), post_dated] {
            let run = walk_forward(Box::new(CvarOptimizer::default()), 60, 20)
                .run(&panel, &scores, &labels, &constraints)
                .unwrap();
            assert_eq!(run.cycles.len(), 2);
            for cycle in &run.cycles {
                assert_eq!(cycle.regime, Regime::Transition);
                assert!(cycle.regime_defaulted);
                assert!(cycle.diagnostics.has_flag(CycleFlag::MissingRegimeLabel));
            }
        }
    }

    #[test]
    fn test_missing_constraint_is_a_configuration_error() {
        let panel = panel_for(4, 100, 4);
        let scores = flat_scores(&panel, 0.3);
        let labels = RegimeSeries::new(vec![RegimeLabel {
            date: panel.dates()[10],
            regime: Regime::Crisis,
        }]);
        let mut limits = BTreeMap::new();
        limits.insert(Regime::Expansion, RegimeLimit { max_weight: 0.6 });
        limits.insert(Regime::Transition, RegimeLimit { max_weight: 0.5 });

        let result = walk_forward(Box::new(CvarOptimizer::default()), 60, 20).run(
            &panel,
            &scores,
            &labels,
            &RegimeConstraints::new(limits),
        );
        assert!(matches!(
            result,
            Err(AllocError::MissingRegimeConstraint(Regime::Crisis))
        ));
    }

    // ============================================================================
    // Ensemble runs
    // ============================================================================

    fn ensemble_run(panel: &ReturnsPanel, labels: &RegimeSeries) -> WalkForwardRun {
        let scores = flat_scores(panel, 0.25);
        let constraints = RegimeConstraints::from_caps(0.2, 0.15, 0.12);
        let optimizer =
            EnsembleOptimizer::new(CvarOptimizer::default(), EnsembleParams::default());
        walk_forward(Box::new(optimizer), 150, 50)
            .run(panel, &scores, labels, &constraints)
            .unwrap()
    }

    #[test]
    fn test_ensemble_weights_honour_active_cap() {
        let panel = panel_for(21, 400, 10);
        let d = panel.dates();
        let labels = RegimeSeries::new(vec![
            RegimeLabel {
                date: d[0],
                regime: Regime::Expansion,
            },
            RegimeLabel {
                date: d[180],
                regime: Regime::Crisis,
            },
            RegimeLabel {
                date: d[260],
                regime: Regime::Transition,
            },
        ]);

        let run = ensemble_run(&panel, &labels);
        assert_eq!(run.cycles.len(), 5);
        let caps = RegimeConstraints::from_caps(0.2, 0.15, 0.12);
        for cycle in &run.cycles {
            let cap = caps.max_weight(cycle.regime).unwrap();
            assert!((cycle.weights.sum() - 1.0).abs() < 1e-6);
            assert!(cycle.weights.weights().iter().all(|&w| w >= 0.0));
            assert!(cycle.weights.max_weight() <= cap + 1e-6);
            assert_eq!(cycle.diagnostics.method, AllocationMethod::Ensemble);
            assert!(cycle.performance.max_drawdown <= 0.0);
        }
        let regimes: Vec<Regime> = run.cycles.iter().map(|c| c.regime).collect();
        assert!(regimes.contains(&Regime::Crisis));
    }

    #[test]
    fn test_realized_returns_are_fixed_weight_dot_products() {
        let panel = panel_for(8, 250, 10);
        let run = ensemble_run(&panel, &RegimeSeries::default());
        let cycle = &run.cycles[0];
        let test = panel.slice_rows(cycle.test_span.range());
        for (k, row) in test.axis_iter(Axis(0)).enumerate() {
            let expected: f64 = row
                .iter()
                .zip(cycle.weights.weights())
                .map(|(r, w)| r * w)
                .sum();
            assert!((cycle.realized_returns[k] - expected).abs() < 1e-12);
        }
    }

    // ============================================================================
    // Persistence
    // ============================================================================

    #[test]
    fn test_cycle_results_survive_csv_round_trip() {
        let panel = panel_for(13, 300, 6);
        let scores = flat_scores(&panel, 0.5);
        let constraints = RegimeConstraints::from_caps(0.4, 0.3, 0.25);
        let run = walk_forward(Box::new(CvarOptimizer::default()), 100, 50)
            .run(&panel, &scores, &RegimeSeries::default(), &constraints)
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let writer = ResultWriter::with_stamp(dir.path(), "roundtrip").unwrap();
        let cycles_path = writer.write_cycles(&run.cycles).unwrap();
        let weights_path = writer.write_weights(&run.cycles).unwrap();

        let loaded = persistence::load_cycle_records(&cycles_path).unwrap();
        let expected: Vec<CycleRecord> = run.cycles.iter().map(CycleRecord::from).collect();
        assert_eq!(loaded, expected);
        assert!(loaded[0].flags.contains("MISSING_REGIME_LABEL"));
        assert_eq!(loaded[0].regime, Regime::Transition);

        let weight_rows = std::fs::read_to_string(weights_path).unwrap();
        assert_eq!(weight_rows.lines().count(), 1 + run.cycles.len() * 6);
        assert!(weight_rows.starts_with("cycle,asset,weight"));
    }

    #[test]
    fn test_csv_inputs_drive_a_full_run() {
        let dir = tempfile::tempdir().unwrap();
        let panel = panel_for(17, 120, 3);

        let mut returns = String::from("date,T00,T01,T02\n");
        let values = panel.values();
        for (i, date) in panel.dates().iter().enumerate() {
            let row = values.row(i);
            returns.push_str(&format!("{},{},{},{}\n", date, row[0], row[1], row[2]));
        }
        let returns_path = dir.path().join("returns.csv");
        std::fs::write(&returns_path, returns).unwrap();

        // T02 has no score and must be dropped
        let scores_path = dir.path().join("scores.csv");
        std::fs::write(&scores_path, "ticker,risk_score\nT00,0.2\nT01,0.6\n").unwrap();
        let regimes_path = dir.path().join("regimes.csv");
        std::fs::write(&regimes_path, "date,regime\n2015-01-01,0\n").unwrap();

        let loaded = persistence::load_returns(&returns_path).unwrap();
        assert_eq!(loaded.values(), panel.values());
        let scores = persistence::load_risk_scores(&scores_path).unwrap();
        let regimes = persistence::load_regimes(&regimes_path).unwrap();

        let run = walk_forward(Box::new(CvarOptimizer::default()), 60, 30)
            .run(
                &loaded,
                &scores,
                &regimes,
                &RegimeConstraints::from_caps(0.8, 0.7, 0.6),
            )
            .unwrap();
        assert_eq!(run.excluded_assets, vec!["T02".to_string()]);
        assert_eq!(run.cycles.len(), 2);
        assert!(run.cycles.iter().all(|c| c.regime == Regime::Expansion));
        assert!(run.cycles.iter().all(|c| c.weights.len() == 2));
    }
}
