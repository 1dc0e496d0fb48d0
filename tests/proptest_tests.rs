//! Property-based tests using proptest for fuzzing and invariant testing.
//!
//! These tests verify that:
//! 1. Simplex projection always yields valid long-only weights
//! 2. Optimized allocations are fully invested and long-only
//! 3. Rebalancing plans respect the threshold, ordering and target
//! 4. Crash impacts are linear in the shock

use proptest::prelude::*;
use std::collections::BTreeMap;

use sena::config::{OptimizerSettings, RebalanceSettings};
use sena::optimizer::{project_to_simplex, MeanVarianceProblem, OptimizationEngine};
use sena::rebalance::{RebalancingPlanner, TradeAction};
use sena::scenario::CrashSimulator;
use sena::types::Allocation;

// ============================================================================
// Generators
// ============================================================================

fn symbols(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("S{}", i)).collect()
}

/// Allocation over `S0..Sn` from strictly positive raw values.
fn allocation_strategy(n: usize) -> impl Strategy<Value = Allocation> {
    prop::collection::vec(0.01..10.0f64, n).prop_map(move |values| {
        Allocation::from_values(symbols(n).into_iter().zip(values)).unwrap()
    })
}

/// Covariance `B·Bᵀ + δI` (positive definite) with expected returns above the
/// risk-free rate for at least one asset.
fn problem_strategy() -> impl Strategy<Value = MeanVarianceProblem> {
    (2usize..6).prop_flat_map(|n| {
        (
            prop::collection::vec(-0.3..0.3f64, n * n),
            prop::collection::vec(0.0..0.25f64, n),
            0.001..0.02f64,
        )
            .prop_map(move |(b, mut mu, delta)| {
                let cov: Vec<Vec<f64>> = (0..n)
                    .map(|i| {
                        (0..n)
                            .map(|j| {
                                let dot: f64 = (0..n).map(|k| b[i * n + k] * b[j * n + k]).sum();
                                if i == j {
                                    dot + delta
                                } else {
                                    dot
                                }
                            })
                            .collect()
                    })
                    .collect();
                mu[0] = mu[0].max(0.08);
                MeanVarianceProblem::new(symbols(n), mu, cov, 0.03, 1e-8).unwrap()
            })
    })
}

// ============================================================================
// Optimizer Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_simplex_projection_is_valid(v in prop::collection::vec(-50.0..50.0f64, 1..10)) {
        let w = project_to_simplex(&v);
        prop_assert_eq!(w.len(), v.len());
        prop_assert!(w.iter().all(|x| *x >= 0.0));
        prop_assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn prop_simplex_projection_is_idempotent(v in prop::collection::vec(-5.0..5.0f64, 1..8)) {
        let once = project_to_simplex(&v);
        let twice = project_to_simplex(&once);
        for (a, b) in once.iter().zip(&twice) {
            prop_assert!((a - b).abs() < 1e-9);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_optimized_weights_are_long_only_and_invested(problem in problem_strategy()) {
        let engine = OptimizationEngine::new(OptimizerSettings::default());
        let result = engine.optimize_problem(problem, 6).unwrap();

        for point in [&result.max_sharpe, &result.min_volatility] {
            prop_assert!((point.weights.total() - 1.0).abs() < 1e-6);
            for (_, w) in point.weights.iter() {
                prop_assert!((-1e-9..=1.0 + 1e-9).contains(&w));
            }
        }
        prop_assert!(result.min_volatility.volatility <= result.max_sharpe.volatility + 1e-4);
        for pair in result.frontier.windows(2) {
            prop_assert!(pair[0].volatility <= pair[1].volatility + 1e-12);
        }
    }
}

// ============================================================================
// Rebalancing Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_plan_respects_threshold_and_order(
        (current, target) in (2usize..7).prop_flat_map(|n| (allocation_strategy(n), allocation_strategy(n))),
        total in 1_000.0..1_000_000.0f64,
        min_trade in 0.0..5_000.0f64,
    ) {
        let trades = RebalancingPlanner::plan(&current, &target, total, min_trade).unwrap();

        for trade in &trades {
            prop_assert!(trade.amount.abs() >= min_trade);
            prop_assert_eq!(trade.action == TradeAction::Buy, trade.amount > 0.0);
            let reached = (trade.current_weight * total + trade.amount) / total;
            prop_assert!((reached - target.weight(&trade.symbol)).abs() < 1e-9);
        }
        for pair in trades.windows(2) {
            prop_assert!(pair[0].amount.abs() >= pair[1].amount.abs());
        }
    }

    #[test]
    fn prop_zero_threshold_plan_is_self_financing(
        (current, target) in (2usize..7).prop_flat_map(|n| (allocation_strategy(n), allocation_strategy(n))),
        total in 1_000.0..1_000_000.0f64,
    ) {
        let trades = RebalancingPlanner::plan(&current, &target, total, 0.0).unwrap();
        let net: f64 = trades.iter().map(|t| t.amount).sum();
        prop_assert!(net.abs() < 1e-6 * total);
    }

    #[test]
    fn prop_heuristic_targets_are_allocations(
        vols in prop::collection::vec(0.05..0.8f64, 1..8),
        sharpes in prop::collection::vec(-1.0..2.0f64, 8),
    ) {
        let planner = RebalancingPlanner::new(RebalanceSettings::default());
        let inputs: Vec<_> = vols
            .iter()
            .enumerate()
            .map(|(i, v)| sena::rebalance::ScoreInput::new(format!("S{}", i), Some(sharpes[i]), Some(*v)))
            .collect();

        let inverse = planner.inverse_volatility_targets(&inputs).unwrap();
        prop_assert!((inverse.total() - 1.0).abs() < 1e-9);
        let scored = planner.sharpe_score_targets(&inputs).unwrap();
        prop_assert!((scored.total() - 1.0).abs() < 1e-9);
    }
}

// ============================================================================
// Crash Scenario Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_crash_impact_is_linear(
        allocation in (1usize..6).prop_flat_map(allocation_strategy),
        raw_betas in prop::collection::vec(0.0..2.5f64, 6),
        shock in -60.0..-1.0f64,
        scale in 0.1..3.0f64,
    ) {
        let betas: BTreeMap<String, f64> = allocation
            .symbols()
            .zip(&raw_betas)
            .map(|(s, b)| (s.to_string(), *b))
            .collect();
        let simulator = CrashSimulator::default();

        let base = simulator.simulate(&allocation, &betas, shock).unwrap();
        let scaled = simulator.simulate(&allocation, &betas, shock * scale).unwrap();

        prop_assert!((scaled.portfolio_impact_pct - scale * base.portfolio_impact_pct).abs() < 1e-9);
        prop_assert!((base.portfolio_impact_pct - base.portfolio_beta * shock).abs() < 1e-9);
        prop_assert!(base.pessimistic_impact_pct <= base.portfolio_impact_pct);
    }
}
