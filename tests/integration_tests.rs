//! End-to-end tests across the cache, stores, gateways and the portfolio engine.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use sena::cache::{CacheManager, FieldClass};
use sena::config::EngineConfig;
use sena::engine::{PortfolioEngine, RunOptions, TargetStrategy};
use sena::gateway::testing::{synthetic_history, ScriptedGateway};
use sena::gateway::{CsvGateway, GatewayError, MarketDataGateway, TimeoutGateway};
use sena::portfolio::Portfolio;
use sena::rebalance::{RebalancingPlanner, TradeAction};
use sena::scenario::CrashSimulator;
use sena::store::{PortfolioManager, SqliteStore};
use sena::types::{Allocation, Currency, PricePoint};
use tempfile::TempDir;

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.cache.retry_backoff_ms = 0;
    config.optimizer.frontier_points = 8;
    config
}

fn scripted_market() -> Arc<ScriptedGateway> {
    Arc::new(
        ScriptedGateway::new()
            .with_asset("AAPL", synthetic_history(300, 180.0, 0.0007, 0.018, 0.0))
            .with_asset("VOO", synthetic_history(300, 420.0, 0.0004, 0.009, 0.9))
            .with_asset("7203.T", synthetic_history(300, 2800.0, 0.0003, 0.014, 2.2))
            .with_asset("^GSPC", synthetic_history(300, 4500.0, 0.0004, 0.008, 0.8))
            .with_risk_free_rate(0.04)
            .with_exchange_rate(150.0),
    )
}

fn sample_portfolio() -> Portfolio {
    let mut p = Portfolio::new("core");
    p.add_holding("AAPL", 20.0).unwrap();
    p.add_holding("VOO", 10.0).unwrap();
    p.add_holding("7203.T", 200.0).unwrap();
    p
}

fn write_series(dir: &TempDir, symbol: &str, points: &[PricePoint]) {
    let mut file = std::fs::File::create(dir.path().join(format!("{}.csv", symbol))).unwrap();
    writeln!(file, "date,close").unwrap();
    for p in points {
        writeln!(file, "{},{}", p.date.format("%Y-%m-%d"), p.close).unwrap();
    }
}

#[test]
fn test_engine_run_values_in_both_currencies() {
    let config = test_config();
    let cache = Arc::new(CacheManager::in_memory(scripted_market(), &config));
    let engine = PortfolioEngine::new(cache, config);

    let report = engine.run(&sample_portfolio(), &RunOptions::default()).unwrap();
    assert!(report.is_complete(), "{:?}", report.failures);

    let valuation = report.valuation.as_ref().unwrap();
    let toyota = valuation.get("7203.T").unwrap();
    assert_eq!(toyota.currency, Currency::Jpy);
    assert!((toyota.value_usd * 150.0 - toyota.value_jpy).abs() < 1e-6);
    assert!((valuation.total_usd * 150.0 - valuation.total_jpy).abs() < 1e-4);

    let ratios: f64 = valuation.assets.iter().map(|a| a.ratio).sum();
    assert!((ratios - 1.0).abs() < 1e-9);

    let opt = report.optimization.as_ref().unwrap();
    for (_, w) in opt.max_sharpe.weights.iter() {
        assert!((-1e-9..=1.0 + 1e-9).contains(&w));
    }
    assert!(opt.frontier.len() >= 2);
    assert!(report
        .suggestions
        .iter()
        .any(|s| s.label == "current"));
}

#[test]
fn test_gateway_outage_degrades_to_stale_values() {
    let gateway = scripted_market();
    let config = test_config();
    let cache = Arc::new(CacheManager::in_memory(Arc::clone(&gateway) as Arc<dyn MarketDataGateway>, &config));
    let engine = PortfolioEngine::new(cache, config);

    let warm = engine.run(&sample_portfolio(), &RunOptions::default()).unwrap();
    assert!(warm.stale_fields.is_empty());

    gateway.fail_all(GatewayError::Network("connection refused".to_string()));
    let options = RunOptions {
        force_refresh: true,
        ..Default::default()
    };
    let degraded = engine.run(&sample_portfolio(), &options).unwrap();

    assert!(degraded.stale_fields.contains(&"AAPL.price".to_string()));
    assert!(degraded.risk_free_rate.stale);
    let before = warm.valuation.as_ref().unwrap().total_usd;
    let after = degraded.valuation.as_ref().unwrap().total_usd;
    assert!((before - after).abs() < 1e-9);
}

#[test]
fn test_unknown_asset_is_excluded_not_fatal() {
    let gateway = scripted_market();
    let config = test_config();
    let cache = Arc::new(CacheManager::in_memory(gateway, &config));
    let engine = PortfolioEngine::new(cache, config);

    let mut portfolio = sample_portfolio();
    portfolio.add_holding("DELISTED", 5.0).unwrap();
    let report = engine.run(&portfolio, &RunOptions::default()).unwrap();

    assert!(report.excluded.contains_key("DELISTED"));
    let valuation = report.valuation.as_ref().unwrap();
    assert!(valuation.get("DELISTED").is_none());
    assert_eq!(valuation.assets.len(), 3);
}

#[test]
fn test_sqlite_cache_survives_restart() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("cache.db");
    let config = test_config();

    let first_gateway = scripted_market();
    let first = CacheManager::new(
        Arc::clone(&first_gateway) as Arc<dyn MarketDataGateway>,
        Arc::new(SqliteStore::open(&db).unwrap()),
        &config,
    );
    let snapshot = first.get_asset_snapshot("AAPL", false).unwrap();
    assert_eq!(first_gateway.calls("fetch_price", "AAPL"), 1);

    let second_gateway = scripted_market();
    let second = CacheManager::new(
        Arc::clone(&second_gateway) as Arc<dyn MarketDataGateway>,
        Arc::new(SqliteStore::open(&db).unwrap()),
        &config,
    );
    let reloaded = second.get_asset_snapshot("AAPL", false).unwrap();
    assert_eq!(second_gateway.calls("fetch_price", "AAPL"), 0);
    assert_eq!(second_gateway.calls("fetch_history", "AAPL"), 0);
    assert_eq!(reloaded.price, snapshot.price);
    assert_eq!(reloaded.history.len(), snapshot.history.len());

    let entries = second.entries().unwrap();
    assert!(entries
        .iter()
        .any(|e| e.symbol == "AAPL" && e.class == FieldClass::History));
    assert!(second.invalidate("AAPL").unwrap() >= 3);
    second.price("AAPL", false).unwrap();
    assert_eq!(second_gateway.calls("fetch_price", "AAPL"), 1);
}

#[test]
fn test_csv_gateway_drives_full_run() {
    let dir = TempDir::new().unwrap();
    write_series(&dir, "AAPL", &synthetic_history(300, 180.0, 0.0007, 0.018, 0.0));
    write_series(&dir, "7203.T", &synthetic_history(300, 2800.0, 0.0003, 0.014, 2.2));
    write_series(&dir, "^GSPC", &synthetic_history(300, 4500.0, 0.0004, 0.008, 0.8));
    std::fs::write(dir.path().join("JPY=X.csv"), "Date,Close\n2024-10-01,145.0\n").unwrap();
    std::fs::write(dir.path().join("^TNX.csv"), "Date,Close\n2024-10-01,4.2\n").unwrap();

    let config = test_config();
    let gateway = TimeoutGateway::new(CsvGateway::new(dir.path()), config.cache.gateway_timeout());
    assert!((gateway.fetch_risk_free_rate().unwrap() - 0.042).abs() < 1e-12);

    let cache = Arc::new(CacheManager::in_memory(Arc::new(gateway), &config));
    let engine = PortfolioEngine::new(cache, config);

    let mut portfolio = Portfolio::new("csv");
    portfolio.add_holding("AAPL", 10.0).unwrap();
    portfolio.add_holding("7203.T", 100.0).unwrap();
    let report = engine.run(&portfolio, &RunOptions::default()).unwrap();

    assert!(report.is_complete(), "{:?}", report.failures);
    assert_eq!(report.usd_jpy.value, 145.0);
    assert!(!report.usd_jpy.assumed);
    assert_eq!(report.betas.len(), 2);
}

#[test]
fn test_portfolio_manager_import_and_history() {
    let dir = TempDir::new().unwrap();
    let csv_path = dir.path().join("growth.csv");
    std::fs::write(&csv_path, "ticker,shares\nAAPL,20\nVOO,10\n7203.T,200\n").unwrap();

    let manager = PortfolioManager::open(dir.path().join("sena.db")).unwrap();
    let imported = manager.import_csv(&csv_path, None).unwrap();
    assert_eq!(imported.name, "growth");
    assert_eq!(imported.len(), 3);
    let id = imported.id.unwrap();

    // Re-import replaces holdings rather than duplicating the portfolio.
    std::fs::write(&csv_path, "ticker,shares\nAAPL,25\n").unwrap();
    let updated = manager.import_csv(&csv_path, None).unwrap();
    assert_eq!(updated.id, Some(id));
    assert_eq!(updated.shares("AAPL"), Some(25.0));
    assert_eq!(manager.list().unwrap().len(), 1);

    let config = test_config();
    let cache = Arc::new(CacheManager::in_memory(scripted_market(), &config));
    let engine = PortfolioEngine::new(cache, config);
    let report = engine.run(&updated, &RunOptions::default()).unwrap();
    let snapshot = report.to_history_snapshot().unwrap();
    manager.add_history_snapshot(id, &snapshot).unwrap();

    let history = manager.history(id, 30).unwrap();
    assert_eq!(history.len(), 1);
    assert!((history[0].total_value_usd - snapshot.total_value_usd).abs() < 1e-9);

    assert!(manager.delete(id).unwrap());
    assert!(manager.get(id).unwrap().is_none());
    assert!(!manager.delete(id).unwrap());
}

#[test]
fn test_rebalance_toward_heuristic_target() {
    let config = test_config();
    let cache = Arc::new(CacheManager::in_memory(scripted_market(), &config));
    let engine = PortfolioEngine::new(cache, config);

    let options = RunOptions {
        target: TargetStrategy::SharpeScore,
        min_trade_value: Some(0.0),
        ..Default::default()
    };
    let report = engine.run(&sample_portfolio(), &options).unwrap();
    let target = report.target.as_ref().unwrap();
    assert!((target.total() - 1.0).abs() < 1e-9);

    let buys: f64 = report
        .trades
        .iter()
        .filter(|t| t.action == TradeAction::Buy)
        .map(|t| t.amount)
        .sum();
    let sells: f64 = report
        .trades
        .iter()
        .filter(|t| t.action == TradeAction::Sell)
        .map(|t| t.amount)
        .sum();
    assert!((buys + sells).abs() < 1e-6);
}

#[test]
fn test_worked_rebalance_and_crash_examples() {
    let current = Allocation::from_values([("AAPL", 0.30), ("VOO", 0.70)]).unwrap();
    let target = Allocation::from_values([("AAPL", 0.50), ("VOO", 0.50)]).unwrap();
    let trades = RebalancingPlanner::plan(&current, &target, 100_000.0, 100.0).unwrap();
    assert_eq!(trades.len(), 2);
    assert_eq!(trades[0].symbol, "AAPL");
    assert_eq!(trades[0].action, TradeAction::Buy);
    assert!((trades[0].amount - 20_000.0).abs() < 1e-6);
    assert_eq!(trades[1].action, TradeAction::Sell);

    let allocation = Allocation::from_values([("A", 0.6), ("B", 0.4)]).unwrap();
    let betas: BTreeMap<String, f64> = [("A".to_string(), 1.2), ("B".to_string(), 0.8)]
        .into_iter()
        .collect();
    let result = CrashSimulator::default()
        .simulate(&allocation, &betas, -10.0)
        .unwrap();
    assert!((result.portfolio_impact_pct + 10.4).abs() < 1e-9);
}
