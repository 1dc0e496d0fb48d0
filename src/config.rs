//! Engine configuration.
//!
//! Every tunable the cache and analytics modules read lives here and is passed
//! explicitly into their constructors. Configurations load from and save to TOML.

use crate::cache::FieldClass;
use crate::error::{PortfolioError, Result};
use crate::optimizer::SharpeSolverKind;
use crate::rebalance::RiskProfile;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Complete engine configuration loaded from a file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub risk: RiskSettings,
    #[serde(default)]
    pub optimizer: OptimizerSettings,
    #[serde(default)]
    pub rebalance: RebalanceSettings,
    #[serde(default)]
    pub scenario: ScenarioSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

/// Field cache settings. TTLs are in hours.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Name, sector, industry, country, currency.
    #[serde(default = "default_metadata_ttl")]
    pub metadata_ttl_hours: f64,
    /// Volatility, Sharpe and the price history they derive from.
    #[serde(default = "default_risk_ttl")]
    pub risk_metrics_ttl_hours: f64,
    /// Latest price, exchange rate and risk-free rate.
    #[serde(default = "default_price_ttl")]
    pub price_ttl_hours: f64,
    /// Per-call gateway timeout in seconds.
    #[serde(default = "default_gateway_timeout")]
    pub gateway_timeout_secs: f64,
    /// Retries after the first attempt for transient gateway errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial backoff; doubles on every retry.
    #[serde(default = "default_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// History window requested from the gateway.
    #[serde(default = "default_history_period")]
    pub history_period: String,
    /// Price fields older than this multiple of the price TTL are purged.
    #[serde(default = "default_expired_multiplier")]
    pub expired_price_multiplier: f64,
}

fn default_metadata_ttl() -> f64 { 24.0 * 7.0 }
fn default_risk_ttl() -> f64 { 24.0 }
fn default_price_ttl() -> f64 { 0.25 }
fn default_gateway_timeout() -> f64 { 5.0 }
fn default_max_retries() -> u32 { 2 }
fn default_backoff_ms() -> u64 { 200 }
fn default_history_period() -> String { "1y".to_string() }
fn default_expired_multiplier() -> f64 { 10.0 }

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            metadata_ttl_hours: default_metadata_ttl(),
            risk_metrics_ttl_hours: default_risk_ttl(),
            price_ttl_hours: default_price_ttl(),
            gateway_timeout_secs: default_gateway_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_backoff_ms(),
            history_period: default_history_period(),
            expired_price_multiplier: default_expired_multiplier(),
        }
    }
}

impl CacheSettings {
    /// Time-to-live for a field class.
    pub fn ttl(&self, class: FieldClass) -> Duration {
        let hours = match class {
            FieldClass::Metadata => self.metadata_ttl_hours,
            FieldClass::RiskMetrics | FieldClass::History => self.risk_metrics_ttl_hours,
            FieldClass::Price => self.price_ttl_hours,
        };
        hours_to_duration(hours)
    }

    pub fn gateway_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.gateway_timeout_secs.max(0.0))
    }

    pub fn retry_backoff(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.retry_backoff_ms)
    }
}

fn hours_to_duration(hours: f64) -> Duration {
    Duration::milliseconds((hours * 3_600_000.0).round() as i64)
}

/// Annualization and default market inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSettings {
    /// Trading days per year for square-root-of-time scaling.
    #[serde(default = "default_trading_days")]
    pub trading_days: f64,
    /// Used when the gateway never supplied a risk-free rate.
    #[serde(default = "default_risk_free_rate")]
    pub default_risk_free_rate: f64,
    /// Used when the gateway never supplied an exchange rate.
    #[serde(default = "default_usd_jpy")]
    pub default_usd_jpy: f64,
}

fn default_trading_days() -> f64 { 252.0 }
fn default_risk_free_rate() -> f64 { 0.04 }
fn default_usd_jpy() -> f64 { 100.0 }

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            trading_days: default_trading_days(),
            default_risk_free_rate: default_risk_free_rate(),
            default_usd_jpy: default_usd_jpy(),
        }
    }
}

/// Efficient frontier solver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSettings {
    /// Iteration cap for every solve.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Solver tolerance and allowed weight-sum deviation.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Tolerance for the single retry after a failed solve.
    #[serde(default = "default_relaxed_tolerance")]
    pub relaxed_tolerance: f64,
    /// Diagonal loading applied to a near-singular covariance matrix.
    #[serde(default = "default_regularization")]
    pub regularization_epsilon: f64,
    /// Frontier sample count.
    #[serde(default = "default_frontier_points")]
    pub frontier_points: usize,
    /// Minimum aligned daily returns for an asset to enter the basket.
    #[serde(default = "default_min_history")]
    pub min_history_days: usize,
    /// Backend for the max-Sharpe solve.
    #[serde(default)]
    pub sharpe_solver: SharpeSolverKind,
    /// Random portfolios drawn for frontier scatter plots.
    #[serde(default = "default_random_portfolios")]
    pub random_portfolios: usize,
}

fn default_max_iterations() -> u32 { 1000 }
fn default_tolerance() -> f64 { 1e-6 }
fn default_relaxed_tolerance() -> f64 { 1e-4 }
fn default_regularization() -> f64 { 1e-8 }
fn default_frontier_points() -> usize { 50 }
fn default_min_history() -> usize { 252 }
fn default_random_portfolios() -> usize { 500 }

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tolerance: default_tolerance(),
            relaxed_tolerance: default_relaxed_tolerance(),
            regularization_epsilon: default_regularization(),
            frontier_points: default_frontier_points(),
            min_history_days: default_min_history(),
            sharpe_solver: SharpeSolverKind::default(),
            random_portfolios: default_random_portfolios(),
        }
    }
}

/// Rebalancing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceSettings {
    /// Trades with smaller notional are dropped from the plan.
    #[serde(default = "default_min_trade")]
    pub min_trade_value: f64,
    /// Exponent profile for inverse-volatility targets.
    #[serde(default)]
    pub risk_profile: RiskProfile,
    /// `a` in `score = sharpe^a / sigma^b`.
    #[serde(default = "default_one")]
    pub sharpe_exponent: f64,
    /// `b` in `score = sharpe^a / sigma^b`.
    #[serde(default = "default_one")]
    pub volatility_exponent: f64,
}

fn default_min_trade() -> f64 { 500.0 }
fn default_one() -> f64 { 1.0 }

impl Default for RebalanceSettings {
    fn default() -> Self {
        Self {
            min_trade_value: default_min_trade(),
            risk_profile: RiskProfile::default(),
            sharpe_exponent: 1.0,
            volatility_exponent: 1.0,
        }
    }
}

/// Crash scenario settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSettings {
    /// Market shocks in percent, e.g. `-20.0`.
    #[serde(default = "default_shocks")]
    pub shocks_pct: Vec<f64>,
    /// Beta above which a holding is flagged.
    #[serde(default = "default_high_beta")]
    pub high_beta_threshold: f64,
    /// Weight above which a holding is flagged as concentrated.
    #[serde(default = "default_concentration")]
    pub concentration_threshold: f64,
    /// Beta assumed when none is supplied.
    #[serde(default = "default_one")]
    pub default_beta: f64,
    /// Annual volatility assumed for the pessimistic estimate when none is known.
    #[serde(default = "default_volatility")]
    pub default_volatility: f64,
    /// Market index whose history betas are measured against.
    #[serde(default = "default_benchmark")]
    pub benchmark: Option<String>,
}

fn default_shocks() -> Vec<f64> { vec![-10.0, -20.0, -30.0, -50.0] }
fn default_high_beta() -> f64 { 1.5 }
fn default_concentration() -> f64 { 0.30 }
fn default_volatility() -> f64 { 0.30 }
fn default_benchmark() -> Option<String> { Some("^GSPC".to_string()) }

impl Default for ScenarioSettings {
    fn default() -> Self {
        Self {
            shocks_pct: default_shocks(),
            high_beta_threshold: default_high_beta(),
            concentration_threshold: default_concentration(),
            default_beta: 1.0,
            default_volatility: default_volatility(),
            benchmark: default_benchmark(),
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageSettings {
    /// SQLite database path; `None` keeps the cache in memory.
    #[serde(default)]
    pub database_path: Option<String>,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| PortfolioError::ConfigError(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings no component can work with.
    pub fn validate(&self) -> Result<()> {
        let ttls = [
            ("cache.metadata_ttl_hours", self.cache.metadata_ttl_hours),
            ("cache.risk_metrics_ttl_hours", self.cache.risk_metrics_ttl_hours),
            ("cache.price_ttl_hours", self.cache.price_ttl_hours),
        ];
        for (name, value) in ttls {
            if !(value > 0.0) {
                return Err(PortfolioError::ConfigError(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        if !(self.cache.gateway_timeout_secs > 0.0) {
            return Err(PortfolioError::ConfigError(
                "cache.gateway_timeout_secs must be positive".to_string(),
            ));
        }
        if !(self.risk.trading_days > 0.0) {
            return Err(PortfolioError::ConfigError(
                "risk.trading_days must be positive".to_string(),
            ));
        }
        if self.optimizer.max_iterations == 0 {
            return Err(PortfolioError::ConfigError(
                "optimizer.max_iterations must be at least 1".to_string(),
            ));
        }
        if !(self.optimizer.tolerance > 0.0)
            || self.optimizer.relaxed_tolerance < self.optimizer.tolerance
        {
            return Err(PortfolioError::ConfigError(
                "optimizer tolerances must be positive and relaxed >= strict".to_string(),
            ));
        }
        if self.optimizer.regularization_epsilon < 0.0 {
            return Err(PortfolioError::ConfigError(
                "optimizer.regularization_epsilon must be non-negative".to_string(),
            ));
        }
        if self.rebalance.min_trade_value < 0.0 {
            return Err(PortfolioError::ConfigError(
                "rebalance.min_trade_value must be non-negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Generate an example configuration file content.
    pub fn example() -> String {
        r#"# Sena engine configuration

[cache]
metadata_ttl_hours = 168.0      # 1 week
risk_metrics_ttl_hours = 24.0   # 1 day
price_ttl_hours = 0.25          # 15 minutes
gateway_timeout_secs = 5.0
max_retries = 2
retry_backoff_ms = 200
history_period = "1y"
expired_price_multiplier = 10.0

[risk]
trading_days = 252.0
default_risk_free_rate = 0.04
default_usd_jpy = 100.0

[optimizer]
max_iterations = 1000
tolerance = 1e-6
relaxed_tolerance = 1e-4
regularization_epsilon = 1e-8
frontier_points = 50
min_history_days = 252
sharpe_solver = "projected-gradient"   # or "convex-transform"
random_portfolios = 500

[rebalance]
min_trade_value = 500.0
risk_profile = "balanced"   # conservative, balanced, aggressive
sharpe_exponent = 1.0
volatility_exponent = 1.0

[scenario]
shocks_pct = [-10.0, -20.0, -30.0, -50.0]
high_beta_threshold = 1.5
concentration_threshold = 0.30
default_beta = 1.0
default_volatility = 0.30
benchmark = "^GSPC"

[storage]
# database_path = "data/portfolio.db"
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.cache.price_ttl_hours, 0.25);
        assert_eq!(config.optimizer.max_iterations, 1000);
        assert_eq!(config.rebalance.min_trade_value, 500.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ttl_per_class() {
        let cache = CacheSettings::default();
        assert_eq!(cache.ttl(FieldClass::Price), Duration::minutes(15));
        assert_eq!(cache.ttl(FieldClass::RiskMetrics), Duration::hours(24));
        assert_eq!(cache.ttl(FieldClass::History), Duration::hours(24));
        assert_eq!(cache.ttl(FieldClass::Metadata), Duration::hours(168));
    }

    #[test]
    fn test_load_partial_config() {
        let toml_content = r#"
[cache]
price_ttl_hours = 0.5

[optimizer]
frontier_points = 20
sharpe_solver = "convex-transform"

[rebalance]
risk_profile = "aggressive"
"#;
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", toml_content).unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.cache.price_ttl_hours, 0.5);
        assert_eq!(config.cache.metadata_ttl_hours, 168.0);
        assert_eq!(config.optimizer.frontier_points, 20);
        assert_eq!(config.optimizer.sharpe_solver, SharpeSolverKind::ConvexTransform);
        assert_eq!(config.rebalance.risk_profile, RiskProfile::Aggressive);
        assert_eq!(config.scenario.shocks_pct.len(), 4);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[cache]\nprice_ttl_hours = 0.0").unwrap();
        assert!(EngineConfig::load(file.path()).is_err());

        let config = EngineConfig {
            optimizer: OptimizerSettings {
                tolerance: 1e-3,
                relaxed_tolerance: 1e-6,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let config = EngineConfig::default();
        let file = NamedTempFile::new().unwrap();
        config.save(file.path()).unwrap();

        let loaded = EngineConfig::load(file.path()).unwrap();
        assert_eq!(loaded.cache.metadata_ttl_hours, config.cache.metadata_ttl_hours);
        assert_eq!(loaded.scenario.shocks_pct, config.scenario.shocks_pct);
    }

    #[test]
    fn test_example_config_parses() {
        let config: EngineConfig = toml::from_str(&EngineConfig::example()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.optimizer.frontier_points, 50);
    }
}
