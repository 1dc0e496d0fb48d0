//! Error types for the portfolio engine.

use crate::gateway::GatewayError;
use thiserror::Error;

/// Main error type for cache, analytics and persistence operations.
#[derive(Error, Debug)]
pub enum PortfolioError {
    /// No fresh or stale value exists and the gateway could not supply one.
    #[error("Data unavailable for {symbol}: {reason}")]
    DataUnavailable { symbol: String, reason: String },

    /// Singular covariance or single-asset input. Solvers return a boundary answer
    /// instead of this error; it is surfaced as a diagnostic.
    #[error("Optimization degenerate: {0}")]
    OptimizationDegenerate(String),

    /// Solver did not converge within tolerance after the relaxed retry.
    #[error("Optimization failed during {stage}: {reason}")]
    OptimizationFailed { stage: String, reason: String },

    /// Zero-variance return series; Sharpe cannot be computed.
    #[error("Undefined risk metric for {symbol}: {reason}")]
    UndefinedRiskMetric { symbol: String, reason: String },

    /// Raw gateway failure. The cache converts these into `DataUnavailable` once
    /// retries and the stale fallback are exhausted.
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Date parsing error: {0}")]
    DateParseError(#[from] chrono::ParseError),
}

impl PortfolioError {
    /// True for network and timeout failures, which the cache retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, PortfolioError::Gateway(e) if e.is_transient())
    }

    /// Shorthand for a [`PortfolioError::DataUnavailable`].
    pub fn unavailable(symbol: impl Into<String>, reason: impl Into<String>) -> Self {
        PortfolioError::DataUnavailable {
            symbol: symbol.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`PortfolioError::OptimizationFailed`].
    pub fn optimization_failed(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        PortfolioError::OptimizationFailed {
            stage: stage.into(),
            reason: reason.into(),
        }
    }
}

impl From<rusqlite::Error> for PortfolioError {
    fn from(e: rusqlite::Error) -> Self {
        PortfolioError::DatabaseError(e.to_string())
    }
}

/// Result type alias for portfolio operations.
pub type Result<T> = std::result::Result<T, PortfolioError>;
