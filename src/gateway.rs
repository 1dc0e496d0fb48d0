//! Market data gateway abstraction.
//!
//! The cache is the only caller of a gateway. Implementations must be shareable
//! across threads; every call is blocking.
//!
//! - [`MarketDataGateway`]: the narrow fetch interface the cache depends on
//! - [`TimeoutGateway`]: enforces a per-call deadline on any gateway
//! - [`CsvGateway`]: offline gateway backed by a directory of CSV price files
//! - [`testing::ScriptedGateway`]: in-memory gateway with call counters and failure
//!   injection

use crate::types::{AssetMetadata, PricePoint};
use chrono::{Duration, NaiveDate};
use csv::ReaderBuilder;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use tracing::{debug, warn};

/// Reserved identifier under which the risk-free rate is cached.
pub const RISK_FREE_SYMBOL: &str = "^RF";
/// Reserved identifier under which the USD/JPY rate is cached.
pub const USD_JPY_SYMBOL: &str = "JPY=X";

/// Failure reported by a market data gateway.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("not found: {0}")]
    NotFound(String),
}

impl GatewayError {
    /// Transient failures are retried by the cache; `NotFound` is permanent.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Network(_) | GatewayError::Timeout(_))
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Source of prices, metadata, histories and market rates.
pub trait MarketDataGateway: Send + Sync {
    /// Latest price in the asset's own currency.
    fn fetch_price(&self, symbol: &str) -> GatewayResult<f64>;

    /// Descriptive attributes.
    fn fetch_metadata(&self, symbol: &str) -> GatewayResult<AssetMetadata>;

    /// Daily closes ordered by date for a period such as `"1y"` or `"6mo"`.
    fn fetch_history(&self, symbol: &str, period: &str) -> GatewayResult<Vec<PricePoint>>;

    /// Annual risk-free rate as a decimal.
    fn fetch_risk_free_rate(&self) -> GatewayResult<f64>;

    /// Yen per US dollar.
    fn fetch_exchange_rate(&self) -> GatewayResult<f64>;
}

impl<G: MarketDataGateway + ?Sized> MarketDataGateway for Arc<G> {
    fn fetch_price(&self, symbol: &str) -> GatewayResult<f64> {
        (**self).fetch_price(symbol)
    }

    fn fetch_metadata(&self, symbol: &str) -> GatewayResult<AssetMetadata> {
        (**self).fetch_metadata(symbol)
    }

    fn fetch_history(&self, symbol: &str, period: &str) -> GatewayResult<Vec<PricePoint>> {
        (**self).fetch_history(symbol, period)
    }

    fn fetch_risk_free_rate(&self) -> GatewayResult<f64> {
        (**self).fetch_risk_free_rate()
    }

    fn fetch_exchange_rate(&self) -> GatewayResult<f64> {
        (**self).fetch_exchange_rate()
    }
}

/// Parse a period string (`5d`, `1mo`, `6mo`, `1y`, `2y`, `max`) into a lookback.
///
/// `max` and unrecognized strings return `None`, meaning the full history.
pub fn parse_period(period: &str) -> Option<Duration> {
    let period = period.trim().to_ascii_lowercase();
    if period == "max" {
        return None;
    }
    let split = period.find(|c: char| !c.is_ascii_digit())?;
    let (count, unit) = period.split_at(split);
    let count: i64 = count.parse().ok()?;
    match unit {
        "d" => Some(Duration::days(count)),
        "wk" | "w" => Some(Duration::weeks(count)),
        "mo" | "m" => Some(Duration::days(count * 30)),
        "y" => Some(Duration::days(count * 365)),
        _ => None,
    }
}

/// Wraps a gateway and turns slow calls into [`GatewayError::Timeout`].
///
/// Each call runs on a helper thread. A call that misses its deadline keeps
/// running in the background and its result is discarded.
pub struct TimeoutGateway<G> {
    inner: Arc<G>,
    timeout: std::time::Duration,
}

impl<G: MarketDataGateway + 'static> TimeoutGateway<G> {
    pub fn new(inner: G, timeout: std::time::Duration) -> Self {
        Self {
            inner: Arc::new(inner),
            timeout,
        }
    }

    fn call<T, F>(&self, what: &str, f: F) -> GatewayResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&G) -> GatewayResult<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || {
            // Receiver may be gone after a timeout.
            let _ = tx.send(f(&inner));
        });

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!("Gateway call {} timed out after {:?}", what, self.timeout);
                Err(GatewayError::Timeout(self.timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(GatewayError::Network(format!(
                "gateway worker for {} terminated",
                what
            ))),
        }
    }
}

impl<G: MarketDataGateway + 'static> MarketDataGateway for TimeoutGateway<G> {
    fn fetch_price(&self, symbol: &str) -> GatewayResult<f64> {
        let s = symbol.to_string();
        self.call("fetch_price", move |g| g.fetch_price(&s))
    }

    fn fetch_metadata(&self, symbol: &str) -> GatewayResult<AssetMetadata> {
        let s = symbol.to_string();
        self.call("fetch_metadata", move |g| g.fetch_metadata(&s))
    }

    fn fetch_history(&self, symbol: &str, period: &str) -> GatewayResult<Vec<PricePoint>> {
        let s = symbol.to_string();
        let p = period.to_string();
        self.call("fetch_history", move |g| g.fetch_history(&s, &p))
    }

    fn fetch_risk_free_rate(&self) -> GatewayResult<f64> {
        self.call("fetch_risk_free_rate", |g| g.fetch_risk_free_rate())
    }

    fn fetch_exchange_rate(&self) -> GatewayResult<f64> {
        self.call("fetch_exchange_rate", |g| g.fetch_exchange_rate())
    }
}

#[derive(Debug, Deserialize)]
struct PriceRow {
    #[serde(alias = "Date", alias = "timestamp")]
    date: String,
    #[serde(alias = "Close", alias = "close_price", alias = "price")]
    close: f64,
}

#[derive(Debug, Deserialize)]
struct MetadataRow {
    #[serde(alias = "ticker")]
    symbol: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    sector: Option<String>,
    #[serde(default)]
    industry: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    currency: Option<String>,
}

/// Gateway reading daily closes from `<dir>/<SYMBOL>.csv`.
///
/// Price files need `date,close` columns (extra columns are ignored). Optional
/// `metadata.csv` holds `symbol,name,sector,industry,country,currency` rows.
/// The risk-free rate is the last close of `^TNX.csv` (quoted in percent, or ten
/// times percent) and the exchange rate is the last close of `JPY=X.csv`.
pub struct CsvGateway {
    dir: PathBuf,
}

impl CsvGateway {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn series_path(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", symbol))
    }

    fn load_series(&self, symbol: &str) -> GatewayResult<Vec<PricePoint>> {
        let path = self.series_path(symbol);
        if !path.exists() {
            return Err(GatewayError::NotFound(format!(
                "no price file {}",
                path.display()
            )));
        }

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(&path)
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        let mut points = Vec::new();
        for (row_num, result) in reader.deserialize::<PriceRow>().enumerate() {
            let row = match result {
                Ok(r) => r,
                Err(e) => {
                    debug!("Skipping row {} of {}: {}", row_num + 1, path.display(), e);
                    continue;
                }
            };
            let date_part = row.date.get(..10).unwrap_or(&row.date);
            match NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
                Ok(date) if row.close.is_finite() && row.close > 0.0 => {
                    points.push(PricePoint::new(date, row.close))
                }
                Ok(_) => debug!("Skipping non-positive close in {}", path.display()),
                Err(e) => debug!("Skipping row {} of {}: {}", row_num + 1, path.display(), e),
            }
        }

        if points.is_empty() {
            return Err(GatewayError::NotFound(format!(
                "no valid rows in {}",
                path.display()
            )));
        }

        points.sort_by_key(|p| p.date);
        points.dedup_by_key(|p| p.date);
        Ok(points)
    }

    fn last_close(&self, symbol: &str) -> GatewayResult<f64> {
        self.load_series(symbol)?
            .last()
            .map(|p| p.close)
            .ok_or_else(|| GatewayError::NotFound(symbol.to_string()))
    }

    fn load_metadata(&self) -> GatewayResult<HashMap<String, MetadataRow>> {
        let path = self.dir.join("metadata.csv");
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(&path)
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        let mut rows = HashMap::new();
        for result in reader.deserialize::<MetadataRow>() {
            match result {
                Ok(row) => {
                    rows.insert(row.symbol.clone(), row);
                }
                Err(e) => debug!("Skipping metadata row: {}", e),
            }
        }
        Ok(rows)
    }
}

/// Normalize a ^TNX quote: values above 20 are ten times percent.
fn normalize_treasury_quote(raw: f64) -> f64 {
    let pct = if raw > 20.0 { raw / 10.0 } else { raw };
    pct / 100.0
}

impl MarketDataGateway for CsvGateway {
    fn fetch_price(&self, symbol: &str) -> GatewayResult<f64> {
        self.last_close(symbol)
    }

    fn fetch_metadata(&self, symbol: &str) -> GatewayResult<AssetMetadata> {
        let mut rows = self.load_metadata()?;
        match rows.remove(symbol) {
            Some(row) => Ok(AssetMetadata {
                name: row.name.unwrap_or_else(|| symbol.to_string()),
                sector: row.sector,
                industry: row.industry,
                country: row.country,
                currency: row.currency,
            }),
            None if self.series_path(symbol).exists() => Ok(AssetMetadata::named(symbol)),
            None => Err(GatewayError::NotFound(symbol.to_string())),
        }
    }

    fn fetch_history(&self, symbol: &str, period: &str) -> GatewayResult<Vec<PricePoint>> {
        let points = self.load_series(symbol)?;
        let Some(lookback) = parse_period(period) else {
            return Ok(points);
        };
        let last = points[points.len() - 1].date;
        let start = last - lookback;
        Ok(points.into_iter().filter(|p| p.date >= start).collect())
    }

    fn fetch_risk_free_rate(&self) -> GatewayResult<f64> {
        self.last_close("^TNX").map(normalize_treasury_quote)
    }

    fn fetch_exchange_rate(&self) -> GatewayResult<f64> {
        self.last_close(USD_JPY_SYMBOL)
    }
}

/// In-memory gateway for tests and demos.
pub mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Script {
        prices: HashMap<String, f64>,
        metadata: HashMap<String, AssetMetadata>,
        histories: HashMap<String, Vec<PricePoint>>,
        risk_free_rate: Option<f64>,
        exchange_rate: Option<f64>,
        failures: HashMap<String, GatewayError>,
        fail_all: Option<GatewayError>,
        /// Transient failures left before calls succeed again.
        flaky_remaining: usize,
        delay: std::time::Duration,
    }

    /// Scripted gateway that counts calls per `method:symbol` key.
    #[derive(Default)]
    pub struct ScriptedGateway {
        script: Mutex<Script>,
        calls: Mutex<BTreeMap<String, usize>>,
        total_calls: AtomicUsize,
    }

    impl ScriptedGateway {
        pub fn new() -> Self {
            Self::default()
        }

        /// Register an asset with a price history; its latest close is the price.
        pub fn with_asset(self, symbol: &str, history: Vec<PricePoint>) -> Self {
            {
                let mut script = self.script.lock();
                if let Some(last) = history.last() {
                    script.prices.insert(symbol.to_string(), last.close);
                }
                script
                    .metadata
                    .insert(symbol.to_string(), AssetMetadata::named(symbol));
                script.histories.insert(symbol.to_string(), history);
            }
            self
        }

        pub fn with_risk_free_rate(self, rate: f64) -> Self {
            self.script.lock().risk_free_rate = Some(rate);
            self
        }

        pub fn with_exchange_rate(self, rate: f64) -> Self {
            self.script.lock().exchange_rate = Some(rate);
            self
        }

        pub fn set_price(&self, symbol: &str, price: f64) {
            self.script.lock().prices.insert(symbol.to_string(), price);
        }

        pub fn set_metadata(&self, symbol: &str, metadata: AssetMetadata) {
            self.script
                .lock()
                .metadata
                .insert(symbol.to_string(), metadata);
        }

        /// Make every call for `symbol` fail with `error`.
        pub fn fail_symbol(&self, symbol: &str, error: GatewayError) {
            self.script
                .lock()
                .failures
                .insert(symbol.to_string(), error);
        }

        /// Make every call fail with `error`.
        pub fn fail_all(&self, error: GatewayError) {
            self.script.lock().fail_all = Some(error);
        }

        /// Fail the next `count` calls with a transient network error.
        pub fn fail_next(&self, count: usize) {
            self.script.lock().flaky_remaining = count;
        }

        /// Clear all injected failures.
        pub fn heal(&self) {
            let mut script = self.script.lock();
            script.failures.clear();
            script.fail_all = None;
            script.flaky_remaining = 0;
        }

        /// Sleep inside every call, to widen race windows in tests.
        pub fn set_delay(&self, delay: std::time::Duration) {
            self.script.lock().delay = delay;
        }

        /// Calls recorded for `method` (e.g. `"fetch_price"`) and `symbol`.
        pub fn calls(&self, method: &str, symbol: &str) -> usize {
            self.calls
                .lock()
                .get(&format!("{}:{}", method, symbol))
                .copied()
                .unwrap_or(0)
        }

        pub fn total_calls(&self) -> usize {
            self.total_calls.load(Ordering::SeqCst)
        }

        fn enter(&self, method: &str, symbol: &str) -> GatewayResult<()> {
            self.total_calls.fetch_add(1, Ordering::SeqCst);
            *self
                .calls
                .lock()
                .entry(format!("{}:{}", method, symbol))
                .or_insert(0) += 1;

            let delay = {
                let mut script = self.script.lock();
                if let Some(err) = &script.fail_all {
                    return Err(err.clone());
                }
                if let Some(err) = script.failures.get(symbol) {
                    return Err(err.clone());
                }
                if script.flaky_remaining > 0 {
                    script.flaky_remaining -= 1;
                    return Err(GatewayError::Network("injected transient failure".into()));
                }
                script.delay
            };
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            Ok(())
        }
    }

    impl MarketDataGateway for ScriptedGateway {
        fn fetch_price(&self, symbol: &str) -> GatewayResult<f64> {
            self.enter("fetch_price", symbol)?;
            self.script
                .lock()
                .prices
                .get(symbol)
                .copied()
                .ok_or_else(|| GatewayError::NotFound(symbol.to_string()))
        }

        fn fetch_metadata(&self, symbol: &str) -> GatewayResult<AssetMetadata> {
            self.enter("fetch_metadata", symbol)?;
            self.script
                .lock()
                .metadata
                .get(symbol)
                .cloned()
                .ok_or_else(|| GatewayError::NotFound(symbol.to_string()))
        }

        fn fetch_history(&self, symbol: &str, _period: &str) -> GatewayResult<Vec<PricePoint>> {
            self.enter("fetch_history", symbol)?;
            self.script
                .lock()
                .histories
                .get(symbol)
                .cloned()
                .ok_or_else(|| GatewayError::NotFound(symbol.to_string()))
        }

        fn fetch_risk_free_rate(&self) -> GatewayResult<f64> {
            self.enter("fetch_risk_free_rate", RISK_FREE_SYMBOL)?;
            self.script
                .lock()
                .risk_free_rate
                .ok_or_else(|| GatewayError::NotFound(RISK_FREE_SYMBOL.to_string()))
        }

        fn fetch_exchange_rate(&self) -> GatewayResult<f64> {
            self.enter("fetch_exchange_rate", USD_JPY_SYMBOL)?;
            self.script
                .lock()
                .exchange_rate
                .ok_or_else(|| GatewayError::NotFound(USD_JPY_SYMBOL.to_string()))
        }
    }

    /// Deterministic daily closes: a drift plus two sine waves.
    ///
    /// `phase` shifts the oscillation so different assets are imperfectly
    /// correlated.
    pub fn synthetic_history(
        days: usize,
        start_price: f64,
        daily_drift: f64,
        amplitude: f64,
        phase: f64,
    ) -> Vec<PricePoint> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default();
        let mut price = start_price;
        (0..days)
            .map(|i| {
                let t = i as f64;
                let noise = ((t * 0.7 + phase).sin() * 0.6 + (t * 1.3 + 2.0 * phase).cos() * 0.4)
                    * amplitude;
                price *= 1.0 + daily_drift + noise;
                PricePoint::new(start + Duration::days(i as i64), price)
            })
            .collect()
    }
}
