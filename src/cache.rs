//! Staleness-aware field cache in front of the market data gateway.
//!
//! Every attribute of an asset is cached as its own field with its own refresh
//! timestamp and TTL class, so a fresh price never hides stale metadata and vice
//! versa. Reads are two-phase:
//!
//! 1. [`FieldCache::check`] classifies the stored value as fresh, stale or missing
//!    without touching the gateway.
//! 2. [`FieldCache::refresh`] fetches a replacement. Concurrent refreshes of the same
//!    symbol and field share one in-flight fetch. Transient gateway failures are
//!    retried with exponential backoff. If the fetch still fails, a prior value is
//!    served flagged stale; with no prior value the read fails with
//!    [`PortfolioError::DataUnavailable`].
//!
//! [`CacheManager`] builds [`AssetSnapshot`]s and per-run [`MarketSnapshot`]s on top of
//! the field cache.

use crate::config::{CacheSettings, EngineConfig, RiskSettings};
use crate::error::{PortfolioError, Result};
use crate::gateway::{MarketDataGateway, RISK_FREE_SYMBOL, USD_JPY_SYMBOL};
use crate::risk::{RiskCalculator, RiskMetrics};
use crate::types::{AssetMetadata, Currency, PricePoint};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

pub const FIELD_PRICE: &str = "price";
pub const FIELD_METADATA: &str = "metadata";
pub const FIELD_HISTORY: &str = "history";
pub const FIELD_RISK_METRICS: &str = "risk_metrics";
pub const FIELD_RATE: &str = "rate";

/// TTL class of a cached field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldClass {
    /// Names, sectors, currencies. Changes rarely.
    Metadata,
    /// Volatility, Sharpe and market rates.
    RiskMetrics,
    /// Daily price histories; shares the risk-metrics TTL.
    History,
    /// Latest quotes.
    Price,
}

impl FieldClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldClass::Metadata => "metadata",
            FieldClass::RiskMetrics => "risk_metrics",
            FieldClass::History => "history",
            FieldClass::Price => "price",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "metadata" => Some(FieldClass::Metadata),
            "risk_metrics" => Some(FieldClass::RiskMetrics),
            "history" => Some(FieldClass::History),
            "price" => Some(FieldClass::Price),
            _ => None,
        }
    }
}

impl fmt::Display for FieldClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed value held by a cached field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Number(f64),
    Text(String),
    Metadata(AssetMetadata),
    Series(Vec<PricePoint>),
    Metrics(RiskMetrics),
}

impl FieldValue {
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Number(_) => "number",
            FieldValue::Text(_) => "text",
            FieldValue::Metadata(_) => "metadata",
            FieldValue::Series(_) => "series",
            FieldValue::Metrics(_) => "metrics",
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_metadata(&self) -> Option<&AssetMetadata> {
        match self {
            FieldValue::Metadata(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_series(&self) -> Option<&[PricePoint]> {
        match self {
            FieldValue::Series(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_metrics(&self) -> Option<&RiskMetrics> {
        match self {
            FieldValue::Metrics(m) => Some(m),
            _ => None,
        }
    }

    /// One-line description for listings.
    pub fn summary(&self) -> String {
        match self {
            FieldValue::Number(v) => format!("{:.4}", v),
            FieldValue::Text(t) => t.clone(),
            FieldValue::Metadata(m) => m.name.clone(),
            FieldValue::Series(s) => format!("{} points", s.len()),
            FieldValue::Metrics(m) => format!("vol {:.2}%", m.volatility * 100.0),
        }
    }
}

/// One cached attribute of one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedField {
    pub symbol: String,
    pub field: String,
    pub class: FieldClass,
    pub value: FieldValue,
    pub refreshed_at: DateTime<Utc>,
}

impl CachedField {
    pub fn new(
        symbol: impl Into<String>,
        field: impl Into<String>,
        class: FieldClass,
        value: FieldValue,
        refreshed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            field: field.into(),
            class,
            value,
            refreshed_at,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.refreshed_at
    }

    /// Fresh iff `now - refreshed_at < ttl(class)`.
    pub fn is_fresh(&self, settings: &CacheSettings, now: DateTime<Utc>) -> bool {
        self.age(now) < settings.ttl(self.class)
    }
}

/// Result of the check phase.
#[derive(Debug, Clone, PartialEq)]
pub enum Freshness {
    Fresh(CachedField),
    Stale(CachedField),
    Missing,
}

/// A value returned by the cache, with its staleness annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct Served {
    pub field: CachedField,
    /// Set when a refresh failed and the prior value was returned instead.
    pub stale: bool,
}

impl Served {
    pub fn value(&self) -> &FieldValue {
        &self.field.value
    }

    pub fn status(&self) -> FieldStatus {
        FieldStatus {
            refreshed_at: self.field.refreshed_at,
            stale: self.stale,
        }
    }
}

/// Staleness annotation carried into snapshots and reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldStatus {
    pub refreshed_at: DateTime<Utc>,
    pub stale: bool,
}

/// Persistence for cached fields.
///
/// Implementations must serialize writers to the same symbol and field.
pub trait CacheStore: Send + Sync {
    fn load(&self, symbol: &str, field: &str) -> Result<Option<CachedField>>;

    fn save(&self, field: &CachedField) -> Result<()>;

    /// Remove every field of a symbol; returns the number removed.
    fn remove_symbol(&self, symbol: &str) -> Result<usize>;

    /// Remove fields of `class` refreshed before `cutoff`.
    fn purge_older_than(&self, class: FieldClass, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Every stored field, ordered by symbol then field.
    fn entries(&self) -> Result<Vec<CachedField>>;
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryStore {
    fields: RwLock<HashMap<(String, String), CachedField>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryStore {
    fn load(&self, symbol: &str, field: &str) -> Result<Option<CachedField>> {
        Ok(self
            .fields
            .read()
            .get(&(symbol.to_string(), field.to_string()))
            .cloned())
    }

    fn save(&self, field: &CachedField) -> Result<()> {
        self.fields.write().insert(
            (field.symbol.clone(), field.field.clone()),
            field.clone(),
        );
        Ok(())
    }

    fn remove_symbol(&self, symbol: &str) -> Result<usize> {
        let mut fields = self.fields.write();
        let before = fields.len();
        fields.retain(|(s, _), _| s != symbol);
        Ok(before - fields.len())
    }

    fn purge_older_than(&self, class: FieldClass, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut fields = self.fields.write();
        let before = fields.len();
        fields.retain(|_, f| !(f.class == class && f.refreshed_at < cutoff));
        Ok(before - fields.len())
    }

    fn entries(&self) -> Result<Vec<CachedField>> {
        let mut entries: Vec<CachedField> = self.fields.read().values().cloned().collect();
        entries.sort_by(|a, b| (&a.symbol, &a.field).cmp(&(&b.symbol, &b.field)));
        Ok(entries)
    }
}

type FieldKey = (String, String);
type Outcome = std::result::Result<Served, String>;

#[derive(Default)]
struct InFlight {
    outcome: Mutex<Option<Outcome>>,
    ready: Condvar,
}

/// Publishes the leader's outcome to waiting readers, even if the fetch panics.
struct LeaderSlot<'a> {
    cache: &'a FieldCache,
    key: FieldKey,
    slot: Arc<InFlight>,
    published: bool,
}

impl LeaderSlot<'_> {
    fn publish(&mut self, outcome: Outcome) {
        *self.slot.outcome.lock() = Some(outcome);
        self.slot.ready.notify_all();
        self.published = true;
        self.cache.in_flight.lock().remove(&self.key);
    }
}

impl Drop for LeaderSlot<'_> {
    fn drop(&mut self) {
        if !self.published {
            self.publish(Err("refresh aborted".to_string()));
        }
    }
}

/// Field-level cache with TTL classes, retry, request coalescing and stale fallback.
pub struct FieldCache {
    store: Arc<dyn CacheStore>,
    settings: CacheSettings,
    in_flight: Mutex<HashMap<FieldKey, Arc<InFlight>>>,
}

impl FieldCache {
    pub fn new(store: Arc<dyn CacheStore>, settings: CacheSettings) -> Self {
        Self {
            store,
            settings,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Classify the stored value without fetching.
    pub fn check(
        &self,
        symbol: &str,
        field: &str,
        class: FieldClass,
        now: DateTime<Utc>,
    ) -> Result<Freshness> {
        Ok(match self.store.load(symbol, field)? {
            Some(cached) if cached.age(now) < self.settings.ttl(class) => Freshness::Fresh(cached),
            Some(cached) => Freshness::Stale(cached),
            None => Freshness::Missing,
        })
    }

    /// Read a field, refreshing through `fetch` when it is stale or missing.
    pub fn get<F>(&self, symbol: &str, field: &str, class: FieldClass, fetch: F) -> Result<Served>
    where
        F: Fn() -> Result<FieldValue>,
    {
        self.get_at(symbol, field, class, Utc::now(), false, fetch)
    }

    /// [`FieldCache::get`] at an explicit time; `force` skips the freshness check.
    pub fn get_at<F>(
        &self,
        symbol: &str,
        field: &str,
        class: FieldClass,
        now: DateTime<Utc>,
        force: bool,
        fetch: F,
    ) -> Result<Served>
    where
        F: Fn() -> Result<FieldValue>,
    {
        if !force {
            if let Freshness::Fresh(cached) = self.check(symbol, field, class, now)? {
                debug!("Cache hit {}:{}", symbol, field);
                return Ok(Served {
                    field: cached,
                    stale: false,
                });
            }
        }
        self.refresh(symbol, field, class, now, force, fetch)
    }

    /// Fetch a replacement value. Callers racing on the same key wait for the
    /// first caller's fetch and share its outcome.
    pub fn refresh<F>(
        &self,
        symbol: &str,
        field: &str,
        class: FieldClass,
        now: DateTime<Utc>,
        force: bool,
        fetch: F,
    ) -> Result<Served>
    where
        F: Fn() -> Result<FieldValue>,
    {
        let key: FieldKey = (symbol.to_string(), field.to_string());
        let (slot, leader) = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&key) {
                Some(slot) => (Arc::clone(slot), false),
                None => {
                    let slot = Arc::new(InFlight::default());
                    in_flight.insert(key.clone(), Arc::clone(&slot));
                    (slot, true)
                }
            }
        };

        if !leader {
            debug!("Joining in-flight refresh of {}:{}", symbol, field);
            let mut outcome = slot.outcome.lock();
            loop {
                if let Some(done) = outcome.as_ref() {
                    return match done {
                        Ok(served) => Ok(served.clone()),
                        Err(reason) => Err(PortfolioError::unavailable(symbol, reason.clone())),
                    };
                }
                slot.ready.wait(&mut outcome);
            }
        }

        let mut guard = LeaderSlot {
            cache: self,
            key,
            slot,
            published: false,
        };
        let result = self.refresh_as_leader(symbol, field, class, now, force, &fetch);
        guard.publish(match &result {
            Ok(served) => Ok(served.clone()),
            Err(PortfolioError::DataUnavailable { reason, .. }) => Err(reason.clone()),
            Err(e) => Err(e.to_string()),
        });
        result
    }

    fn refresh_as_leader<F>(
        &self,
        symbol: &str,
        field: &str,
        class: FieldClass,
        now: DateTime<Utc>,
        force: bool,
        fetch: &F,
    ) -> Result<Served>
    where
        F: Fn() -> Result<FieldValue>,
    {
        let prior = self.store.load(symbol, field)?;

        // Another caller may have refreshed between our check and taking the slot.
        if !force {
            if let Some(cached) = &prior {
                if cached.age(now) < self.settings.ttl(class) {
                    return Ok(Served {
                        field: cached.clone(),
                        stale: false,
                    });
                }
            }
        }

        match self.fetch_with_retry(symbol, field, fetch) {
            Ok(value) => {
                let cached = CachedField::new(symbol, field, class, value, now);
                if let Err(e) = self.store.save(&cached) {
                    warn!("Failed to persist {}:{}: {}", symbol, field, e);
                }
                info!("Refreshed {}:{} ({})", symbol, field, class);
                Ok(Served {
                    field: cached,
                    stale: false,
                })
            }
            Err(e) => match prior {
                Some(cached) => {
                    warn!(
                        "Refresh of {}:{} failed ({}); serving value from {}",
                        symbol, field, e, cached.refreshed_at
                    );
                    Ok(Served {
                        field: cached,
                        stale: true,
                    })
                }
                None => Err(PortfolioError::unavailable(
                    symbol,
                    format!("{}: {}", field, e),
                )),
            },
        }
    }

    fn fetch_with_retry<F>(&self, symbol: &str, field: &str, fetch: &F) -> Result<FieldValue>
    where
        F: Fn() -> Result<FieldValue>,
    {
        let mut attempt: u32 = 0;
        loop {
            match fetch() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.settings.max_retries => {
                    let backoff = self.settings.retry_backoff() * 2u32.saturating_pow(attempt);
                    warn!(
                        "Transient failure fetching {}:{} (attempt {}): {}; retrying in {:?}",
                        symbol,
                        field,
                        attempt + 1,
                        e,
                        backoff
                    );
                    thread::sleep(backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drop every field of a symbol.
    pub fn invalidate(&self, symbol: &str) -> Result<usize> {
        let removed = self.store.remove_symbol(symbol)?;
        info!("Invalidated {} cached fields for {}", removed, symbol);
        Ok(removed)
    }

    /// Drop price fields older than the price TTL times the expiry multiplier.
    pub fn clear_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let hours = self.settings.price_ttl_hours * self.settings.expired_price_multiplier;
        let cutoff = now - Duration::milliseconds((hours * 3_600_000.0) as i64);
        let removed = self.store.purge_older_than(FieldClass::Price, cutoff)?;
        debug!("Purged {} expired price fields", removed);
        Ok(removed)
    }
}

/// A market rate with its provenance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateQuote {
    pub value: f64,
    pub stale: bool,
    /// The configured default was used because no value could be obtained.
    pub assumed: bool,
}

/// Everything known about one asset at one point in time.
///
/// Immutable once built; shared across threads behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetSnapshot {
    pub symbol: String,
    /// Latest price in `currency`.
    pub price: f64,
    pub currency: Currency,
    pub volatility: f64,
    /// `None` when the return series has zero variance.
    pub sharpe: Option<f64>,
    pub annual_return: f64,
    #[serde(skip_serializing)]
    pub history: Vec<PricePoint>,
    pub metadata: AssetMetadata,
    /// Refresh time and staleness per field.
    pub fields: BTreeMap<String, FieldStatus>,
}

impl AssetSnapshot {
    pub fn is_stale(&self) -> bool {
        self.fields.values().any(|f| f.stale)
    }

    pub fn stale_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(_, f)| f.stale)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn returns(&self) -> Vec<f64> {
        RiskCalculator::history_returns(&self.history)
    }
}

/// Consistent read-set for one computation.
#[derive(Debug, Clone, Serialize)]
pub struct MarketSnapshot {
    pub taken_at: DateTime<Utc>,
    pub assets: BTreeMap<String, Arc<AssetSnapshot>>,
    /// Symbols that could not be resolved, with the reason.
    pub failures: BTreeMap<String, String>,
    pub risk_free_rate: RateQuote,
    pub usd_jpy: RateQuote,
}

impl MarketSnapshot {
    pub fn get(&self, symbol: &str) -> Option<&AssetSnapshot> {
        self.assets.get(symbol).map(|a| a.as_ref())
    }

    /// `SYMBOL.field` for every stale value served, including market rates.
    pub fn stale_fields(&self) -> Vec<String> {
        let mut stale: Vec<String> = self
            .assets
            .values()
            .flat_map(|a| {
                a.stale_fields()
                    .into_iter()
                    .map(move |f| format!("{}.{}", a.symbol, f))
            })
            .collect();
        if self.risk_free_rate.stale {
            stale.push(format!("{}.{}", RISK_FREE_SYMBOL, FIELD_RATE));
        }
        if self.usd_jpy.stale {
            stale.push(format!("{}.{}", USD_JPY_SYMBOL, FIELD_PRICE));
        }
        stale
    }

    /// Latest prices keyed by symbol.
    pub fn prices(&self) -> BTreeMap<String, f64> {
        self.assets
            .iter()
            .map(|(s, a)| (s.clone(), a.price))
            .collect()
    }
}

/// Whether `metrics` were derived from the history refreshed at `history_at`.
/// Compared at millisecond precision, the resolution of persisted timestamps.
fn computed_from(metrics: &RiskMetrics, history_at: DateTime<Utc>) -> bool {
    metrics
        .history_refreshed_at
        .map_or(false, |t| t.timestamp_millis() == history_at.timestamp_millis())
}

/// Asset-level reads over a [`FieldCache`] and a gateway.
pub struct CacheManager {
    cache: FieldCache,
    gateway: Arc<dyn MarketDataGateway>,
    calculator: RiskCalculator,
    risk: RiskSettings,
}

impl CacheManager {
    pub fn new(
        gateway: Arc<dyn MarketDataGateway>,
        store: Arc<dyn CacheStore>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            cache: FieldCache::new(store, config.cache.clone()),
            gateway,
            calculator: RiskCalculator::from_settings(&config.risk),
            risk: config.risk.clone(),
        }
    }

    /// Manager backed by a process-local [`MemoryStore`].
    pub fn in_memory(gateway: Arc<dyn MarketDataGateway>, config: &EngineConfig) -> Self {
        Self::new(gateway, Arc::new(MemoryStore::new()), config)
    }

    pub fn field_cache(&self) -> &FieldCache {
        &self.cache
    }

    pub fn calculator(&self) -> &RiskCalculator {
        &self.calculator
    }

    pub fn price(&self, symbol: &str, force: bool) -> Result<Served> {
        self.cache
            .get_at(symbol, FIELD_PRICE, FieldClass::Price, Utc::now(), force, || {
                let price = self.gateway.fetch_price(symbol)?;
                if !(price.is_finite() && price > 0.0) {
                    return Err(PortfolioError::unavailable(
                        symbol,
                        format!("gateway returned invalid price {}", price),
                    ));
                }
                Ok(FieldValue::Number(price))
            })
    }

    pub fn metadata(&self, symbol: &str, force: bool) -> Result<Served> {
        self.cache.get_at(
            symbol,
            FIELD_METADATA,
            FieldClass::Metadata,
            Utc::now(),
            force,
            || Ok(FieldValue::Metadata(self.gateway.fetch_metadata(symbol)?)),
        )
    }

    pub fn history(&self, symbol: &str, force: bool) -> Result<Served> {
        let period = self.cache.settings().history_period.clone();
        self.cache.get_at(
            symbol,
            FIELD_HISTORY,
            FieldClass::History,
            Utc::now(),
            force,
            || {
                let history = self.gateway.fetch_history(symbol, &period)?;
                if history.is_empty() {
                    return Err(PortfolioError::unavailable(symbol, "empty price history"));
                }
                Ok(FieldValue::Series(history))
            },
        )
    }

    /// Annual risk-free rate; the configured default when never obtainable.
    pub fn risk_free_rate(&self, force: bool) -> RateQuote {
        let served = self.cache.get_at(
            RISK_FREE_SYMBOL,
            FIELD_RATE,
            FieldClass::RiskMetrics,
            Utc::now(),
            force,
            || {
                let rate = self.gateway.fetch_risk_free_rate()?;
                if !rate.is_finite() {
                    return Err(PortfolioError::unavailable(RISK_FREE_SYMBOL, "non-finite rate"));
                }
                Ok(FieldValue::Number(rate))
            },
        );
        self.rate_quote(served, self.risk.default_risk_free_rate, RISK_FREE_SYMBOL)
    }

    /// Yen per US dollar; the configured default when never obtainable.
    pub fn exchange_rate(&self, force: bool) -> RateQuote {
        let served = self.cache.get_at(
            USD_JPY_SYMBOL,
            FIELD_PRICE,
            FieldClass::Price,
            Utc::now(),
            force,
            || {
                let rate = self.gateway.fetch_exchange_rate()?;
                if !(rate.is_finite() && rate > 0.0) {
                    return Err(PortfolioError::unavailable(
                        USD_JPY_SYMBOL,
                        format!("invalid exchange rate {}", rate),
                    ));
                }
                Ok(FieldValue::Number(rate))
            },
        );
        self.rate_quote(served, self.risk.default_usd_jpy, USD_JPY_SYMBOL)
    }

    fn rate_quote(&self, served: Result<Served>, default: f64, symbol: &str) -> RateQuote {
        match served {
            Ok(s) => match s.value().as_number() {
                Some(value) => RateQuote {
                    value,
                    stale: s.stale,
                    assumed: false,
                },
                None => {
                    warn!("Cached {} is not a number; using default {}", symbol, default);
                    RateQuote {
                        value: default,
                        stale: false,
                        assumed: true,
                    }
                }
            },
            Err(e) => {
                warn!("{} unavailable ({}); using default {}", symbol, e, default);
                RateQuote {
                    value: default,
                    stale: false,
                    assumed: true,
                }
            }
        }
    }

    /// Assemble a snapshot for one asset. Price and history are required; missing
    /// metadata degrades to the bare symbol.
    pub fn get_asset_snapshot(&self, symbol: &str, force_refresh: bool) -> Result<AssetSnapshot> {
        let price = self.price(symbol, force_refresh)?;
        let history = self.history(symbol, force_refresh)?;
        let series = history
            .value()
            .as_series()
            .ok_or_else(|| PortfolioError::unavailable(symbol, "cached history has wrong type"))?;
        let price_value = price
            .value()
            .as_number()
            .ok_or_else(|| PortfolioError::unavailable(symbol, "cached price has wrong type"))?;

        let mut fields = BTreeMap::new();
        fields.insert(FIELD_PRICE.to_string(), price.status());
        fields.insert(FIELD_HISTORY.to_string(), history.status());

        let metadata = match self.metadata(symbol, force_refresh) {
            Ok(served) => {
                fields.insert(FIELD_METADATA.to_string(), served.status());
                served
                    .value()
                    .as_metadata()
                    .cloned()
                    .unwrap_or_else(|| AssetMetadata::named(symbol))
            }
            Err(e) => {
                warn!("Metadata for {} unavailable: {}", symbol, e);
                AssetMetadata::named(symbol)
            }
        };

        let rf = self.risk_free_rate(false);
        let history_at = history.field.refreshed_at;
        let compute = || {
            let mut metrics = self.calculator.metrics(symbol, series, rf.value);
            metrics.history_refreshed_at = Some(history_at);
            Ok(FieldValue::Metrics(metrics))
        };
        let mut metrics = self.cache.get_at(
            symbol,
            FIELD_RISK_METRICS,
            FieldClass::RiskMetrics,
            Utc::now(),
            force_refresh,
            &compute,
        )?;
        let matches_history = metrics
            .value()
            .as_metrics()
            .map_or(false, |m| computed_from(m, history_at));
        if !matches_history {
            debug!("Risk metrics for {} predate its history; recomputing", symbol);
            metrics = self.cache.get_at(
                symbol,
                FIELD_RISK_METRICS,
                FieldClass::RiskMetrics,
                Utc::now(),
                true,
                &compute,
            )?;
        }
        fields.insert(FIELD_RISK_METRICS.to_string(), metrics.status());
        let computed;
        let risk = match metrics.value().as_metrics() {
            Some(m) if computed_from(m, history_at) => m,
            _ => {
                computed = self.calculator.metrics(symbol, series, rf.value);
                &computed
            }
        };

        Ok(AssetSnapshot {
            symbol: symbol.to_string(),
            price: price_value,
            currency: Currency::for_symbol(symbol),
            volatility: risk.volatility,
            sharpe: risk.sharpe,
            annual_return: risk.annual_return,
            history: series.to_vec(),
            metadata,
            fields,
        })
    }

    /// Refresh every field of a symbol regardless of freshness.
    pub fn force_refresh(&self, symbol: &str) -> Result<AssetSnapshot> {
        self.get_asset_snapshot(symbol, true)
    }

    pub fn invalidate(&self, symbol: &str) -> Result<usize> {
        self.cache.invalidate(symbol)
    }

    pub fn clear_expired(&self) -> Result<usize> {
        self.cache.clear_expired(Utc::now())
    }

    pub fn entries(&self) -> Result<Vec<CachedField>> {
        self.cache.store().entries()
    }

    /// Read a consistent set of assets and market rates for one run.
    pub fn snapshot(&self, symbols: &[String], force_refresh: bool) -> MarketSnapshot {
        self.snapshot_with(symbols, force_refresh, |_| {})
    }

    /// [`CacheManager::snapshot`] calling `on_asset` after each symbol resolves.
    pub fn snapshot_with<P>(
        &self,
        symbols: &[String],
        force_refresh: bool,
        on_asset: P,
    ) -> MarketSnapshot
    where
        P: Fn(&str),
    {
        let risk_free_rate = self.risk_free_rate(force_refresh);
        let usd_jpy = self.exchange_rate(force_refresh);

        let mut assets = BTreeMap::new();
        let mut failures = BTreeMap::new();
        for symbol in symbols {
            if assets.contains_key(symbol) || failures.contains_key(symbol) {
                continue;
            }
            match self.get_asset_snapshot(symbol, force_refresh) {
                Ok(snapshot) => {
                    assets.insert(symbol.clone(), Arc::new(snapshot));
                }
                Err(e) => {
                    warn!("Excluding {} from snapshot: {}", symbol, e);
                    failures.insert(symbol.clone(), e.to_string());
                }
            }
            on_asset(symbol);
        }

        MarketSnapshot {
            taken_at: Utc::now(),
            assets,
            failures,
            risk_free_rate,
            usd_jpy,
        }
    }
}
