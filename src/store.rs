//! SQLite persistence for cached fields, portfolios and valuation history.
//!
//! Each operation opens its own connection with a busy timeout, so several
//! processes can share one database file. Writes that touch more than one row run
//! in a transaction.

use crate::cache::{CacheStore, CachedField, FieldClass, FieldValue};
use crate::error::{PortfolioError, Result};
use crate::portfolio::Portfolio;
use crate::types::{Currency, Holding};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS cached_fields (
        symbol TEXT NOT NULL,
        field TEXT NOT NULL,
        class TEXT NOT NULL,
        value_json TEXT NOT NULL,
        refreshed_at_ms INTEGER NOT NULL,
        PRIMARY KEY (symbol, field)
    )",
    "CREATE INDEX IF NOT EXISTS idx_cached_fields_class ON cached_fields(class, refreshed_at_ms)",
    "CREATE TABLE IF NOT EXISTS portfolios (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        description TEXT NOT NULL DEFAULT '',
        base_currency TEXT NOT NULL DEFAULT 'USD',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS holdings (
        portfolio_id INTEGER NOT NULL REFERENCES portfolios(id) ON DELETE CASCADE,
        symbol TEXT NOT NULL,
        shares REAL NOT NULL,
        PRIMARY KEY (portfolio_id, symbol)
    )",
    "CREATE TABLE IF NOT EXISTS portfolio_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        portfolio_id INTEGER NOT NULL REFERENCES portfolios(id) ON DELETE CASCADE,
        snapshot_date TEXT NOT NULL,
        total_value_usd REAL NOT NULL,
        total_value_jpy REAL NOT NULL,
        usd_jpy_rate REAL NOT NULL,
        holdings_json TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_history_date ON portfolio_history(portfolio_id, snapshot_date)",
];

fn open_connection(db_path: &str) -> Result<Connection> {
    let conn = Connection::open(db_path).map_err(|e| {
        PortfolioError::DatabaseError(format!("Failed to open database {}: {}", db_path, e))
    })?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

fn init_schema(db_path: &str) -> Result<()> {
    let conn = open_connection(db_path)?;
    for sql in SCHEMA {
        conn.execute(sql, []).map_err(|e| {
            PortfolioError::DatabaseError(format!("Failed to create schema: {}", e))
        })?;
    }
    Ok(())
}

/// Unreadable timestamps load as the Unix epoch, so the row reads as stale.
fn unreadable_timestamp(raw: &str) -> DateTime<Utc> {
    warn!("Unreadable timestamp '{}' in store; treating as epoch", raw);
    DateTime::<Utc>::default()
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| unreadable_timestamp(&ms.to_string()))
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| unreadable_timestamp(s))
}

/// [`CacheStore`] backed by a SQLite file.
pub struct SqliteStore {
    db_path: String,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db_path = path.as_ref().display().to_string();
        init_schema(&db_path)?;
        info!("Opened cache store at {}", db_path);
        Ok(Self { db_path })
    }

    fn connect(&self) -> Result<Connection> {
        open_connection(&self.db_path)
    }

    fn row_to_field(row: &rusqlite::Row) -> rusqlite::Result<(String, String, String, String, i64)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    }

    fn decode(
        (symbol, field, class, value_json, refreshed_at_ms): (String, String, String, String, i64),
    ) -> Result<CachedField> {
        let class = FieldClass::parse(&class).ok_or_else(|| {
            PortfolioError::DatabaseError(format!("Unknown field class '{}'", class))
        })?;
        let value: FieldValue = serde_json::from_str(&value_json)?;
        Ok(CachedField::new(
            symbol,
            field,
            class,
            value,
            millis_to_datetime(refreshed_at_ms),
        ))
    }
}

impl CacheStore for SqliteStore {
    fn load(&self, symbol: &str, field: &str) -> Result<Option<CachedField>> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT symbol, field, class, value_json, refreshed_at_ms
                 FROM cached_fields WHERE symbol = ?1 AND field = ?2",
                params![symbol, field],
                Self::row_to_field,
            )
            .optional()?;
        row.map(Self::decode).transpose()
    }

    fn save(&self, field: &CachedField) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO cached_fields (symbol, field, class, value_json, refreshed_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                field.symbol,
                field.field,
                field.class.as_str(),
                serde_json::to_string(&field.value)?,
                field.refreshed_at.timestamp_millis(),
            ],
        )?;
        debug!("Persisted {}:{}", field.symbol, field.field);
        Ok(())
    }

    fn remove_symbol(&self, symbol: &str) -> Result<usize> {
        let conn = self.connect()?;
        Ok(conn.execute("DELETE FROM cached_fields WHERE symbol = ?1", params![symbol])?)
    }

    fn purge_older_than(&self, class: FieldClass, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.connect()?;
        Ok(conn.execute(
            "DELETE FROM cached_fields WHERE class = ?1 AND refreshed_at_ms < ?2",
            params![class.as_str(), cutoff.timestamp_millis()],
        )?)
    }

    fn entries(&self) -> Result<Vec<CachedField>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT symbol, field, class, value_json, refreshed_at_ms
             FROM cached_fields ORDER BY symbol, field",
        )?;
        let rows = stmt
            .query_map([], Self::row_to_field)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(Self::decode).collect()
    }
}

/// A recorded valuation of a portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub snapshot_date: DateTime<Utc>,
    pub total_value_usd: f64,
    pub total_value_jpy: f64,
    pub usd_jpy_rate: f64,
    /// Per-holding detail as recorded at the time.
    pub holdings: serde_json::Value,
}

/// Portfolio, holding and history persistence.
pub struct PortfolioManager {
    db_path: String,
}

impl PortfolioManager {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db_path = path.as_ref().display().to_string();
        init_schema(&db_path)?;
        Ok(Self { db_path })
    }

    fn connect(&self) -> Result<Connection> {
        open_connection(&self.db_path)
    }

    /// Create an empty portfolio. Names are unique.
    pub fn create(&self, name: &str, description: &str, base_currency: Currency) -> Result<Portfolio> {
        if self.get_by_name(name)?.is_some() {
            return Err(PortfolioError::InvalidInput(format!(
                "Portfolio '{}' already exists",
                name
            )));
        }
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO portfolios (name, description, base_currency, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![name, description, base_currency.code(), now],
        )?;
        let id = conn.last_insert_rowid();
        info!("Created portfolio {} (id {})", name, id);

        let mut portfolio = Portfolio::new(name).with_base_currency(base_currency);
        portfolio.id = Some(id);
        portfolio.description = description.to_string();
        Ok(portfolio)
    }

    pub fn get(&self, id: i64) -> Result<Option<Portfolio>> {
        let conn = self.connect()?;
        let header = conn
            .query_row(
                "SELECT id, name, description, base_currency FROM portfolios WHERE id = ?1",
                params![id],
                Self::row_to_header,
            )
            .optional()?;
        match header {
            Some(header) => Ok(Some(self.with_holdings(&conn, header)?)),
            None => Ok(None),
        }
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<Portfolio>> {
        let conn = self.connect()?;
        let header = conn
            .query_row(
                "SELECT id, name, description, base_currency FROM portfolios WHERE name = ?1",
                params![name],
                Self::row_to_header,
            )
            .optional()?;
        match header {
            Some(header) => Ok(Some(self.with_holdings(&conn, header)?)),
            None => Ok(None),
        }
    }

    /// All portfolios ordered by name, holdings included.
    pub fn list(&self) -> Result<Vec<Portfolio>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT id, name, description, base_currency FROM portfolios ORDER BY name")?;
        let headers = stmt
            .query_map([], Self::row_to_header)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        headers
            .into_iter()
            .map(|h| self.with_holdings(&conn, h))
            .collect()
    }

    /// Replace all holdings of a portfolio. Zero-share rows are skipped.
    pub fn set_holdings(&self, id: i64, holdings: &[Holding]) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let exists: Option<i64> = tx
            .query_row("SELECT id FROM portfolios WHERE id = ?1", params![id], |r| r.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(PortfolioError::InvalidInput(format!(
                "Portfolio {} not found",
                id
            )));
        }

        tx.execute("DELETE FROM holdings WHERE portfolio_id = ?1", params![id])?;
        {
            let mut insert = tx.prepare(
                "INSERT OR REPLACE INTO holdings (portfolio_id, symbol, shares) VALUES (?1, ?2, ?3)",
            )?;
            for holding in holdings.iter().filter(|h| h.shares > 0.0) {
                insert.execute(params![id, holding.symbol, holding.shares])?;
            }
        }
        tx.execute(
            "UPDATE portfolios SET updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        tx.commit()?;
        debug!("Stored {} holdings for portfolio {}", holdings.len(), id);
        Ok(())
    }

    /// Create or update a portfolio from a holdings CSV. The name defaults to the
    /// file stem.
    pub fn import_csv(&self, path: impl AsRef<Path>, name: Option<&str>) -> Result<Portfolio> {
        let loaded = Portfolio::load_csv(path.as_ref())?;
        let name = name.map(str::to_string).unwrap_or_else(|| loaded.name.clone());
        let existing = match self.get_by_name(&name)? {
            Some(p) => p,
            None => self.create(&name, &loaded.description, loaded.base_currency)?,
        };
        let id = existing
            .id
            .ok_or_else(|| PortfolioError::DatabaseError("Portfolio has no id".to_string()))?;
        self.set_holdings(id, &loaded.holdings())?;
        self.get(id)?
            .ok_or_else(|| PortfolioError::DatabaseError(format!("Portfolio {} vanished", id)))
    }

    /// Delete a portfolio with its holdings and history. Returns false if absent.
    pub fn delete(&self, id: i64) -> Result<bool> {
        let conn = self.connect()?;
        let removed = conn.execute("DELETE FROM portfolios WHERE id = ?1", params![id])?;
        if removed > 0 {
            info!("Deleted portfolio {}", id);
        }
        Ok(removed > 0)
    }

    pub fn add_history_snapshot(&self, id: i64, snapshot: &HistorySnapshot) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO portfolio_history
                (portfolio_id, snapshot_date, total_value_usd, total_value_jpy, usd_jpy_rate, holdings_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                snapshot.snapshot_date.to_rfc3339(),
                snapshot.total_value_usd,
                snapshot.total_value_jpy,
                snapshot.usd_jpy_rate,
                serde_json::to_string(&snapshot.holdings)?,
            ],
        )?;
        Ok(())
    }

    /// Snapshots from the last `days` days, oldest first.
    pub fn history(&self, id: i64, days: i64) -> Result<Vec<HistorySnapshot>> {
        let cutoff = Utc::now() - Duration::days(days);
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT snapshot_date, total_value_usd, total_value_jpy, usd_jpy_rate, holdings_json
             FROM portfolio_history WHERE portfolio_id = ?1 ORDER BY snapshot_date",
        )?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut snapshots = Vec::new();
        for (date, usd, jpy, rate, holdings_json) in rows {
            let snapshot_date = parse_timestamp(&date);
            if snapshot_date < cutoff {
                continue;
            }
            snapshots.push(HistorySnapshot {
                snapshot_date,
                total_value_usd: usd,
                total_value_jpy: jpy,
                usd_jpy_rate: rate,
                holdings: serde_json::from_str(&holdings_json)?,
            });
        }
        Ok(snapshots)
    }

    fn row_to_header(row: &rusqlite::Row) -> rusqlite::Result<(i64, String, String, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    }

    fn with_holdings(
        &self,
        conn: &Connection,
        (id, name, description, currency): (i64, String, String, String),
    ) -> Result<Portfolio> {
        let mut stmt = conn
            .prepare("SELECT symbol, shares FROM holdings WHERE portfolio_id = ?1 ORDER BY symbol")?;
        let holdings = stmt
            .query_map(params![id], |row| Ok(Holding::new(row.get::<_, String>(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut portfolio = Portfolio::from_holdings(name, holdings)?
            .with_base_currency(Currency::parse(&currency).unwrap_or_default());
        portfolio.id = Some(id);
        portfolio.description = description;
        Ok(portfolio)
    }
}

/// Database path from `SENA_DB`, else `~/.sena/sena.db`.
pub fn default_database_path() -> String {
    std::env::var("SENA_DB").unwrap_or_else(|_| {
        if let Some(home) = std::env::var_os("HOME") {
            format!("{}/.sena/sena.db", home.to_string_lossy())
        } else {
            "sena.db".to_string()
        }
    })
}

/// Create the parent directory of a database path if needed.
pub fn ensure_parent_dir(path: &str) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FIELD_PRICE;
    use crate::config::CacheSettings;
    use crate::types::{AssetMetadata, PricePoint};
    use chrono::NaiveDate;
    use tempfile::NamedTempFile;

    #[test]
    fn test_cached_field_roundtrip_keeps_type_and_time() {
        let file = NamedTempFile::new().unwrap();
        let store = SqliteStore::open(file.path()).unwrap();
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();

        let series = vec![PricePoint::new(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), 10.5)];
        store
            .save(&CachedField::new(
                "AAPL",
                "history",
                FieldClass::History,
                FieldValue::Series(series.clone()),
                at,
            ))
            .unwrap();

        let loaded = store.load("AAPL", "history").unwrap().unwrap();
        assert_eq!(loaded.class, FieldClass::History);
        assert_eq!(loaded.refreshed_at, at);
        assert_eq!(loaded.value.as_series().unwrap(), series.as_slice());
        assert!(store.load("AAPL", FIELD_PRICE).unwrap().is_none());
    }

    #[test]
    fn test_unreadable_refresh_time_loads_as_stale() {
        let file = NamedTempFile::new().unwrap();
        let store = SqliteStore::open(file.path()).unwrap();
        store
            .save(&CachedField::new(
                "AAPL",
                FIELD_PRICE,
                FieldClass::Price,
                FieldValue::Number(190.0),
                Utc::now(),
            ))
            .unwrap();
        Connection::open(file.path())
            .unwrap()
            .execute("UPDATE cached_fields SET refreshed_at_ms = ?1", params![i64::MAX])
            .unwrap();

        let loaded = store.load("AAPL", FIELD_PRICE).unwrap().unwrap();
        assert_eq!(loaded.refreshed_at.timestamp(), 0);
        assert!(!loaded.is_fresh(&CacheSettings::default(), Utc::now()));
        assert_eq!(parse_timestamp("not a date").timestamp(), 0);
    }

    #[test]
    fn test_store_upsert_remove_and_purge() {
        let file = NamedTempFile::new().unwrap();
        let store = SqliteStore::open(file.path()).unwrap();
        let old = Utc::now() - Duration::hours(5);

        store
            .save(&CachedField::new("A", FIELD_PRICE, FieldClass::Price, FieldValue::Number(1.0), old))
            .unwrap();
        store
            .save(&CachedField::new("A", FIELD_PRICE, FieldClass::Price, FieldValue::Number(2.0), old))
            .unwrap();
        store
            .save(&CachedField::new(
                "A",
                "metadata",
                FieldClass::Metadata,
                FieldValue::Metadata(AssetMetadata::named("A")),
                old,
            ))
            .unwrap();
        store
            .save(&CachedField::new("B", FIELD_PRICE, FieldClass::Price, FieldValue::Number(3.0), Utc::now()))
            .unwrap();

        assert_eq!(store.entries().unwrap().len(), 3);
        assert_eq!(
            store.load("A", FIELD_PRICE).unwrap().unwrap().value.as_number(),
            Some(2.0)
        );

        let purged = store
            .purge_older_than(FieldClass::Price, Utc::now() - Duration::hours(1))
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.remove_symbol("A").unwrap(), 1);
        assert_eq!(store.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_portfolio_lifecycle() {
        let file = NamedTempFile::new().unwrap();
        let manager = PortfolioManager::open(file.path()).unwrap();

        let p = manager.create("core", "long term", Currency::Jpy).unwrap();
        let id = p.id.unwrap();
        assert!(manager.create("core", "", Currency::Usd).is_err());

        manager
            .set_holdings(
                id,
                &[
                    Holding::new("AAPL", 10.0),
                    Holding::new("7203.T", 100.0),
                    Holding::new("MSFT", 0.0),
                ],
            )
            .unwrap();

        let loaded = manager.get_by_name("core").unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.base_currency, Currency::Jpy);
        assert_eq!(loaded.shares("AAPL"), Some(10.0));

        manager
            .add_history_snapshot(
                id,
                &HistorySnapshot {
                    snapshot_date: Utc::now(),
                    total_value_usd: 1000.0,
                    total_value_jpy: 150_000.0,
                    usd_jpy_rate: 150.0,
                    holdings: serde_json::json!({"AAPL": 10.0}),
                },
            )
            .unwrap();
        assert_eq!(manager.history(id, 30).unwrap().len(), 1);

        assert_eq!(manager.list().unwrap().len(), 1);
        assert!(manager.delete(id).unwrap());
        assert!(manager.get(id).unwrap().is_none());
        assert!(!manager.delete(id).unwrap());
    }
}
