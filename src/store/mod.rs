use chrono::NaiveDate;
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::errors::{DataHubError, Result};
use crate::models::price::{base_ticker, LatestQuote, PriceBar};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS prices (
    symbol     TEXT NOT NULL,
    date       TEXT NOT NULL,
    open       REAL,
    high       REAL,
    low        REAL,
    close      REAL,
    volume     REAL,
    market_cap REAL,
    PRIMARY KEY(symbol, date)
);
"#;

const INDEX_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_prices_symbol_date_desc ON prices(symbol, date DESC);
CREATE INDEX IF NOT EXISTS idx_prices_market_cap ON prices(market_cap DESC);
"#;

const INSERT_SQL: &str = r#"
INSERT OR IGNORE INTO prices (symbol, date, open, high, low, close, volume)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
"#;

const UPDATE_CAP_SQL: &str = r#"
UPDATE prices
SET market_cap = ?1
WHERE symbol = ?2
  AND date = (SELECT MAX(date) FROM prices WHERE symbol = ?2)
"#;

const LATEST_QUOTES_SQL: &str = r#"
WITH latest_date AS (
    SELECT symbol, MAX(date) AS max_date
    FROM prices
    GROUP BY symbol
)
SELECT
    p.symbol,
    p.date,
    p.close,
    p.volume,
    p.market_cap,
    (
        SELECT p2.close
        FROM prices p2
        WHERE p2.symbol = p.symbol
          AND p2.date < p.date
        ORDER BY p2.date DESC
        LIMIT 1
    ) AS prev_close
FROM prices p
JOIN latest_date t ON p.symbol = t.symbol AND p.date = t.max_date
WHERE ?1 IS NULL OR lower(p.symbol) LIKE ?1
ORDER BY (p.market_cap IS NULL) ASC, p.market_cap DESC, p.volume DESC, p.symbol ASC
LIMIT ?2 OFFSET ?3
"#;

fn update_cap_chunk(conn: &mut Connection, chunk: &[(String, f64)]) -> Result<usize> {
    let tx = conn.transaction()?;
    let mut updated = 0;
    {
        let mut stmt = tx.prepare_cached(UPDATE_CAP_SQL)?;
        for (symbol, cap) in chunk {
            updated += stmt.execute(params![cap, symbol])?;
        }
    }
    tx.commit()?;
    Ok(updated)
}

/// 价格表，所有写入经由单写入者或市值批量更新
pub struct PriceStore {
    conn: Mutex<Connection>,
}

impl PriceStore {
    /// Open (or create) the store file and tune it for one writer plus readers.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let open_err = |e: rusqlite::Error| DataHubError::SchemaError(format!("cannot open {}: {}", path.display(), e));
        let conn = Connection::open(path).map_err(open_err)?;

        // WAL 允许读写并发，busy_timeout 让写入在锁冲突时短暂等待
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(open_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(open_err)?;

        debug!("Opened price store at {}", path.display());
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| DataHubError::SchemaError(e.to_string()))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| DataHubError::SchemaError("price store lock poisoned".to_string()))
    }

    /// Create the price table and its indexes. Safe to run repeatedly; older
    /// tables without a `market_cap` column are migrated in place.
    pub fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        let schema_err = |e: rusqlite::Error| DataHubError::SchemaError(e.to_string());

        conn.execute_batch(SCHEMA_SQL).map_err(schema_err)?;

        let columns: Vec<String> = conn
            .prepare("PRAGMA table_info(prices)")
            .map_err(schema_err)?
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(schema_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(schema_err)?;

        if !columns.iter().any(|c| c == "market_cap") {
            conn.execute("ALTER TABLE prices ADD COLUMN market_cap REAL", [])
                .map_err(schema_err)?;
            info!("Added market_cap column to prices table");
        }

        conn.execute_batch(INDEX_SQL).map_err(schema_err)?;
        Ok(())
    }

    /// 某交易对已存储的最大日期
    pub fn get_last_date(&self, symbol: &str) -> Result<Option<NaiveDate>> {
        let conn = self.conn()?;
        let last = conn.query_row(
            "SELECT MAX(date) FROM prices WHERE symbol = ?1",
            params![symbol],
            |row| row.get::<_, Option<NaiveDate>>(0),
        )?;
        Ok(last)
    }

    /// Insert bars whose `(symbol, date)` is absent; existing rows are left
    /// untouched. Returns the number of rows actually inserted.
    pub fn insert_ignoring_duplicates(&self, rows: &[PriceBar]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(INSERT_SQL)?;
            for bar in rows {
                inserted += stmt.execute(params![
                    bar.symbol,
                    bar.date,
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                ])?;
            }
        }
        tx.commit()?;

        debug!("Inserted {} of {} rows", inserted, rows.len());
        Ok(inserted)
    }

    /// Set `market_cap` on each symbol's most recent row only. Work is split
    /// into chunks of `chunk_size`, each committed on its own; a failing chunk
    /// is rolled back and skipped. Returns the number of rows updated by the
    /// chunks that committed.
    pub fn update_latest_caps(&self, caps: &[(String, f64)], chunk_size: usize) -> Result<usize> {
        if caps.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let mut updated = 0;

        for (index, chunk) in caps.chunks(chunk_size.max(1)).enumerate() {
            match update_cap_chunk(&mut conn, chunk) {
                Ok(n) => updated += n,
                Err(e) => warn!("Market cap chunk {} ({} symbols) rolled back: {}", index, chunk.len(), e),
            }
        }

        Ok(updated)
    }

    /// 某交易对全部日线，按日期升序
    pub fn prices_for(&self, symbol: &str) -> Result<Vec<PriceBar>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT symbol, date, open, high, low, close, volume, market_cap
             FROM prices WHERE symbol = ?1 ORDER BY date",
        )?;
        let bars = stmt
            .query_map(params![symbol], |row| {
                Ok(PriceBar {
                    symbol: row.get(0)?,
                    date: row.get(1)?,
                    open: row.get::<_, Option<f64>>(2)?.unwrap_or_default(),
                    high: row.get::<_, Option<f64>>(3)?.unwrap_or_default(),
                    low: row.get::<_, Option<f64>>(4)?.unwrap_or_default(),
                    close: row.get::<_, Option<f64>>(5)?.unwrap_or_default(),
                    volume: row.get::<_, Option<f64>>(6)?.unwrap_or_default(),
                    market_cap: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(bars)
    }

    /// Latest row per symbol ranked by market cap (nulls last), then volume,
    /// then symbol. `query` filters case-insensitively on the symbol.
    pub fn latest_quotes(&self, limit: usize, offset: usize, query: Option<&str>) -> Result<Vec<LatestQuote>> {
        let pattern = query
            .map(|q| q.trim().to_lowercase())
            .filter(|q| !q.is_empty())
            .map(|q| format!("%{}%", q));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(LATEST_QUOTES_SQL)?;
        let rows = stmt
            .query_map(params![pattern, limit as i64, offset as i64], |row| {
                let symbol: String = row.get(0)?;
                let price = row.get::<_, Option<f64>>(2)?.unwrap_or_default();
                let prev_close: Option<f64> = row.get(5)?;
                Ok(LatestQuote {
                    rank: 0,
                    name: base_ticker(&symbol).to_string(),
                    symbol,
                    date: row.get(1)?,
                    price,
                    change_pct: prev_close
                        .filter(|prev| *prev != 0.0)
                        .map(|prev| (price - prev) / prev * 100.0),
                    volume: row.get::<_, Option<f64>>(3)?.unwrap_or_default(),
                    market_cap: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, quote)| LatestQuote { rank: offset + i + 1, ..quote })
            .collect())
    }

    /// Most recent date across the whole table.
    pub fn latest_date(&self) -> Result<Option<NaiveDate>> {
        let conn = self.conn()?;
        let date = conn
            .query_row("SELECT MAX(date) FROM prices", [], |row| row.get::<_, Option<NaiveDate>>(0))
            .optional()?
            .flatten();
        Ok(date)
    }

    pub fn count_rows(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM prices", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
