use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 报价货币后缀，只接受美元交易对
pub const QUOTE_SUFFIX: &str = "-USD";

/// 已校验的交易对代码，例如 `BTC-USD`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    /// Validate a raw listing ticker. The base asset must be non-empty and
    /// purely alphabetic, and the ticker must carry the USD quote suffix.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let base = raw.strip_suffix(QUOTE_SUFFIX)?.trim();
        if base.is_empty() || !base.chars().all(|c| c.is_alphabetic()) {
            return None;
        }
        Some(Self(format!("{}{}", base, QUOTE_SUFFIX)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base asset component, e.g. `BTC` for `BTC-USD`.
    pub fn base(&self) -> &str {
        base_ticker(&self.0)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Symbol {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Symbol::parse(&value).ok_or_else(|| format!("invalid symbol: {}", value))
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        symbol.0
    }
}

/// Part of a full ticker before the first `-`.
pub fn base_ticker(full: &str) -> &str {
    full.split('-').next().unwrap_or(full).trim()
}

/// 日线数据，(symbol, date) 唯一
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceBar {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub market_cap: Option<f64>,
}

/// 下载任务，每次运行时构造
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadJob {
    pub symbol: Symbol,
    pub last_date: Option<NaiveDate>,
}

impl DownloadJob {
    pub fn new(symbol: Symbol, last_date: Option<NaiveDate>) -> Self {
        Self { symbol, last_date }
    }
}

/// Half-open `[start, end)` range of calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl FetchWindow {
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days().max(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketCapSample {
    /// lowercase base ticker
    pub ticker: String,
    pub cap_usd: f64,
}

/// Aligned parallel arrays as returned by the chart endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawChart {
    pub timestamps: Vec<i64>,
    pub open: Vec<Option<f64>>,
    pub high: Vec<Option<f64>>,
    pub low: Vec<Option<f64>>,
    pub close: Vec<Option<f64>>,
    pub volume: Vec<Option<f64>>,
}

/// Latest row per symbol, as ranked for the serving layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestQuote {
    pub rank: usize,
    pub symbol: String,
    pub name: String,
    pub date: NaiveDate,
    pub price: f64,
    pub change_pct: Option<f64>,
    pub volume: f64,
    pub market_cap: Option<f64>,
}
