use crate::errors::Result;
use crate::models::price::{MarketCapSample, Symbol};
use crate::scrapers::base::MarketCapSource;
use crate::store::PriceStore;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// 市值补充：分页获取市值，并写入每个交易对最新一行
pub struct MarketCapEnricher {
    source: Arc<dyn MarketCapSource + Send + Sync>,
    store: Arc<PriceStore>,
    attempts: u32,
    retry_unit: Duration,
    page_delay: Duration,
    chunk_size: usize,
}

impl MarketCapEnricher {
    pub fn new(source: Arc<dyn MarketCapSource + Send + Sync>, store: Arc<PriceStore>) -> Self {
        Self {
            source,
            store,
            attempts: 6,
            retry_unit: Duration::from_secs(1),
            page_delay: Duration::from_millis(350),
            chunk_size: 500,
        }
    }

    pub fn with_timing(mut self, attempts: u32, retry_unit: Duration, page_delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_unit = retry_unit;
        self.page_delay = page_delay;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Build `lowercase base ticker -> cap` from up to `max_pages` pages.
    /// The listing is ordered by cap, so the first entry for a ticker wins.
    /// Paging stops at the first empty, invalid or unreachable page.
    pub async fn fetch_caps(&self, max_pages: u32, page_size: u32) -> HashMap<String, f64> {
        let mut caps: HashMap<String, f64> = HashMap::new();

        for page in 1..=max_pages {
            let Some(samples) = self.fetch_page_with_retry(page, page_size).await else {
                break;
            };
            if samples.is_empty() {
                debug!("Market cap page {} is empty, stopping", page);
                break;
            }

            for MarketCapSample { ticker, cap_usd } in samples {
                caps.entry(ticker).or_insert(cap_usd);
            }

            if page < max_pages {
                tokio::time::sleep(self.page_delay).await;
            }
        }

        info!("Fetched market caps for {} tickers", caps.len());
        caps
    }

    async fn fetch_page_with_retry(&self, page: u32, page_size: u32) -> Option<Vec<MarketCapSample>> {
        for attempt in 0..self.attempts {
            match self.source.fetch_page(page, page_size).await {
                Ok(samples) => return Some(samples),
                Err(e) if e.is_retryable() => {
                    let delay = self.retry_unit.saturating_mul(1u32 << attempt.min(16));
                    debug!("Market cap page {} attempt {} failed: {}; retrying in {:?}", page, attempt + 1, e, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!("Market cap page {} is invalid: {}", page, e);
                    return None;
                }
            }
        }

        warn!("Market cap page {} failed after {} attempts", page, self.attempts);
        None
    }

    /// Set the cap on the latest stored row of every symbol whose base ticker
    /// has one. Returns the number of rows updated.
    pub async fn apply_caps(&self, symbols: &[Symbol], caps: &HashMap<String, f64>) -> Result<usize> {
        let updates = cap_updates(symbols, caps);
        if updates.is_empty() {
            info!("No market caps matched the {} known symbols", symbols.len());
            return Ok(0);
        }

        let store = Arc::clone(&self.store);
        let chunk_size = self.chunk_size;
        let updated = tokio::task::spawn_blocking(move || store.update_latest_caps(&updates, chunk_size)).await??;

        info!("Updated latest market cap for {} symbols", updated);
        Ok(updated)
    }
}

/// Pair each full symbol with its base ticker's cap, in universe order.
pub fn cap_updates(symbols: &[Symbol], caps: &HashMap<String, f64>) -> Vec<(String, f64)> {
    symbols
        .iter()
        .filter_map(|symbol| {
            let cap = caps.get(&symbol.base().to_lowercase())?;
            Some((symbol.to_string(), *cap))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DataHubError;
    use crate::models::price::PriceBar;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct ScriptedCaps {
        pages: Mutex<VecDeque<Result<Vec<MarketCapSample>>>>,
        calls: AtomicU32,
    }

    impl ScriptedCaps {
        fn new(pages: Vec<Result<Vec<MarketCapSample>>>) -> Arc<Self> {
            Arc::new(Self { pages: Mutex::new(pages.into()), calls: AtomicU32::new(0) })
        }
    }

    #[async_trait]
    impl MarketCapSource for ScriptedCaps {
        async fn fetch_page(&self, _page: u32, _page_size: u32) -> Result<Vec<MarketCapSample>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.pages.lock().unwrap().pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn sample(ticker: &str, cap_usd: f64) -> MarketCapSample {
        MarketCapSample { ticker: ticker.to_string(), cap_usd }
    }

    fn store() -> Arc<PriceStore> {
        let store = PriceStore::open_in_memory().unwrap();
        store.ensure_schema().unwrap();
        Arc::new(store)
    }

    #[tokio::test(start_paused = true)]
    async fn pages_until_empty_and_keeps_first_cap() {
        let source = ScriptedCaps::new(vec![
            Ok(vec![sample("btc", 900.0), sample("eth", 400.0)]),
            Ok(vec![sample("btc", 1.0), sample("sol", 50.0)]),
            Ok(vec![]),
            Ok(vec![sample("late", 1.0)]),
        ]);
        let enricher = MarketCapEnricher::new(source.clone(), store());

        let caps = enricher.fetch_caps(12, 250).await;
        assert_eq!(caps.len(), 3);
        assert_eq!(caps["btc"], 900.0);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_page_is_retried_with_backoff() {
        let limited = || -> Result<Vec<MarketCapSample>> { Err(DataHubError::RateLimited("test".into())) };
        let source = ScriptedCaps::new(vec![limited(), limited(), Ok(vec![sample("btc", 900.0)])]);
        let enricher = MarketCapEnricher::new(source.clone(), store())
            .with_timing(6, Duration::from_secs(1), Duration::from_millis(350));

        let started = tokio::time::Instant::now();
        let caps = enricher.fetch_caps(1, 250).await;

        assert_eq!(caps.get("btc"), Some(&900.0));
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_page_stops_paging() {
        let source = ScriptedCaps::new(vec![
            Ok(vec![sample("btc", 900.0)]),
            Err(DataHubError::ParseError("not a list".into())),
            Ok(vec![sample("eth", 400.0)]),
        ]);
        let enricher = MarketCapEnricher::new(source.clone(), store());

        let caps = enricher.fetch_caps(5, 250).await;
        assert_eq!(caps.len(), 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn applies_cap_only_to_matching_symbols() {
        let store = store();
        let day = |d| NaiveDate::from_ymd_opt(2024, 1, d).unwrap();
        let bar = |symbol: &str, d| PriceBar {
            symbol: symbol.to_string(),
            date: day(d),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            market_cap: None,
        };
        store
            .insert_ignoring_duplicates(&[bar("BTC-USD", 1), bar("BTC-USD", 2), bar("ETH-USD", 2)])
            .unwrap();

        let enricher = MarketCapEnricher::new(ScriptedCaps::new(vec![]), store.clone());
        let symbols: Vec<Symbol> = ["BTC-USD", "ETH-USD"].iter().filter_map(|s| Symbol::parse(s)).collect();
        let caps: HashMap<String, f64> = [("btc".to_string(), 900.0)].into_iter().collect();

        assert_eq!(enricher.apply_caps(&symbols, &caps).await.unwrap(), 1);
        assert_eq!(store.count_rows().unwrap(), 3);

        let btc = store.prices_for("BTC-USD").unwrap();
        assert_eq!(btc[0].market_cap, None);
        assert_eq!(btc[1].market_cap, Some(900.0));
        assert_eq!(store.prices_for("ETH-USD").unwrap()[0].market_cap, None);
    }
}
