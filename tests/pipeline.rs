use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate};
use cryptoscope_datahub::models::price::{MarketCapSample, RawChart};
use cryptoscope_datahub::scrapers::base::{ListingSource, MarketCapSource, QuoteSource};
use cryptoscope_datahub::services::artifacts;
use cryptoscope_datahub::util::date_to_timestamp;
use cryptoscope_datahub::{Config, DataHubError, PipelineOrchestrator, PriceStore, Result, Stage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()
}

struct FakeListing;

#[async_trait]
impl ListingSource for FakeListing {
    async fn fetch_page(&self, offset: usize) -> Result<Vec<String>> {
        if offset > 0 {
            return Ok(Vec::new());
        }
        Ok(["BTC-USD", "ETH-USD", "btc-usd", "USDT-EUR", "SOL-USD"]
            .iter()
            .map(|s| s.to_string())
            .collect())
    }
}

/// Three daily bars ending today for every symbol.
struct FakeQuotes {
    calls: AtomicUsize,
}

#[async_trait]
impl QuoteSource for FakeQuotes {
    async fn fetch_range(&self, symbol: &str, _start: NaiveDate, _end: NaiveDate) -> Result<RawChart> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if symbol == "SOL-USD" {
            return Err(DataHubError::ParseError("no chart result".into()));
        }
        let days: Vec<NaiveDate> = (0..3).rev().map(|n| today() - ChronoDuration::days(n)).collect();
        Ok(RawChart {
            timestamps: days.iter().map(|d| date_to_timestamp(*d)).collect(),
            open: vec![Some(10.0), Some(11.0), Some(12.0)],
            high: vec![Some(11.0), Some(12.0), Some(13.0)],
            low: vec![Some(9.0), Some(10.0), Some(11.0)],
            close: vec![Some(10.5), Some(11.5), Some(12.5)],
            volume: vec![Some(100.0), None, Some(300.0)],
        })
    }
}

struct FakeCaps;

#[async_trait]
impl MarketCapSource for FakeCaps {
    async fn fetch_page(&self, page: u32, _page_size: u32) -> Result<Vec<MarketCapSample>> {
        if page > 1 {
            return Ok(Vec::new());
        }
        Ok(vec![
            MarketCapSample { ticker: "btc".into(), cap_usd: 900.0 },
            MarketCapSample { ticker: "eth".into(), cap_usd: 400.0 },
            MarketCapSample { ticker: "doge".into(), cap_usd: 10.0 },
        ])
    }
}

/// Like `FakeQuotes`, but ETH-USD never answers.
struct HangingQuotes {
    inner: FakeQuotes,
}

#[async_trait]
impl QuoteSource for HangingQuotes {
    async fn fetch_range(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<RawChart> {
        if symbol == "ETH-USD" {
            return std::future::pending().await;
        }
        self.inner.fetch_range(symbol, start, end).await
    }
}

struct Harness {
    dir: TempDir,
    store: Arc<PriceStore>,
    orchestrator: PipelineOrchestrator,
}

fn harness_with(quotes: Arc<dyn QuoteSource + Send + Sync>, tune: impl FnOnce(Config) -> Config) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::new()
        .with_data_dir(dir.path())
        .with_target_symbols(10)
        .with_max_pages(4)
        .with_page_batch_size(2)
        .with_max_workers(4)
        .with_backoff_base(Duration::from_millis(1))
        .with_cap_timing(Duration::from_millis(1), Duration::from_millis(1));

    let store = Arc::new(PriceStore::open_in_memory().unwrap());
    let orchestrator = PipelineOrchestrator::new(
        tune(config),
        Arc::clone(&store),
        Arc::new(FakeListing),
        quotes,
        Arc::new(FakeCaps),
    )
    .with_today(today());

    Harness { dir, store, orchestrator }
}

fn fake_quotes() -> Arc<FakeQuotes> {
    Arc::new(FakeQuotes { calls: AtomicUsize::new(0) })
}

fn harness() -> Harness {
    harness_with(fake_quotes(), |config| config)
}

#[tokio::test]
async fn full_run_persists_bars_and_latest_caps() {
    let mut h = harness();

    let report = h.orchestrator.run().await.unwrap();

    assert_eq!(h.orchestrator.stage(), Stage::Done);
    assert_eq!(report.symbols_discovered, 3);
    assert_eq!(report.jobs_planned, 3);
    assert_eq!(report.rows_fetched, 6);
    assert_eq!(report.rows_inserted, 6);
    assert_eq!(report.rows_dropped, 0);
    // SOL-USD has no chart result
    assert_eq!(report.jobs_failed, 1);
    assert_eq!(report.jobs_empty, 0);
    assert_eq!(report.caps_fetched, 3);
    assert_eq!(report.caps_applied, 2);
    assert_eq!(h.store.count_rows().unwrap(), 6);

    let btc = h.store.prices_for("BTC-USD").unwrap();
    assert_eq!(btc.len(), 3);
    assert_eq!(btc[1].volume, 0.0);
    assert_eq!(btc[0].market_cap, None);
    assert_eq!(btc[2].date, today());
    assert_eq!(btc[2].market_cap, Some(900.0));

    let quotes = h.store.latest_quotes(10, 0, None).unwrap();
    let ranked: Vec<&str> = quotes.iter().map(|q| q.symbol.as_str()).collect();
    assert_eq!(ranked, vec!["BTC-USD", "ETH-USD"]);
    assert_eq!(quotes[0].rank, 1);
    assert_eq!(h.store.latest_date().unwrap(), Some(today()));
}

#[tokio::test]
async fn second_run_is_incremental() {
    let quotes = fake_quotes();
    let mut h = harness_with(quotes.clone(), |config| config);
    h.orchestrator.run().await.unwrap();
    let calls_after_first = quotes.calls.load(Ordering::SeqCst);

    let report = h.orchestrator.run().await.unwrap();

    assert_eq!(report.jobs_planned, 3);
    assert_eq!(report.jobs_empty, 2);
    assert_eq!(report.jobs_failed, 1);
    assert_eq!(report.rows_inserted, 0);
    assert_eq!(report.rows_fetched, 0);
    assert_eq!(h.store.count_rows().unwrap(), 6);
    // BTC and ETH are up to date; only SOL-USD goes back to the network
    assert_eq!(quotes.calls.load(Ordering::SeqCst), calls_after_first + 1);
}

#[tokio::test]
async fn artifacts_drive_staged_runs() {
    let mut h = harness();
    let universe = h.orchestrator.discover().await;
    assert_eq!(universe.len(), 3);

    let saved = artifacts::read_symbols(&h.dir.path().join("symbols.csv")).unwrap();
    assert_eq!(saved, universe);

    h.orchestrator.ensure_schema().await.unwrap();
    let jobs = h.orchestrator.plan(saved).await.unwrap();
    assert!(jobs.iter().all(|job| job.last_date.is_none()));

    let report = h.orchestrator.run_from_plan().await.unwrap();
    assert_eq!(report.jobs_planned, 3);
    assert_eq!(report.rows_inserted, 6);

    // 计划文件未更新：重复同步只会被忽略
    let again = h.orchestrator.run_from_plan().await.unwrap();
    assert_eq!(again.rows_fetched, 6);
    assert_eq!(again.rows_inserted, 0);
    assert_eq!(h.store.count_rows().unwrap(), 6);
}

#[tokio::test]
async fn missing_plan_file_is_fatal() {
    let mut h = harness();
    let err = h.orchestrator.run_from_plan().await.unwrap_err();
    assert!(matches!(err, DataHubError::DataError(_)));
    assert!(err.to_string().contains("download_plan.csv"));
    assert_eq!(h.store.count_rows().unwrap_or(0), 0);
}

#[tokio::test(start_paused = true)]
async fn hung_quote_request_times_out_without_blocking_others() {
    let quotes = Arc::new(HangingQuotes { inner: FakeQuotes { calls: AtomicUsize::new(0) } });
    let mut h = harness_with(quotes, |config| config.with_task_timeout(Duration::from_secs(60)));

    let started = tokio::time::Instant::now();
    let report = h.orchestrator.run().await.unwrap();

    assert_eq!(h.orchestrator.stage(), Stage::Done);
    assert!(started.elapsed() >= Duration::from_secs(60));
    // ETH-USD timed out, SOL-USD has no chart result
    assert_eq!(report.jobs_failed, 2);
    assert_eq!(report.rows_inserted, 3);
    assert_eq!(h.store.prices_for("BTC-USD").unwrap().len(), 3);
    assert!(h.store.prices_for("ETH-USD").unwrap().is_empty());
}
