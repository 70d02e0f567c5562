use crate::errors::{DataHubError, Result};
use crate::models::price::{DownloadJob, FetchWindow, PriceBar, RawChart};
use crate::scrapers::base::QuoteSource;
use crate::util;
use chrono::NaiveDate;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

/// 单个任务的抓取结果：成功（可能为空）或重试后仍失败
#[derive(Debug)]
pub enum FetchOutcome {
    Bars(Vec<PriceBar>),
    Failed(DataHubError),
}

impl FetchOutcome {
    /// Bars fetched; a failed job contributes none.
    pub fn into_bars(self) -> Vec<PriceBar> {
        match self {
            FetchOutcome::Bars(bars) => bars,
            FetchOutcome::Failed(_) => Vec::new(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, FetchOutcome::Failed(_))
    }
}

/// 单个下载任务的区间抓取，带重试与指数退避
pub struct RangeFetcher {
    source: Arc<dyn QuoteSource + Send + Sync>,
    today: NaiveDate,
    history_years: i64,
    attempts: u32,
    backoff_base: Duration,
}

impl RangeFetcher {
    pub fn new(source: Arc<dyn QuoteSource + Send + Sync>, today: NaiveDate) -> Self {
        Self {
            source,
            today,
            history_years: 10,
            attempts: 3,
            backoff_base: Duration::from_secs(1),
        }
    }

    pub fn with_history_years(mut self, years: i64) -> Self {
        self.history_years = years;
        self
    }

    pub fn with_retry(mut self, attempts: u32, backoff_base: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff_base = backoff_base;
        self
    }

    pub fn window(&self, job: &DownloadJob) -> FetchWindow {
        util::compute_window(job.last_date, self.today, self.history_years)
    }

    /// Fetch the bars still missing for `job`. Never returns an error: a
    /// request that still fails after the retries is logged and reported as
    /// `FetchOutcome::Failed`. An empty window skips the network.
    pub async fn fetch(&self, job: &DownloadJob) -> FetchOutcome {
        let window = self.window(job);
        if window.is_empty() {
            debug!("{} is up to date, nothing to fetch", job.symbol);
            return FetchOutcome::Bars(Vec::new());
        }

        match self.fetch_with_retry(job.symbol.as_str(), window).await {
            Ok(chart) => {
                let bars = chart_to_bars(job.symbol.as_str(), &chart, window);
                debug!("{}: {} bars for {} .. {}", job.symbol, bars.len(), window.start, window.end);
                FetchOutcome::Bars(bars)
            }
            Err(e) => {
                warn!("[DownloadWorker] Failed {}: {}", job.symbol, e);
                FetchOutcome::Failed(e)
            }
        }
    }

    async fn fetch_with_retry(&self, symbol: &str, window: FetchWindow) -> Result<RawChart> {
        let mut last_error = DataHubError::DataError(format!("no attempt made for {}", symbol));

        for attempt in 1..=self.attempts {
            match self.source.fetch_range(symbol, window.start, window.end).await {
                Ok(chart) => return Ok(chart),
                Err(e) if e.is_retryable() => {
                    let delay = if e.is_rate_limited() {
                        util::backoff_delay(self.backoff_base, attempt)
                    } else {
                        util::jittered_backoff(self.backoff_base, attempt)
                    };
                    debug!("{} attempt {}/{} failed: {}", symbol, attempt, self.attempts, e);
                    last_error = e;
                    if attempt < self.attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }
}

/// Turn aligned arrays into bars. A bar missing any of open/high/low/close is
/// dropped, a missing volume becomes 0, and dates outside `window` are skipped.
pub fn chart_to_bars(symbol: &str, chart: &RawChart, window: FetchWindow) -> Vec<PriceBar> {
    let at = |values: &[Option<f64>], i: usize| values.get(i).copied().flatten();

    chart
        .timestamps
        .iter()
        .enumerate()
        .filter_map(|(i, &ts)| {
            let date = util::timestamp_to_date(ts)?;
            if date < window.start || date >= window.end {
                return None;
            }
            Some(PriceBar {
                symbol: symbol.to_string(),
                date,
                open: at(&chart.open, i)?,
                high: at(&chart.high, i)?,
                low: at(&chart.low, i)?,
                close: at(&chart.close, i)?,
                volume: at(&chart.volume, i).unwrap_or(0.0),
                market_cap: None,
            })
        })
        .collect()
}
