use crate::config::Config;
use crate::errors::{DataHubError, Result};
use crate::models::price::{DownloadJob, Symbol};
use crate::scrapers::base::{ListingSource, MarketCapSource, QuoteSource};
use crate::services::artifacts;
use crate::services::enricher::MarketCapEnricher;
use crate::services::fetcher::{FetchOutcome, RangeFetcher};
use crate::services::planner::SyncPlanner;
use crate::services::universe::SymbolUniverseBuilder;
use crate::services::writer::{PersistenceQueue, WriterSettings};
use crate::store::PriceStore;
use chrono::NaiveDate;
use log::{error, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// 管道阶段，严格按顺序推进
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Discovering,
    Planning,
    Fetching,
    Enriching,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "Idle",
            Stage::Discovering => "Discovering",
            Stage::Planning => "Planning",
            Stage::Fetching => "Fetching+Persisting",
            Stage::Enriching => "Enriching",
            Stage::Done => "Done",
        };
        f.write_str(name)
    }
}

/// Totals for one run; partial failures still report what was achieved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    pub symbols_discovered: usize,
    pub jobs_planned: usize,
    pub jobs_failed: usize,
    pub jobs_empty: usize,
    pub rows_fetched: usize,
    pub rows_inserted: usize,
    pub rows_dropped: usize,
    pub caps_fetched: usize,
    pub caps_applied: usize,
    pub elapsed: Duration,
}

enum JobOutcome {
    Queued { rows: usize },
    Dropped { symbol: Symbol, rows: usize, reason: DataHubError },
    Failed,
    TimedOut { symbol: Symbol },
}

/// 数据管道：发现 -> 计划 -> 抓取与写入 -> 市值补充
pub struct PipelineOrchestrator {
    config: Config,
    store: Arc<PriceStore>,
    listing: Arc<dyn ListingSource + Send + Sync>,
    quotes: Arc<dyn QuoteSource + Send + Sync>,
    caps: Arc<dyn MarketCapSource + Send + Sync>,
    today: NaiveDate,
    stage: Stage,
}

impl PipelineOrchestrator {
    pub fn new(
        config: Config,
        store: Arc<PriceStore>,
        listing: Arc<dyn ListingSource + Send + Sync>,
        quotes: Arc<dyn QuoteSource + Send + Sync>,
        caps: Arc<dyn MarketCapSource + Send + Sync>,
    ) -> Self {
        Self {
            config,
            store,
            listing,
            quotes,
            caps,
            today: chrono::Utc::now().date_naive(),
            stage: Stage::Idle,
        }
    }

    /// Pin "today" for window computation.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn enter(&mut self, stage: Stage) {
        info!("=== Stage: {} -> {} ===", self.stage, stage);
        self.stage = stage;
    }

    /// Full run: discover, plan, fetch and persist, then enrich.
    pub async fn run(&mut self) -> Result<PipelineReport> {
        let started = Instant::now();
        let mut report = PipelineReport::default();

        self.ensure_schema().await?;

        let universe = self.discover().await;
        report.symbols_discovered = universe.len();

        let jobs = self.plan(universe).await?;
        report.jobs_planned = jobs.len();

        self.finish(jobs, started, report).await
    }

    /// Fetch and enrich from the saved download plan. A missing plan file is
    /// fatal; everything after it degrades per job.
    pub async fn run_from_plan(&mut self) -> Result<PipelineReport> {
        let started = Instant::now();
        let mut report = PipelineReport::default();

        let jobs = artifacts::read_plan(&self.config.plan_file())?;
        report.jobs_planned = jobs.len();
        self.ensure_schema().await?;

        self.finish(jobs, started, report).await
    }

    /// Enrichment only, for the symbols in the saved universe file.
    pub async fn run_caps_only(&mut self) -> Result<PipelineReport> {
        let started = Instant::now();
        let mut report = PipelineReport::default();

        let symbols = artifacts::read_symbols(&self.config.symbols_file())?;
        report.symbols_discovered = symbols.len();
        self.ensure_schema().await?;

        self.enrich(&symbols, &mut report).await;
        self.enter(Stage::Done);
        report.elapsed = started.elapsed();
        Ok(report)
    }

    async fn finish(&mut self, jobs: Vec<DownloadJob>, started: Instant, mut report: PipelineReport) -> Result<PipelineReport> {
        let symbols: Vec<Symbol> = jobs.iter().map(|job| job.symbol.clone()).collect();

        self.fetch_and_persist(jobs, &mut report).await?;
        self.enrich(&symbols, &mut report).await;

        self.enter(Stage::Done);
        report.elapsed = started.elapsed();
        info!("PIPELINE COMPLETE (total time: {:.2}s, rows inserted: {})",
              report.elapsed.as_secs_f64(), report.rows_inserted);
        Ok(report)
    }

    /// Schema problems abort the run before any fetching starts.
    pub async fn ensure_schema(&self) -> Result<()> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.ensure_schema())
            .await
            .map_err(|e| DataHubError::SchemaError(e.to_string()))?
    }

    pub async fn discover(&mut self) -> Vec<Symbol> {
        self.enter(Stage::Discovering);

        let builder = SymbolUniverseBuilder::new(Arc::clone(&self.listing), self.config.listing_page_size);
        let universe = builder
            .discover(self.config.target_symbols, self.config.page_batch_size, self.config.max_pages)
            .await;

        if let Err(e) = artifacts::write_symbols(&self.config.symbols_file(), &universe) {
            warn!("Failed to save symbol universe: {}", e);
        }
        universe
    }

    pub async fn plan(&mut self, universe: Vec<Symbol>) -> Result<Vec<DownloadJob>> {
        self.enter(Stage::Planning);

        let planner = SyncPlanner::new(Arc::clone(&self.store));
        let jobs = tokio::task::spawn_blocking(move || planner.plan(&universe)).await?;

        if let Err(e) = artifacts::write_plan(&self.config.plan_file(), &jobs) {
            warn!("Failed to save download plan: {}", e);
        }
        Ok(jobs)
    }

    /// Run every job through a bounded worker pool; rows funnel into the
    /// single writer. Per-job failures are counted, never propagated.
    pub async fn fetch_and_persist(&mut self, jobs: Vec<DownloadJob>, report: &mut PipelineReport) -> Result<()> {
        self.enter(Stage::Fetching);

        if jobs.is_empty() {
            info!("No symbols in download plan - nothing to do.");
            return Ok(());
        }

        let total = jobs.len();
        let workers = self.config.worker_count(total);
        info!("Downloading missing OHLCV data with {} workers for {} symbols", workers, total);

        let queue = PersistenceQueue::start(
            Arc::clone(&self.store),
            WriterSettings {
                batch_size: self.config.writer_batch_size,
                flush_interval: self.config.writer_flush_interval,
                poll_interval: self.config.writer_poll_interval,
                enqueue_timeout: self.config.enqueue_timeout,
                capacity: self.config.queue_capacity_for(workers),
            },
        );

        let fetcher = Arc::new(
            RangeFetcher::new(Arc::clone(&self.quotes), self.today)
                .with_history_years(self.config.history_years)
                .with_retry(self.config.fetch_attempts, self.config.backoff_base),
        );
        let permits = Arc::new(Semaphore::new(workers));
        let task_timeout = self.config.task_timeout;
        let mut tasks = JoinSet::new();

        for job in jobs {
            let permits = Arc::clone(&permits);
            let fetcher = Arc::clone(&fetcher);
            let handle = queue.handle();

            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;

                let rows = match tokio::time::timeout(task_timeout, fetcher.fetch(&job)).await {
                    Ok(FetchOutcome::Bars(rows)) => rows,
                    // 抓取器已记录失败原因
                    Ok(FetchOutcome::Failed(_)) => return JobOutcome::Failed,
                    Err(_) => return JobOutcome::TimedOut { symbol: job.symbol },
                };

                let count = rows.len();
                match handle.enqueue(rows).await {
                    Ok(()) => JobOutcome::Queued { rows: count },
                    Err(reason) => JobOutcome::Dropped { symbol: job.symbol, rows: count, reason },
                }
            });
        }

        let mut completed = 0;
        while let Some(joined) = tasks.join_next().await {
            completed += 1;
            match joined {
                Ok(JobOutcome::Queued { rows }) => {
                    report.rows_fetched += rows;
                    if rows == 0 {
                        report.jobs_empty += 1;
                    }
                }
                Ok(JobOutcome::Dropped { symbol, rows, reason }) => {
                    report.rows_fetched += rows;
                    report.rows_dropped += rows;
                    warn!("Failed to enqueue {} rows for {}: {}", rows, symbol, reason);
                }
                Ok(JobOutcome::Failed) => report.jobs_failed += 1,
                Ok(JobOutcome::TimedOut { symbol }) => {
                    report.jobs_failed += 1;
                    warn!("Fetch for {} did not finish within {:?}", symbol, task_timeout);
                }
                Err(e) => {
                    report.jobs_failed += 1;
                    error!("Worker task failed: {}", e);
                }
            }

            if completed % 200 == 0 || completed == total {
                info!("Progress: {}/{} symbols done (rows fetched: {}, inserted: {})",
                      completed, total, report.rows_fetched, queue.inserted_so_far());
            }
        }

        let stats = queue.shutdown().await?;
        report.rows_inserted = stats.rows_inserted;
        info!("Fetch stage complete: {} rows fetched, {} inserted, {} dropped, {} failed jobs",
              report.rows_fetched, report.rows_inserted, report.rows_dropped, report.jobs_failed);
        Ok(())
    }

    pub async fn enrich(&mut self, symbols: &[Symbol], report: &mut PipelineReport) {
        self.enter(Stage::Enriching);

        let enricher = MarketCapEnricher::new(Arc::clone(&self.caps), Arc::clone(&self.store))
            .with_timing(self.config.cap_attempts, self.config.cap_retry_unit, self.config.cap_page_delay)
            .with_chunk_size(self.config.cap_chunk_size);

        let caps = enricher.fetch_caps(self.config.cap_pages, self.config.cap_page_size).await;
        report.caps_fetched = caps.len();

        match enricher.apply_caps(symbols, &caps).await {
            Ok(updated) => report.caps_applied = updated,
            Err(e) => warn!("Failed to apply market caps: {}", e),
        }
    }
}
