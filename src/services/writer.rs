use crate::errors::{DataHubError, Result};
use crate::models::price::PriceBar;
use crate::store::PriceStore;
use log::{debug, error, info};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Messages understood by the writer task.
#[derive(Debug)]
pub enum WriteCommand {
    Rows(Vec<PriceBar>),
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
pub struct WriterSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub poll_interval: Duration,
    pub enqueue_timeout: Duration,
    pub capacity: usize,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval: Duration::from_secs(2),
            poll_interval: Duration::from_secs(1),
            enqueue_timeout: Duration::from_secs(10),
            capacity: 32,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub rows_received: usize,
    pub rows_inserted: usize,
    pub flushes: usize,
    pub failed_rows: usize,
}

/// Producer side of the queue; cheap to clone into every fetch task.
#[derive(Clone)]
pub struct QueueHandle {
    sender: mpsc::Sender<WriteCommand>,
    enqueue_timeout: Duration,
}

impl QueueHandle {
    /// Queue one job's rows. Waits at most the enqueue timeout for space;
    /// on expiry the rows are handed back to the caller as
    /// `CapacityExceeded` instead of blocking the worker pool.
    pub async fn enqueue(&self, rows: Vec<PriceBar>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let count = rows.len();
        match self.sender.send_timeout(WriteCommand::Rows(rows), self.enqueue_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(DataHubError::CapacityExceeded(format!(
                "{} rows not queued within {:?}", count, self.enqueue_timeout
            ))),
            Err(SendTimeoutError::Closed(_)) => Err(DataHubError::CapacityExceeded(format!(
                "{} rows not queued: writer has stopped", count
            ))),
        }
    }
}

/// 单写入者队列：所有价格写入都经过这一个任务串行执行
pub struct PersistenceQueue {
    handle: QueueHandle,
    inserted: Arc<AtomicUsize>,
    worker: JoinHandle<WriterStats>,
}

impl PersistenceQueue {
    /// Spawn the writer task on the current runtime.
    pub fn start(store: Arc<PriceStore>, settings: WriterSettings) -> Self {
        let (sender, receiver) = mpsc::channel(settings.capacity.max(1));
        let inserted = Arc::new(AtomicUsize::new(0));

        let worker = tokio::spawn(run_writer(store, receiver, settings, Arc::clone(&inserted)));

        Self {
            handle: QueueHandle { sender, enqueue_timeout: settings.enqueue_timeout },
            inserted,
            worker,
        }
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    /// Rows inserted so far; for progress reporting while the queue runs.
    pub fn inserted_so_far(&self) -> usize {
        self.inserted.load(Ordering::Relaxed)
    }

    /// Send the shutdown sentinel, wait for the final flush and return totals.
    pub async fn shutdown(self) -> Result<WriterStats> {
        if self.handle.sender.send(WriteCommand::Shutdown).await.is_err() {
            debug!("[Writer] already stopped before shutdown signal");
        }
        drop(self.handle);
        Ok(self.worker.await?)
    }
}

struct Buffer {
    rows: Vec<PriceBar>,
    last_flush: Instant,
}

async fn run_writer(
    store: Arc<PriceStore>,
    mut receiver: mpsc::Receiver<WriteCommand>,
    settings: WriterSettings,
    inserted: Arc<AtomicUsize>,
) -> WriterStats {
    let mut stats = WriterStats::default();
    let mut buffer = Buffer { rows: Vec::new(), last_flush: Instant::now() };

    loop {
        // 有待写数据时，轮询等待不超过下次定时刷盘的剩余时间
        let wait = if buffer.rows.is_empty() {
            settings.poll_interval
        } else {
            settings
                .poll_interval
                .min(settings.flush_interval.saturating_sub(buffer.last_flush.elapsed()))
        };

        match tokio::time::timeout(wait, receiver.recv()).await {
            Err(_) => {
                if !buffer.rows.is_empty() && buffer.last_flush.elapsed() >= settings.flush_interval {
                    flush(&store, &mut buffer, &mut stats, &inserted).await;
                }
            }
            Ok(Some(WriteCommand::Rows(rows))) => {
                stats.rows_received += rows.len();
                buffer.rows.extend(rows);
                if buffer.rows.len() >= settings.batch_size
                    || buffer.last_flush.elapsed() >= settings.flush_interval
                {
                    flush(&store, &mut buffer, &mut stats, &inserted).await;
                }
            }
            Ok(Some(WriteCommand::Shutdown)) | Ok(None) => {
                if !buffer.rows.is_empty() {
                    flush(&store, &mut buffer, &mut stats, &inserted).await;
                }
                break;
            }
        }
    }

    info!("[Writer] stopped: {} rows received, {} inserted in {} flushes",
          stats.rows_received, stats.rows_inserted, stats.flushes);
    stats
}

async fn flush(store: &Arc<PriceStore>, buffer: &mut Buffer, stats: &mut WriterStats, inserted: &AtomicUsize) {
    let batch = std::mem::take(&mut buffer.rows);
    let count = batch.len();
    let store = Arc::clone(store);

    let result = tokio::task::spawn_blocking(move || store.insert_ignoring_duplicates(&batch)).await;
    match result {
        Ok(Ok(n)) => {
            stats.rows_inserted += n;
            inserted.fetch_add(n, Ordering::Relaxed);
            debug!("[Writer] flushed {} rows ({} new)", count, n);
        }
        Ok(Err(e)) => {
            stats.failed_rows += count;
            error!("[Writer] Failed to write batch of {} rows: {}", count, e);
        }
        Err(e) => {
            stats.failed_rows += count;
            error!("[Writer] Write task for {} rows did not complete: {}", count, e);
        }
    }

    stats.flushes += 1;
    buffer.last_flush = Instant::now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, NaiveDate};

    fn store() -> Arc<PriceStore> {
        let store = PriceStore::open_in_memory().unwrap();
        store.ensure_schema().unwrap();
        Arc::new(store)
    }

    fn bar(i: i64) -> PriceBar {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        PriceBar {
            symbol: "BTC-USD".to_string(),
            date: start + ChronoDuration::days(i),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            market_cap: None,
        }
    }

    #[tokio::test]
    async fn burst_over_batch_size_flushes_before_drain() {
        let store = store();
        let settings = WriterSettings {
            flush_interval: Duration::from_secs(60),
            poll_interval: Duration::from_millis(20),
            capacity: 16,
            ..WriterSettings::default()
        };
        let queue = PersistenceQueue::start(store.clone(), settings);
        let handle = queue.handle();

        for i in 0..501 {
            handle.enqueue(vec![bar(i)]).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(store.count_rows().unwrap(), 500);
        assert_eq!(queue.inserted_so_far(), 500);

        let stats = queue.shutdown().await.unwrap();
        assert_eq!(store.count_rows().unwrap(), 501);
        assert_eq!(stats.rows_inserted, 501);
        assert_eq!(stats.flushes, 2);
    }

    #[tokio::test]
    async fn single_row_flushes_within_interval() {
        let store = store();
        let settings = WriterSettings {
            flush_interval: Duration::from_millis(100),
            poll_interval: Duration::from_secs(1),
            ..WriterSettings::default()
        };
        let queue = PersistenceQueue::start(store.clone(), settings);

        queue.handle().enqueue(vec![bar(0)]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.count_rows().unwrap(), 1);

        let stats = queue.shutdown().await.unwrap();
        assert_eq!(stats.flushes, 1);
    }

    #[tokio::test]
    async fn shutdown_flushes_remaining_rows_idempotently() {
        let store = store();
        let settings = WriterSettings { flush_interval: Duration::from_secs(60), ..WriterSettings::default() };
        let queue = PersistenceQueue::start(store.clone(), settings);
        let handle = queue.handle();

        let rows: Vec<PriceBar> = (0..10).map(bar).collect();
        handle.enqueue(rows.clone()).await.unwrap();
        handle.enqueue(rows).await.unwrap();
        handle.enqueue(Vec::new()).await.unwrap();

        let stats = queue.shutdown().await.unwrap();
        assert_eq!(stats.rows_received, 20);
        assert_eq!(stats.rows_inserted, 10);
        assert_eq!(store.count_rows().unwrap(), 10);
    }

    #[tokio::test]
    async fn full_queue_reports_capacity_exceeded() {
        let (sender, _receiver) = mpsc::channel(1);
        let handle = QueueHandle { sender, enqueue_timeout: Duration::from_millis(50) };

        handle.enqueue(vec![bar(0)]).await.unwrap();
        let err = handle.enqueue(vec![bar(1)]).await.unwrap_err();
        assert!(matches!(err, DataHubError::CapacityExceeded(_)));
    }
}
