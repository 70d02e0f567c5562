use log::warn;
use std::path::PathBuf;
use std::time::Duration;

/// 管道运行配置
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,

    // 交易对发现
    pub target_symbols: usize,
    pub page_batch_size: usize,
    pub max_pages: usize,
    pub listing_page_size: usize,

    // K线抓取
    pub max_workers: usize,
    pub history_years: i64,
    pub fetch_attempts: u32,
    pub backoff_base: Duration,
    pub task_timeout: Duration,

    // 单写入者队列
    pub writer_batch_size: usize,
    pub writer_flush_interval: Duration,
    pub writer_poll_interval: Duration,
    pub queue_capacity: Option<usize>,
    pub enqueue_timeout: Duration,

    // 市值补充
    pub cap_pages: u32,
    pub cap_page_size: u32,
    pub cap_attempts: u32,
    pub cap_retry_unit: Duration,
    pub cap_page_delay: Duration,
    pub cap_chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            db_path: PathBuf::from(env!("DATAHUB_DEFAULT_DB_PATH")),
            data_dir: PathBuf::from(env!("DATAHUB_DEFAULT_DATA_DIR")),
            target_symbols: 1000,
            page_batch_size: 8,
            max_pages: 100,
            listing_page_size: 100,
            max_workers: 8,
            history_years: 10,
            fetch_attempts: 3,
            backoff_base: Duration::from_secs(1),
            task_timeout: Duration::from_secs(60),
            writer_batch_size: 500,
            writer_flush_interval: Duration::from_secs(2),
            writer_poll_interval: Duration::from_secs(1),
            queue_capacity: None,
            enqueue_timeout: Duration::from_secs(10),
            cap_pages: 12,
            cap_page_size: 250,
            cap_attempts: 6,
            cap_retry_unit: Duration::from_secs(1),
            cap_page_delay: Duration::from_millis(350),
            cap_chunk_size: 500,
        }
    }

    /// 读取环境变量覆盖默认值
    pub fn from_env() -> Self {
        let mut config = Self::new();

        if let Ok(path) = std::env::var("DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Ok(dir) = std::env::var("DATAHUB_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(workers) = parse_env::<usize>("DATAHUB_MAX_WORKERS") {
            config.max_workers = workers;
        }
        if let Some(ms) = parse_env::<u64>("DATAHUB_BACKOFF_BASE_MS") {
            config.backoff_base = Duration::from_millis(ms);
        }

        config
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_target_symbols(mut self, count: usize) -> Self {
        self.target_symbols = count;
        self
    }

    pub fn with_page_batch_size(mut self, size: usize) -> Self {
        self.page_batch_size = size;
        self
    }

    pub fn with_max_pages(mut self, pages: usize) -> Self {
        self.max_pages = pages;
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_writer_flush(mut self, batch_size: usize, interval: Duration) -> Self {
        self.writer_batch_size = batch_size;
        self.writer_flush_interval = interval;
        self
    }

    pub fn with_writer_poll_interval(mut self, interval: Duration) -> Self {
        self.writer_poll_interval = interval;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout = timeout;
        self
    }

    pub fn with_cap_paging(mut self, pages: u32, page_size: u32) -> Self {
        self.cap_pages = pages;
        self.cap_page_size = page_size;
        self
    }

    pub fn with_cap_timing(mut self, retry_unit: Duration, page_delay: Duration) -> Self {
        self.cap_retry_unit = retry_unit;
        self.cap_page_delay = page_delay;
        self
    }

    /// 队列容量：未显式配置时取 max(32, workers * 4)
    pub fn queue_capacity_for(&self, workers: usize) -> usize {
        self.queue_capacity
            .unwrap_or_else(|| (workers * 4).max(32))
            .max(1)
    }

    /// 抓取线程数 = min(上限, 任务数, max(2, 可用并行度))
    pub fn worker_count(&self, job_count: usize) -> usize {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        self.max_workers
            .min(job_count)
            .min(parallelism.max(2))
            .max(1)
    }

    pub fn symbols_file(&self) -> PathBuf {
        self.data_dir.join("symbols.csv")
    }

    pub fn plan_file(&self) -> PathBuf {
        self.data_dir.join("download_plan.csv")
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid value for {}: {}", key, raw);
            None
        }
    }
}
