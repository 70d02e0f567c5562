use crate::models::price::{DownloadJob, Symbol};
use crate::store::PriceStore;
use log::{info, warn};
use std::sync::Arc;

/// 对比已存储数据，为每个交易对生成下载任务
pub struct SyncPlanner {
    store: Arc<PriceStore>,
}

impl SyncPlanner {
    pub fn new(store: Arc<PriceStore>) -> Self {
        Self { store }
    }

    /// One job per symbol, in universe order, carrying the last stored date.
    /// Symbols already up to date still get a job; their window is empty.
    pub fn plan(&self, universe: &[Symbol]) -> Vec<DownloadJob> {
        let mut jobs = Vec::with_capacity(universe.len());
        let mut new_symbols = 0;

        for symbol in universe {
            let last_date = match self.store.get_last_date(symbol.as_str()) {
                Ok(last) => last,
                Err(e) => {
                    warn!("Failed to read last date for {}: {}", symbol, e);
                    None
                }
            };
            if last_date.is_none() {
                new_symbols += 1;
            }
            jobs.push(DownloadJob::new(symbol.clone(), last_date));
        }

        info!("Planned {} jobs ({} symbols without stored history)", jobs.len(), new_symbols);
        jobs
    }
}
