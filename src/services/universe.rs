use crate::models::price::Symbol;
use crate::scrapers::base::ListingSource;
use log::{info, warn};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;

/// 分页并发抓取列表页，校验去重后得到交易对集合
pub struct SymbolUniverseBuilder {
    source: Arc<dyn ListingSource + Send + Sync>,
    page_size: usize,
}

impl SymbolUniverseBuilder {
    pub fn new(source: Arc<dyn ListingSource + Send + Sync>, page_size: usize) -> Self {
        Self { source, page_size }
    }

    /// Page through the listing in batches until `target_count` symbols are
    /// accepted, a whole batch comes back empty, or `max_pages` is reached.
    ///
    /// Pages inside a batch are fetched concurrently but merged in page
    /// order, so identical listings always give an identical universe. The
    /// first listing of a base asset wins.
    pub async fn discover(&self, target_count: usize, page_batch_size: usize, max_pages: usize) -> Vec<Symbol> {
        info!("Discovering up to {} symbols ({} pages per batch, max {} pages)",
              target_count, page_batch_size, max_pages);

        let batch_size = page_batch_size.max(1);
        let mut accepted: Vec<Symbol> = Vec::new();
        let mut seen_bases: HashSet<String> = HashSet::new();
        let mut next_page = 0;

        while accepted.len() < target_count && next_page < max_pages {
            let batch_end = (next_page + batch_size).min(max_pages);
            let pages: Vec<usize> = (next_page..batch_end).collect();
            next_page = batch_end;

            let results = self.fetch_batch(&pages).await;

            let mut any_data = false;
            for (_, tickers) in results {
                if !tickers.is_empty() {
                    any_data = true;
                }

                for raw in tickers {
                    if accepted.len() >= target_count {
                        break;
                    }
                    let Some(symbol) = Symbol::parse(&raw) else {
                        continue;
                    };
                    if seen_bases.insert(symbol.base().to_string()) {
                        accepted.push(symbol);
                    }
                }
            }

            info!("Discovery progress: {}/{} symbols after {} pages", accepted.len(), target_count, next_page);

            if !any_data {
                info!("Listing exhausted at page {}", next_page);
                break;
            }
        }

        info!("Discovered {} symbols (target {})", accepted.len(), target_count);
        accepted
    }

    /// 并发抓取一批页面；失败的页面按空页处理
    async fn fetch_batch(&self, pages: &[usize]) -> BTreeMap<usize, Vec<String>> {
        let mut results: BTreeMap<usize, Vec<String>> = pages.iter().map(|&p| (p, Vec::new())).collect();
        let mut tasks = JoinSet::new();

        for &page in pages {
            let source = Arc::clone(&self.source);
            let offset = page * self.page_size;
            tasks.spawn(async move { (page, offset, source.fetch_page(offset).await) });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((page, _, Ok(tickers))) => {
                    results.insert(page, tickers);
                }
                Ok((_, offset, Err(e))) => {
                    warn!("Error fetching listing page start={}: {}", offset, e);
                }
                Err(e) => {
                    warn!("Listing page task failed: {}", e);
                }
            }
        }

        results
    }
}
