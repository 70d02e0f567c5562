use crate::errors::Result;
use crate::models::price::{MarketCapSample, RawChart};
use async_trait::async_trait;
use chrono::NaiveDate;

/// Source of raw ticker strings, one page at a time
#[async_trait]
pub trait ListingSource {
    /// Fetch the raw tickers listed on the page starting at `offset`.
    async fn fetch_page(&self, offset: usize) -> Result<Vec<String>>;
}

/// Daily OHLCV history for one symbol
#[async_trait]
pub trait QuoteSource {
    /// Fetch bars in `[start, end)`. A rate-limit response surfaces as
    /// `DataHubError::RateLimited`.
    async fn fetch_range(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<RawChart>;
}

/// Paged market capitalisation listing
#[async_trait]
pub trait MarketCapSource {
    /// `page` counts from 1. An empty page means the listing is exhausted.
    async fn fetch_page(&self, page: u32, page_size: u32) -> Result<Vec<MarketCapSample>>;
}
