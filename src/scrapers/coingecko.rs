use crate::errors::{DataHubError, Result};
use crate::models::price::MarketCapSample;
use crate::scrapers::base::MarketCapSource;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;

const MARKETS_URL: &str = "https://api.coingecko.com/api/v3/coins/markets";

/// CoinGecko 市值列表
pub struct CoinGeckoMarketCapSource {
    client: Client,
}

impl CoinGeckoMarketCapSource {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .user_agent("Mozilla/5.0")
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl MarketCapSource for CoinGeckoMarketCapSource {
    async fn fetch_page(&self, page: u32, page_size: u32) -> Result<Vec<MarketCapSample>> {
        let response = self.client
            .get(MARKETS_URL)
            .query(&[
                ("vs_currency", "usd".to_string()),
                ("order", "market_cap_desc".to_string()),
                ("per_page", page_size.to_string()),
                ("page", page.to_string()),
                ("sparkline", "false".to_string()),
            ])
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(DataHubError::RateLimited("coingecko markets".to_string()));
        }
        if !status.is_success() {
            return Err(DataHubError::HttpStatus(status.as_u16()));
        }

        let json: Value = response.json().await?;
        parse_markets(&json)
    }
}

/// Map a markets page to samples. Entries without a ticker or a numeric cap
/// are skipped; a body that is not a list is a parse error.
pub fn parse_markets(json: &Value) -> Result<Vec<MarketCapSample>> {
    let items = json
        .as_array()
        .ok_or_else(|| DataHubError::ParseError("markets page is not a list".to_string()))?;

    let samples = items
        .iter()
        .filter_map(|item| {
            let ticker = item.get("symbol")?.as_str()?.trim().to_lowercase();
            let cap_usd = item.get("market_cap")?.as_f64()?;
            if ticker.is_empty() {
                return None;
            }
            Some(MarketCapSample { ticker, cap_usd })
        })
        .collect();

    Ok(samples)
}
