use crate::errors::{DataHubError, Result};
use crate::models::price::RawChart;
use crate::scrapers::base::{ListingSource, QuoteSource};
use crate::util;
use async_trait::async_trait;
use chrono::NaiveDate;
use log::debug;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const LISTING_URL: &str = "https://finance.yahoo.com/markets/crypto/all/";
const CHART_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";
const USER_AGENT: &str = "Mozilla/5.0";

/// 雅虎加密货币列表页抓取器
pub struct YahooListingScraper {
    client: Client,
    page_size: usize,
    request_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl YahooListingScraper {
    pub fn new(page_size: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            page_size,
            request_interval: Duration::from_millis(100),
            last_request: Mutex::new(None),
        })
    }

    // 错开并发请求，避免同一瞬间打满列表页
    async fn wait_for_rate_limit(&self) {
        let mut last = self.last_request.lock().await;

        if let Some(time) = *last {
            let elapsed = time.elapsed();
            if elapsed < self.request_interval {
                tokio::time::sleep(self.request_interval - elapsed).await;
            }
        }

        *last = Some(Instant::now());
    }
}

#[async_trait]
impl ListingSource for YahooListingScraper {
    async fn fetch_page(&self, offset: usize) -> Result<Vec<String>> {
        self.wait_for_rate_limit().await;

        let response = self.client
            .get(LISTING_URL)
            .query(&[("start", offset.to_string()), ("count", self.page_size.to_string())])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(DataHubError::RateLimited("yahoo listing".to_string()));
        }
        if !status.is_success() {
            return Err(DataHubError::HttpStatus(status.as_u16()));
        }

        let html = response.text().await?;
        let tickers = extract_listing_tickers(&html);
        debug!("Listing page start={} yielded {} tickers", offset, tickers.len());
        Ok(tickers)
    }
}

/// Pull ticker text out of the listing table: every `ticker` cell holds a
/// `<span class="symbol ...">TICKER</span>`.
pub fn extract_listing_tickers(html: &str) -> Vec<String> {
    let mut tickers = Vec::new();

    for cell in html.split("data-testid-cell=\"ticker\"").skip(1) {
        let cell = cell.split("</td>").next().unwrap_or(cell);

        let Some(class_pos) = cell.find("class=\"symbol") else {
            continue;
        };
        let after_class = &cell[class_pos + "class=\"symbol".len()..];
        if !after_class.starts_with('"') && !after_class.starts_with(' ') {
            continue;
        }

        let Some(open_end) = after_class.find('>') else {
            continue;
        };
        let text = &after_class[open_end + 1..];
        let text = text.split('<').next().unwrap_or_default().trim();
        if !text.is_empty() {
            tickers.push(text.to_string());
        }
    }

    tickers
}

/// 雅虎日线K线客户端
pub struct YahooChartClient {
    client: Client,
}

impl YahooChartClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl QuoteSource for YahooChartClient {
    async fn fetch_range(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<RawChart> {
        let period1 = util::date_to_timestamp(start);
        let period2 = util::date_to_timestamp(end);

        let response = self.client
            .get(format!("{}/{}", CHART_URL, symbol))
            .query(&[
                ("interval", "1d".to_string()),
                ("period1", period1.to_string()),
                ("period2", period2.to_string()),
            ])
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(DataHubError::RateLimited(format!("yahoo chart {}", symbol)));
        }
        if !status.is_success() {
            return Err(DataHubError::HttpStatus(status.as_u16()));
        }

        let text = response.text().await?;
        parse_chart(&text)
    }
}

#[derive(Deserialize)]
struct ChartEnvelope {
    chart: ChartBody,
}

#[derive(Deserialize)]
struct ChartBody {
    result: Option<Vec<ChartResult>>,
}

#[derive(Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<QuoteArrays>,
}

#[derive(Deserialize, Default)]
struct QuoteArrays {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

/// Decode a chart response into its parallel arrays.
pub fn parse_chart(json: &str) -> Result<RawChart> {
    let envelope: ChartEnvelope = serde_json::from_str(json)?;

    let result = envelope
        .chart
        .result
        .and_then(|results| results.into_iter().next())
        .ok_or_else(|| DataHubError::ParseError("chart response has no result".to_string()))?;

    let quote = result
        .indicators
        .quote
        .into_iter()
        .next()
        .ok_or_else(|| DataHubError::ParseError("chart response has no quote block".to_string()))?;

    Ok(RawChart {
        timestamps: result.timestamp,
        open: quote.open,
        high: quote.high,
        low: quote.low,
        close: quote.close,
        volume: quote.volume,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tickers_from_listing_rows() {
        let html = r#"
            <table><tbody>
            <tr><td data-testid-cell="ticker"><span class="symbol yf-1jpysdn">BTC-USD</span></td></tr>
            <tr><td data-testid-cell="ticker"><span class="symbol">ETH-USD</span></td></tr>
            <tr><td data-testid-cell="ticker"><span class="symbolic">NOPE</span></td></tr>
            <tr><td data-testid-cell="name"><span class="symbol">XXX-USD</span></td></tr>
            <tr><td data-testid-cell="ticker"></td><td><span class="symbol">LEAK-USD</span></td></tr>
            </tbody></table>
        "#;
        assert_eq!(extract_listing_tickers(html), vec!["BTC-USD", "ETH-USD"]);
    }

    #[test]
    fn parses_chart_arrays() {
        let json = r#"{"chart":{"result":[{"timestamp":[1704067200,1704153600],
            "indicators":{"quote":[{"open":[1.0,null],"high":[2.0,2.5],"low":[0.5,1.0],
            "close":[1.5,2.0],"volume":[100,null]}]}}],"error":null}}"#;
        let chart = parse_chart(json).unwrap();
        assert_eq!(chart.timestamps.len(), 2);
        assert_eq!(chart.open, vec![Some(1.0), None]);
        assert_eq!(chart.volume, vec![Some(100.0), None]);
    }

    #[test]
    fn missing_result_is_parse_error() {
        let json = r#"{"chart":{"result":null,"error":{"code":"Not Found"}}}"#;
        assert!(matches!(parse_chart(json), Err(DataHubError::ParseError(_))));
    }
}
