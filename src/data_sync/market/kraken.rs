use super::{MarketProvider, MarketVenue, OrderBook, RawLevels, parse_levels, parse_number};
use crate::error::{MonitorError, MonitorResult};
use crate::utils::constants::TRADING_PAIR;
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

const KRAKEN_API: &str = "https://api.kraken.com";

/// Kraken wraps every payload as `{ "error": [...], "result": { PAIR: ... } }`
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    error: Vec<String>,
    result: Option<HashMap<String, T>>,
}

#[derive(Debug, Deserialize)]
struct TickerInfo {
    /// last trade closed: [price, lot volume]
    c: Vec<Value>,
}

pub struct KrakenProvider {
    http_client: reqwest::Client,
    base_url: String,
}

impl KrakenProvider {
    pub fn new(timeout: Duration) -> MonitorResult<Self> {
        Self::with_base_url(KRAKEN_API.to_string(), timeout)
    }

    pub fn with_base_url(base_url: String, timeout: Duration) -> MonitorResult<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http_client, base_url })
    }

    fn ticker_url(&self) -> String {
        format!("{}/0/public/Ticker?pair={}", self.base_url, TRADING_PAIR)
    }

    fn depth_url(&self) -> String {
        format!("{}/0/public/Depth?pair={}", self.base_url, TRADING_PAIR)
    }
}

/// Payload for the pair. Kraken may answer under its internal pair name, so a
/// single-entry result is accepted whatever its key.
fn unwrap_pair<T: DeserializeOwned>(body: &str) -> MonitorResult<T> {
    let envelope: Envelope<T> = serde_json::from_str(body)?;
    if !envelope.error.is_empty() {
        return Err(MonitorError::TransientFetch(format!("kraken: {}", envelope.error.join(", "))));
    }

    let mut result = envelope
        .result
        .ok_or_else(|| MonitorError::TransientFetch("kraken: empty result".to_string()))?;
    if let Some(payload) = result.remove(TRADING_PAIR) {
        return Ok(payload);
    }
    if result.len() == 1 {
        if let Some(payload) = result.into_values().next() {
            return Ok(payload);
        }
    }
    Err(MonitorError::TransientFetch(format!("kraken: {} missing from result", TRADING_PAIR)))
}

fn parse_ticker(body: &str) -> MonitorResult<f64> {
    let info: TickerInfo = unwrap_pair(body)?;
    let last = info
        .c
        .first()
        .ok_or_else(|| MonitorError::TransientFetch("kraken: ticker without last trade".to_string()))?;
    parse_number(last)
}

fn parse_depth(body: &str) -> MonitorResult<OrderBook> {
    let raw: RawLevels = unwrap_pair(body)?;
    Ok(OrderBook { bids: parse_levels(&raw.bids)? })
}

#[async_trait]
impl MarketProvider for KrakenProvider {
    fn venue(&self) -> MarketVenue {
        MarketVenue::Kraken
    }

    async fn ticker_price(&self) -> MonitorResult<f64> {
        let body = self.http_client.get(self.ticker_url()).send().await?.error_for_status()?.text().await?;
        parse_ticker(&body)
    }

    async fn order_book(&self) -> MonitorResult<OrderBook> {
        let body = self.http_client.get(self.depth_url()).send().await?.error_for_status()?.text().await?;
        parse_depth(&body)
    }
}
