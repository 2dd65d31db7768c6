use super::{MarketProvider, MarketVenue, OrderBook, RawLevels, parse_levels};
use crate::error::{MonitorError, MonitorResult};
use crate::utils::constants::TRADING_PAIR;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const BINANCE_API: &str = "https://api.binance.com";

#[derive(Debug, Deserialize)]
struct TickerEntry {
    symbol: String,
    price: String,
}

pub struct BinanceProvider {
    http_client: reqwest::Client,
    base_url: String,
}

impl BinanceProvider {
    pub fn new(timeout: Duration) -> MonitorResult<Self> {
        Self::with_base_url(BINANCE_API.to_string(), timeout)
    }

    pub fn with_base_url(base_url: String, timeout: Duration) -> MonitorResult<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http_client, base_url })
    }

    fn ticker_url(&self) -> String {
        format!("{}/api/v1/ticker/allPrices", self.base_url)
    }

    fn depth_url(&self) -> String {
        format!("{}/api/v1/depth?symbol={}&limit=500", self.base_url, TRADING_PAIR)
    }
}

fn parse_ticker(body: &str) -> MonitorResult<f64> {
    let entries: Vec<TickerEntry> = serde_json::from_str(body)?;
    let entry = entries
        .into_iter()
        .find(|entry| entry.symbol == TRADING_PAIR)
        .ok_or_else(|| MonitorError::TransientFetch(format!("{} missing from ticker", TRADING_PAIR)))?;
    entry
        .price
        .parse::<f64>()
        .map_err(|e| MonitorError::TransientFetch(format!("bad price {:?}: {}", entry.price, e)))
}

fn parse_depth(body: &str) -> MonitorResult<OrderBook> {
    let raw: RawLevels = serde_json::from_str(body)?;
    Ok(OrderBook { bids: parse_levels(&raw.bids)? })
}

#[async_trait]
impl MarketProvider for BinanceProvider {
    fn venue(&self) -> MarketVenue {
        MarketVenue::Binance
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
