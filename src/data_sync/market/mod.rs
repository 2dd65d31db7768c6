/// External market data for the sale token's trading pair.
///
/// Each venue is a [`MarketProvider`]; the [`MarketDataAggregator`] polls all
/// configured venues concurrently and isolates their failures from each other.
pub mod binance;
pub mod kraken;
pub mod mock;

pub use binance::BinanceProvider;
pub use kraken::KrakenProvider;
pub use mock::MockMarketProvider;

use crate::error::{MonitorError, MonitorResult, bounded};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum MarketVenue {
    Binance,
    Kraken,
}

/// Bid side of an order book as `(price, size)` levels
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderBook {
    pub bids: Vec<(f64, f64)>,
}

impl OrderBook {
    /// Sum of `price * size` over bids priced at or above `floor`, roughly the
    /// ETH obtainable selling into the book without going below `floor`.
    /// A non-positive floor sums the whole book.
    pub fn depth_at_or_above(&self, floor: f64) -> f64 {
        self.bids
            .iter()
            .filter(|(price, _)| floor <= 0.0 || *price >= floor)
            .map(|(price, size)| price * size)
            .sum()
    }
}

#[async_trait]
pub trait MarketProvider: Send + Sync {
    fn venue(&self) -> MarketVenue;

    /// Last traded price of the pair
    async fn ticker_price(&self) -> MonitorResult<f64>;

    async fn order_book(&self) -> MonitorResult<OrderBook>;
}

/// One venue's view at poll time. Missing values mean that fetch failed.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketSnapshot {
    pub venue: MarketVenue,
    pub price: Option<f64>,
    pub depth: Option<f64>,
}

pub struct MarketDataAggregator {
    providers: Vec<Box<dyn MarketProvider>>,
    call_timeout: Duration,
}

impl MarketDataAggregator {
    pub fn new(providers: Vec<Box<dyn MarketProvider>>, call_timeout: Duration) -> Self {
        Self { providers, call_timeout }
    }

    /// Providers for `venues`, in that order, sharing one HTTP timeout
    pub fn for_venues(venues: &[MarketVenue], timeout: Duration) -> MonitorResult<Self> {
        let providers = venues
            .iter()
            .map(|venue| {
                let provider: Box<dyn MarketProvider> = match venue {
                    MarketVenue::Binance => Box::new(BinanceProvider::new(timeout)?),
                    MarketVenue::Kraken => Box::new(KrakenProvider::new(timeout)?),
                };
                Ok(provider)
            })
            .collect::<MonitorResult<Vec<_>>>()?;
        Ok(Self::new(providers, timeout))
    }

    pub fn venues(&self) -> Vec<MarketVenue> {
        self.providers.iter().map(|p| p.venue()).collect()
    }

    /// Price from the first venue that answers, `None` when all fail
    pub async fn fetch_price(&self) -> Option<f64> {
        let prices = join_all(self.providers.iter().map(|p| self.price_of(p.as_ref()))).await;
        prices.into_iter().flatten().next()
    }

    /// Depth from the first venue that answers, `None` when all fail
    pub async fn fetch_depth_at_or_above(&self, floor: f64) -> Option<f64> {
        let depths = join_all(self.providers.iter().map(|p| self.depth_of(p.as_ref(), floor))).await;
        depths.into_iter().flatten().next()
    }

    /// Price and depth from every venue, queried concurrently
    pub async fn poll(&self, floor: f64) -> Vec<MarketSnapshot> {
        join_all(self.providers.iter().map(|provider| async move {
            let (price, depth) = tokio::join!(
                self.price_of(provider.as_ref()),
                self.depth_of(provider.as_ref(), floor)
            );
            MarketSnapshot { venue: provider.venue(), price, depth }
        }))
        .await
    }

    async fn price_of(&self, provider: &dyn MarketProvider) -> Option<f64> {
        match bounded(self.call_timeout, provider.ticker_price()).await {
            Ok(price) => {
                debug!("{} price {}", provider.venue(), price);
                Some(price)
            }
            Err(e) => {
                warn!("{} error: could not fetch market price: {}", provider.venue(), e);
                None
            }
        }
    }

    async fn depth_of(&self, provider: &dyn MarketProvider, floor: f64) -> Option<f64> {
        match bounded(self.call_timeout, provider.order_book()).await {
            Ok(book) => Some(book.depth_at_or_above(floor)),
            Err(e) => {
                warn!("{} error: could not fetch market depth: {}", provider.venue(), e);
                None
            }
        }
    }
}

/// First snapshot (in venue order) that carries a price
pub fn primary(snapshots: &[MarketSnapshot]) -> Option<&MarketSnapshot> {
    snapshots.iter().find(|s| s.price.is_some())
}

/// Parse a number sent either as a JSON string or a JSON number
pub(crate) fn parse_number(value: &Value) -> MonitorResult<f64> {
    let parsed = match value {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    };
    parsed
        .filter(|n| n.is_finite())
        .ok_or_else(|| MonitorError::TransientFetch(format!("not a number: {}", value)))
}

/// `[[price, size, ...], ...]` levels into `(price, size)` pairs
pub(crate) fn parse_levels(levels: &[Vec<Value>]) -> MonitorResult<Vec<(f64, f64)>> {
    levels
        .iter()
        .map(|level| match level.as_slice() {
            [price, size, ..] => Ok((parse_number(price)?, parse_number(size)?)),
            _ => Err(MonitorError::TransientFetch(format!("short order book level: {:?}", level))),
        })
        .collect()
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawLevels {
    pub bids: Vec<Vec<Value>>,
}
