//! Scriptable in-memory venue used by the tests and benches.

use super::{MarketProvider, MarketVenue, OrderBook};
use crate::error::{MonitorError, MonitorResult};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct MockMarketState {
    price: Option<f64>,
    book: Option<OrderBook>,
}

/// Clones share state, so a test can keep one handle and box the other
#[derive(Debug, Clone)]
pub struct MockMarketProvider {
    venue: MarketVenue,
    state: Arc<Mutex<MockMarketState>>,
}

impl MockMarketProvider {
    /// Venue with no price or book yet; both fetches fail until set
    pub fn new(venue: MarketVenue) -> Self {
        Self {
            venue,
            state: Arc::new(Mutex::new(MockMarketState::default())),
        }
    }

    pub fn with_price(venue: MarketVenue, price: f64, book: OrderBook) -> Self {
        let provider = Self::new(venue);
        provider.set_price(Some(price));
        provider.set_book(Some(book));
        provider
    }

    pub fn set_price(&self, price: Option<f64>) {
        if let Ok(mut state) = self.state.lock() {
            state.price = price;
        }
    }

    pub fn set_book(&self, book: Option<OrderBook>) {
        if let Ok(mut state) = self.state.lock() {
            state.book = book;
        }
    }

    pub fn boxed(&self) -> Box<dyn MarketProvider> {
        Box::new(self.clone())
    }
}

#[async_trait]
impl MarketProvider for MockMarketProvider {
    fn venue(&self) -> MarketVenue {
        self.venue
    }

    async fn ticker_price(&self) -> MonitorResult<f64> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.price)
            .ok_or_else(|| MonitorError::TransientFetch(format!("{} ticker unavailable", self.venue)))
    }

    async fn order_book(&self) -> MonitorResult<OrderBook> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.book.clone())
            .ok_or_else(|| MonitorError::TransientFetch(format!("{} order book unavailable", self.venue)))
    }
}
