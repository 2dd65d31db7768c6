use crate::data_sync::market::MarketVenue;
use std::fmt;
use strum_macros::Display;

/// Direction of a metric against its previously reported value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Trend {
    Increased,
    Decreased,
    #[default]
    Unchanged,
}

impl Trend {
    /// Three-way comparison; a missing value on either side is `Unchanged`
    pub fn between(previous: Option<f64>, current: Option<f64>) -> Self {
        match (previous, current) {
            (Some(prev), Some(curr)) if curr > prev => Trend::Increased,
            (Some(prev), Some(curr)) if curr < prev => Trend::Decreased,
            _ => Trend::Unchanged,
        }
    }

    pub fn arrow(&self) -> &'static str {
        match self {
            Trend::Increased => "↑",
            Trend::Decreased => "↓",
            Trend::Unchanged => "=",
        }
    }
}

/// Values a status line was computed from, kept to derive the next line's trends
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReportedMetrics {
    pub crowdsale_price: Option<f64>,
    pub market_price: Option<f64>,
    pub profit_pct: Option<f64>,
}

/// Everything the engine knows between handler invocations.
///
/// Owned by the engine and only mutated from its dispatch loop.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationState {
    /// Sale day index from the latest head read
    pub day: Option<u64>,
    /// ETH per token implied by today's contributions
    pub crowdsale_price: Option<f64>,
    pub market_price: Option<f64>,
    pub market_venue: Option<MarketVenue>,
    /// ETH of bids at or above the crowdsale price
    pub market_depth: Option<f64>,
    /// Largest prior-day contribution (ETH) a comparison has been shown for
    pub prev_eth_contrib: Option<f64>,
    pub last_reported: Option<ReportedMetrics>,
}

/// One formatted status line
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    /// Local wall clock, `HH:MM:SS`
    pub time: String,
    pub day: Option<u64>,
    pub crowdsale_price: f64,
    pub crowdsale_trend: Trend,
    /// Crowdsale price once pending contributions confirm
    pub potential_price: f64,
    pub market_depth: Option<f64>,
    /// Venue the market price was taken from
    pub market_venue: Option<MarketVenue>,
    pub market_price: Option<f64>,
    pub market_trend: Trend,
    pub profit_pct: Option<f64>,
    pub profit_trend: Trend,
    pub potential_profit_pct: Option<f64>,
}

fn or_unknown(value: Option<String>) -> String {
    value.unwrap_or_else(|| "?".to_string())
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} crowdsale #{}: {:.8} {} [~ {:.8}], depth: {} eth, market ({}): {} {}, profit%: {} {} [~ {}]",
            self.time,
            or_unknown(self.day.map(|d| d.to_string())),
            self.crowdsale_price,
            self.crowdsale_trend.arrow(),
            self.potential_price,
            or_unknown(self.market_depth.map(|d| format!("{:.0}", d))),
            or_unknown(self.market_venue.map(|v| v.to_string())),
            or_unknown(self.market_price.map(|p| format!("{:.8}", p))),
            self.market_trend.arrow(),
            or_unknown(self.profit_pct.map(|p| format!("{:.2}", p))),
            self.profit_trend.arrow(),
            or_unknown(self.potential_profit_pct.map(|p| format!("{:.2}", p))),
        )
    }
}

/// Lines that sit beside the status report
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// Gas prices of one block's transactions, in gwei
    GasPrices { block: u64, min: f64, median: f64, max: f64 },
    /// Today's contributions against the same hour of the previous window
    ReferenceComparison {
        current_eth: f64,
        previous_day: u64,
        previous_eth: f64,
        /// `current * 100 / previous`, `None` when nothing was contributed yet
        diff_pct: Option<f64>,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::GasPrices { block, min, median, max } => {
                write!(f, "block #{} gas (gwei) min: {:.2}, median: {:.2}, max: {:.2}", block, min, median, max)
            }
            Diagnostic::ReferenceComparison { current_eth, previous_day, previous_eth, diff_pct } => write!(
                f,
                "curr: {:.2} eth, prev ({}): {:.2} eth, diff% {}",
                current_eth,
                previous_day,
                previous_eth,
                or_unknown(diff_pct.map(|d| format!("{:.2}", d)))
            ),
        }
    }
}
