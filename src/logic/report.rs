use super::types::{Diagnostic, ReconciliationState, ReportedMetrics, StatusReport, Trend};
use crate::utils::constants::WEI_PER_GWEI;
use tokio::sync::mpsc;
use tracing::info;

/// Where status lines and diagnostics end up
pub trait ReportSink: Send + Sync {
    fn emit_status(&self, report: &StatusReport);

    fn emit_diagnostic(&self, diagnostic: &Diagnostic);
}

/// Writes every line through `tracing` at info level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReportSink;

impl ReportSink for TracingReportSink {
    fn emit_status(&self, report: &StatusReport) {
        info!("{}", report);
    }

    fn emit_diagnostic(&self, diagnostic: &Diagnostic) {
        info!("{}", diagnostic);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    Status(StatusReport),
    Diagnostic(Diagnostic),
}

/// Forwards reports into a channel, for embedding the engine in another consumer
#[derive(Debug, Clone)]
pub struct ChannelReportSink {
    sender: mpsc::UnboundedSender<Report>,
}

impl ChannelReportSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Report>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ReportSink for ChannelReportSink {
    fn emit_status(&self, report: &StatusReport) {
        // a dropped receiver just means nobody is listening anymore
        let _ = self.sender.send(Report::Status(report.clone()));
    }

    fn emit_diagnostic(&self, diagnostic: &Diagnostic) {
        let _ = self.sender.send(Report::Diagnostic(diagnostic.clone()));
    }
}

/// Premium of the market over `price`, in percent
pub fn profit_pct(market_price: f64, price: f64) -> Option<f64> {
    if price > 0.0 {
        Some(market_price * 100.0 / price - 100.0)
    } else {
        None
    }
}

/// Min, median and max of `gas_prices` (wei) in gwei. The median of an even
/// count is the mean of the two middle values.
pub fn gas_percentiles(gas_prices: &[u128]) -> Option<(f64, f64, f64)> {
    let mut sorted = gas_prices.to_vec();
    sorted.sort_unstable();

    let gwei = |wei: u128| wei as f64 / WEI_PER_GWEI;
    let min = *sorted.first()?;
    let max = *sorted.last()?;
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (gwei(sorted[mid - 1]) + gwei(sorted[mid])) / 2.0
    } else {
        gwei(sorted[mid])
    };

    Some((gwei(min), median, gwei(max)))
}

/// Build the next status line and remember its metrics for the following one.
///
/// `pending_price` is the pending contribution value divided by the daily cap.
pub fn build_status(state: &mut ReconciliationState, pending_price: f64, time: String) -> StatusReport {
    let crowdsale_price = state.crowdsale_price.unwrap_or(0.0);
    let potential_price = crowdsale_price + pending_price;

    let (profit, potential_profit) = match (state.market_price, state.crowdsale_price) {
        (Some(market), Some(price)) => (profit_pct(market, price), profit_pct(market, potential_price)),
        _ => (None, None),
    };

    let previous = state.last_reported.unwrap_or_default();
    let report = StatusReport {
        time,
        day: state.day,
        crowdsale_price,
        crowdsale_trend: Trend::between(previous.crowdsale_price, state.crowdsale_price),
        potential_price,
        market_depth: state.market_depth,
        market_venue: state.market_venue,
        market_price: state.market_price,
        market_trend: Trend::between(previous.market_price, state.market_price),
        profit_pct: profit,
        profit_trend: Trend::between(previous.profit_pct, profit),
        potential_profit_pct: potential_profit,
    };

    // an unknown price stays unknown, not 0.0, for the next comparison
    state.last_reported = Some(ReportedMetrics {
        crowdsale_price: state.crowdsale_price,
        market_price: state.market_price,
        profit_pct: profit,
    });
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profit_pct() {
        assert!((profit_pct(1.2, 1.0).unwrap() - 20.0).abs() < 1e-9);
        assert!((profit_pct(1.2, 1.1).unwrap() - 9.090909).abs() < 1e-5);
        assert!((profit_pct(0.8, 1.0).unwrap() + 20.0).abs() < 1e-9);
        assert_eq!(profit_pct(1.2, 0.0), None);
    }

    #[test]
    fn test_gas_percentiles() {
        let gwei = 1_000_000_000u128;
        assert_eq!(gas_percentiles(&[]), None);
        assert_eq!(gas_percentiles(&[5 * gwei]), Some((5.0, 5.0, 5.0)));
        assert_eq!(gas_percentiles(&[50 * gwei, gwei, 20 * gwei]), Some((1.0, 20.0, 50.0)));
        assert_eq!(gas_percentiles(&[4 * gwei, 2 * gwei, 8 * gwei, 6 * gwei]), Some((2.0, 5.0, 8.0)));
    }

    #[test]
    fn test_build_status_tracks_trends() {
        let mut state = ReconciliationState {
            day: Some(5),
            crowdsale_price: Some(1.0),
            market_price: Some(1.2),
            ..Default::default()
        };

        let first = build_status(&mut state, 0.0, "10:00:00".into());
        assert!((first.profit_pct.unwrap() - 20.0).abs() < 1e-9);
        assert_eq!(first.crowdsale_trend, Trend::Unchanged);
        assert_eq!(first.profit_trend, Trend::Unchanged);

        state.crowdsale_price = Some(1.1);
        let second = build_status(&mut state, 0.0, "10:00:10".into());
        assert!((second.profit_pct.unwrap() - 9.09).abs() < 0.01);
        assert_eq!(second.crowdsale_trend, Trend::Increased);
        assert_eq!(second.market_trend, Trend::Unchanged);
        assert_eq!(second.profit_trend, Trend::Decreased);
    }

    #[test]
    fn test_potential_price_folds_in_pending() {
        let mut state = ReconciliationState {
            crowdsale_price: Some(1.0),
            market_price: Some(1.5),
            ..Default::default()
        };

        let report = build_status(&mut state, 0.25, "10:00:00".into());
        assert_eq!(report.potential_price, 1.25);
        assert!((report.potential_profit_pct.unwrap() - 20.0).abs() < 1e-9);
        assert!((report.profit_pct.unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_profit_without_both_prices() {
        let mut state = ReconciliationState { market_price: Some(1.5), ..Default::default() };
        let report = build_status(&mut state, 0.0, "10:00:00".into());
        assert_eq!(report.profit_pct, None);
        assert_eq!(report.potential_profit_pct, None);
    }

    #[test]
    fn test_first_known_crowdsale_price_has_no_trend() {
        let mut state = ReconciliationState { market_price: Some(1.2), ..Default::default() };
        let before = build_status(&mut state, 0.0, "10:00:00".into());
        assert_eq!(before.crowdsale_price, 0.0);
        assert_eq!(state.last_reported.unwrap().crowdsale_price, None);

        state.crowdsale_price = Some(1.0);
        let after = build_status(&mut state, 0.0, "10:00:10".into());
        assert_eq!(after.crowdsale_trend, Trend::Unchanged);
        assert_eq!(after.profit_trend, Trend::Unchanged);

        state.crowdsale_price = Some(1.1);
        let next = build_status(&mut state, 0.0, "10:00:20".into());
        assert_eq!(next.crowdsale_trend, Trend::Increased);
        assert_eq!(next.profit_trend, Trend::Decreased);
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_reports() {
        let (sink, mut receiver) = ChannelReportSink::new();
        let diagnostic = Diagnostic::GasPrices { block: 1, min: 1.0, median: 1.0, max: 1.0 };
        sink.emit_diagnostic(&diagnostic);

        assert_eq!(receiver.recv().await, Some(Report::Diagnostic(diagnostic)));
    }
}
