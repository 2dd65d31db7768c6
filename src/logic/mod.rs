/// Logic Layer - Reconciliation Engine
///
/// This layer is responsible for:
/// - Keeping the crowdsale, market and pending contribution view in one state
/// - Deciding when a price movement is worth a status line
/// - Profit, potential price and trend computation
/// - Diagnostics (gas prices per block, day-over-day contribution pace)

pub mod reconciliation;
pub mod report;
pub mod types;

// Re-export key components from the logic layer
pub use reconciliation::ReconciliationEngine;
pub use report::{ChannelReportSink, Report, ReportSink, TracingReportSink};
pub use types::{Diagnostic, ReconciliationState, StatusReport, Trend};
