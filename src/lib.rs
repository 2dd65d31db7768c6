// Layered Architecture
pub mod data_sync;  // Data Layer: chain reads, subscriptions, market polling
pub mod logic;      // Logic Layer: reconciliation state machine, reports

// Common utilities and types
pub mod error;
pub mod utils;

// Re-export key components from each layer
pub use data_sync::{
    BlockRef, BlockTimeIndex, ChainClient, CrowdsaleOracle, CrowdsaleSnapshot, MarketDataAggregator,
    MarketVenue, MonitorConfig, PendingContributionTracker, RpcChainClient, SubscriptionManager,
};
pub use error::{MonitorError, MonitorResult};
pub use logic::{ReconciliationEngine, ReportSink, StatusReport, TracingReportSink};
