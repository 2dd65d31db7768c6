/// Data Synchronization Layer
///
/// Everything that talks to the outside world:
///
/// - WebSocket subscriptions for new blocks and pending transactions
/// - JSON-RPC reads of blocks, transactions and the sale contract
/// - The sparse block-time index used to find yesterday's block
/// - Mempool tracking of contributions that have not confirmed yet
/// - Exchange price and order book polling

pub mod block_time;
pub mod config;
pub mod crowdsale;
pub mod market;
pub mod mock_chain;
pub mod pending;
pub mod rpc;
pub mod websocket;


// Re-export main components for easy usage
pub use block_time::BlockTimeIndex;
pub use config::MonitorConfig;
pub use crowdsale::{CrowdsaleOracle, CrowdsaleSnapshot};
pub use market::{MarketDataAggregator, MarketProvider, MarketSnapshot, MarketVenue, OrderBook};
pub use mock_chain::MockChainClient;
pub use pending::PendingContributionTracker;
pub use rpc::{BlockRef, ChainBlock, ChainClient, ChainTransaction, RpcChainClient};
pub use websocket::{BlockHeader, SubscriptionManager, Subscriptions};
