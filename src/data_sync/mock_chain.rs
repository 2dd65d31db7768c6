//! Deterministic in-memory chain used by the tests and benches.

use crate::data_sync::crowdsale::ICrowdsale;
use crate::data_sync::rpc::{BlockRef, BlockTransactions, ChainBlock, ChainClient, ChainTransaction};
use crate::error::{MonitorError, MonitorResult};
use alloy_primitives::{Address, B256, Bytes, U256};
use alloy_sol_types::SolCall;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Schedule = Arc<dyn Fn(u64) -> u64 + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
struct SaleState {
    today: U256,
    total: U256,
}

pub struct MockChainClient {
    head: AtomicU64,
    /// timestamp for block numbers without an explicit override
    schedule: Schedule,
    timestamps: DashMap<u64, u64>,
    block_transactions: DashMap<u64, Vec<ChainTransaction>>,
    mempool: DashMap<B256, ChainTransaction>,
    // keyed by the first block the state applies to
    sale_history: Mutex<BTreeMap<u64, SaleState>>,
    fail_all: AtomicBool,
    fail_daily_totals: AtomicBool,
    block_fetches: AtomicU64,
    call_count: AtomicU64,
    calls_at: DashMap<BlockRef, u64>,
}

impl MockChainClient {
    /// Chain whose block `n` is exactly `block_time` seconds after block `n - 1`
    pub fn linear(head: u64, head_timestamp: u64, block_time: u64) -> Self {
        Self::with_schedule(head, move |n| {
            head_timestamp.saturating_sub(head.saturating_sub(n) * block_time)
        })
    }

    /// Chain alternating `short` and `long` block intervals, walking back from the head
    pub fn alternating(head: u64, head_timestamp: u64, short: u64, long: u64) -> Self {
        Self::with_schedule(head, move |n| {
            let distance = head.saturating_sub(n);
            let back = (distance / 2) * (short + long) + (distance % 2) * short;
            head_timestamp.saturating_sub(back)
        })
    }

    pub fn with_schedule(head: u64, schedule: impl Fn(u64) -> u64 + Send + Sync + 'static) -> Self {
        Self {
            head: AtomicU64::new(head),
            schedule: Arc::new(schedule),
            timestamps: DashMap::new(),
            block_transactions: DashMap::new(),
            mempool: DashMap::new(),
            sale_history: Mutex::new(BTreeMap::new()),
            fail_all: AtomicBool::new(false),
            fail_daily_totals: AtomicBool::new(false),
            block_fetches: AtomicU64::new(0),
            call_count: AtomicU64::new(0),
            calls_at: DashMap::new(),
        }
    }

    pub fn head(&self) -> u64 {
        self.head.load(Ordering::SeqCst)
    }

    pub fn timestamp_of(&self, number: u64) -> u64 {
        self.timestamps
            .get(&number)
            .map(|ts| *ts)
            .unwrap_or_else(|| (self.schedule)(number))
    }

    /// Append a block at `timestamp` carrying `transactions`, returns its number
    pub fn push_block(&self, timestamp: u64, transactions: Vec<ChainTransaction>) -> u64 {
        let number = self.head.fetch_add(1, Ordering::SeqCst) + 1;
        self.timestamps.insert(number, timestamp);
        for tx in &transactions {
            self.mempool.remove(&tx.hash);
        }
        self.block_transactions.insert(number, transactions);
        number
    }

    pub fn set_block_transactions(&self, number: u64, transactions: Vec<ChainTransaction>) {
        self.block_transactions.insert(number, transactions);
    }

    pub fn add_pending(&self, tx: ChainTransaction) {
        self.mempool.insert(tx.hash, tx);
    }

    /// From block `from_block` on, the sale reports `today` with `total` contributed
    pub fn set_sale_state(&self, from_block: u64, today: u64, total: U256) {
        self.set_raw_sale_state(from_block, U256::from(today), total);
    }

    /// Like `set_sale_state`, with a day word that need not fit a `u64`
    pub fn set_raw_sale_state(&self, from_block: u64, today: U256, total: U256) {
        if let Ok(mut history) = self.sale_history.lock() {
            history.insert(from_block, SaleState { today, total });
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    pub fn set_daily_totals_failing(&self, failing: bool) {
        self.fail_daily_totals.store(failing, Ordering::SeqCst);
    }

    pub fn block_fetches(&self) -> u64 {
        self.block_fetches.load(Ordering::SeqCst)
    }

    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Number of contract calls evaluated at `block`
    pub fn calls_at(&self, block: BlockRef) -> u64 {
        self.calls_at.get(&block).map(|c| *c).unwrap_or(0)
    }

    fn check_failing(&self) -> MonitorResult<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(MonitorError::TransientFetch("mock chain unavailable".to_string()));
        }
        Ok(())
    }

    fn sale_state_at(&self, block: u64) -> SaleState {
        self.sale_history
            .lock()
            .ok()
            .and_then(|history| history.range(..=block).next_back().map(|(_, state)| *state))
            .unwrap_or_default()
    }

    fn daily_total_at(&self, block: u64, day: U256) -> U256 {
        let Ok(history) = self.sale_history.lock() else {
            return U256::ZERO;
        };
        history
            .range(..=block)
            .rev()
            .find(|(_, state)| state.today == day)
            .map(|(_, state)| state.total)
            .unwrap_or(U256::ZERO)
    }
}

fn encode_word(value: U256) -> Bytes {
    Bytes::from(value.to_be_bytes::<32>().to_vec())
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn block_number(&self) -> MonitorResult<u64> {
        self.check_failing()?;
        Ok(self.head())
    }

    async fn block(&self, number: u64, full_transactions: bool) -> MonitorResult<ChainBlock> {
        self.check_failing()?;
        self.block_fetches.fetch_add(1, Ordering::SeqCst);

        if number > self.head() {
            return Err(MonitorError::BlockNotFound(number));
        }

        let txs = self
            .block_transactions
            .get(&number)
            .map(|txs| txs.clone())
            .unwrap_or_default();
        let transactions = if full_transactions {
            BlockTransactions::Full(txs)
        } else {
            BlockTransactions::Hashes(txs.iter().map(|tx| tx.hash).collect())
        };

        Ok(ChainBlock {
            number,
            timestamp: self.timestamp_of(number),
            transactions,
        })
    }

    async fn transaction(&self, hash: B256) -> MonitorResult<Option<ChainTransaction>> {
        self.check_failing()?;
        Ok(self.mempool.get(&hash).map(|tx| tx.clone()))
    }

    async fn call(&self, _to: Address, data: Bytes, block: BlockRef) -> MonitorResult<Bytes> {
        self.check_failing()?;
        self.call_count.fetch_add(1, Ordering::SeqCst);
        *self.calls_at.entry(block).or_insert(0) += 1;

        let number = match block {
            BlockRef::Latest => self.head(),
            BlockRef::Number(n) => n,
        };

        if data.len() < 4 {
            return Err(MonitorError::TransientFetch("calldata too short".to_string()));
        }
        let selector = &data[..4];

        if selector == ICrowdsale::todayCall::SELECTOR {
            return Ok(encode_word(self.sale_state_at(number).today));
        }

        if selector == ICrowdsale::dailyTotalsCall::SELECTOR {
            if self.fail_daily_totals.load(Ordering::SeqCst) {
                return Err(MonitorError::TransientFetch("dailyTotals reverted".to_string()));
            }
            if data.len() < 36 {
                return Err(MonitorError::TransientFetch("dailyTotals calldata too short".to_string()));
            }
            let day = U256::from_be_slice(&data[4..36]);
            return Ok(encode_word(self.daily_total_at(number, day)));
        }

        Err(MonitorError::TransientFetch("unknown selector".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_schedule() {
        let chain = MockChainClient::linear(1_000, 100_000, 15);
        assert_eq!(chain.timestamp_of(1_000), 100_000);
        assert_eq!(chain.timestamp_of(999), 99_985);
        assert_eq!(chain.timestamp_of(0), 85_000);
    }

    #[test]
    fn test_alternating_schedule_is_monotonic() {
        let chain = MockChainClient::alternating(1_000, 100_000, 12, 18);
        assert_eq!(chain.timestamp_of(999), 99_988);
        assert_eq!(chain.timestamp_of(998), 99_970);
        for n in 1..=1_000 {
            assert!(chain.timestamp_of(n - 1) <= chain.timestamp_of(n));
        }
    }

    #[tokio::test]
    async fn test_push_block_advances_head() {
        let chain = MockChainClient::linear(10, 1_000, 15);
        let number = chain.push_block(1_020, vec![]);
        assert_eq!(number, 11);
        assert_eq!(chain.block_number().await.unwrap(), 11);
        assert_eq!(chain.block(11, false).await.unwrap().timestamp, 1_020);
        assert!(matches!(chain.block(12, false).await, Err(MonitorError::BlockNotFound(12))));
    }
}
