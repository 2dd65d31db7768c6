use crate::data_sync::rpc::{BlockRef, ChainClient};
use crate::error::{MonitorError, MonitorResult};
use crate::utils::units::{ratio, wei_to_eth};
use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::{SolCall, sol};
use std::sync::Arc;
use tracing::debug;

sol! {
    /// Read side of the daily-window token sale
    interface ICrowdsale {
        function today() external view returns (uint256);
        function dailyTotals(uint256 day) external view returns (uint256);
    }
}

/// Sale window and the wei contributed to it, read at one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrowdsaleSnapshot {
    pub day: u64,
    pub daily_total: U256,
    /// Block both reads were evaluated at
    pub block: u64,
}

impl CrowdsaleSnapshot {
    /// ETH per token implied by the window's contributions
    pub fn implied_price(&self, daily_cap: U256) -> f64 {
        ratio(self.daily_total, daily_cap)
    }

    pub fn contributed_eth(&self) -> f64 {
        wei_to_eth(self.daily_total)
    }
}

/// Reads the sale contract's day counter and daily contribution total
pub struct CrowdsaleOracle<C> {
    chain: Arc<C>,
    sale_address: Address,
    daily_cap: U256,
    /// Last day index seen at the chain head. Historical reads never touch it.
    today: Option<u64>,
}

impl<C: ChainClient> CrowdsaleOracle<C> {
    pub fn new(chain: Arc<C>, sale_address: Address, daily_cap: U256) -> Self {
        Self {
            chain,
            sale_address,
            daily_cap,
            today: None,
        }
    }

    pub fn today(&self) -> Option<u64> {
        self.today
    }

    pub fn daily_cap(&self) -> U256 {
        self.daily_cap
    }

    /// Read `today()` then `dailyTotals(today)` at the same block.
    ///
    /// `Latest` is pinned to the current head number first so both reads see
    /// one state. Any failing step discards the whole snapshot.
    pub async fn read_snapshot(&mut self, block: BlockRef) -> MonitorResult<CrowdsaleSnapshot> {
        let number = match block {
            BlockRef::Latest => self
                .chain
                .block_number()
                .await
                .map_err(|e| MonitorError::abort("blockNumber", e))?,
            BlockRef::Number(n) => n,
        };
        let at = BlockRef::Number(number);

        let day_word = self
            .call_word(ICrowdsale::todayCall {}.abi_encode(), at)
            .await
            .map_err(|e| MonitorError::abort("today", e))?;
        let day = u64::try_from(day_word).map_err(|_| {
            let reason = format!("day index {} out of range", day_word);
            MonitorError::abort("today", MonitorError::TransientFetch(reason))
        })?;

        let daily_total = self
            .call_word(ICrowdsale::dailyTotalsCall { day: day_word }.abi_encode(), at)
            .await
            .map_err(|e| MonitorError::abort("dailyTotals", e))?;

        if block.is_latest() {
            self.today = Some(day);
        }

        debug!("Crowdsale at {}: day {} total {} wei", at, day, daily_total);
        Ok(CrowdsaleSnapshot { day, daily_total, block: number })
    }

    async fn call_word(&self, calldata: Vec<u8>, block: BlockRef) -> MonitorResult<U256> {
        let output = self.chain.call(self.sale_address, Bytes::from(calldata), block).await?;
        decode_word(&output)
    }
}

/// First 32-byte word of an ABI-encoded return value
fn decode_word(output: &[u8]) -> MonitorResult<U256> {
    if output.len() < 32 {
        return Err(MonitorError::TransientFetch(format!(
            "expected a 32 byte word, got {} bytes",
            output.len()
        )));
    }
    Ok(U256::from_be_slice(&output[..32]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_sync::mock_chain::MockChainClient;
    use crate::utils::constants::{DAILY_CAP_WEI, EOS_SALE, WEI_PER_ETH_U128};

    fn eth(amount: u128) -> U256 {
        U256::from(amount * WEI_PER_ETH_U128)
    }

    fn setup() -> (Arc<MockChainClient>, CrowdsaleOracle<MockChainClient>) {
        let chain = Arc::new(MockChainClient::linear(1_000, 1_500_000_000, 15));
        chain.set_sale_state(0, 100, eth(10_000));
        chain.set_sale_state(900, 101, eth(2_000));
        chain.set_sale_state(950, 101, eth(30_000));
        let oracle = CrowdsaleOracle::new(Arc::clone(&chain), EOS_SALE, U256::from(DAILY_CAP_WEI));
        (chain, oracle)
    }

    #[test]
    fn test_calldata_selectors() {
        let today = ICrowdsale::todayCall {}.abi_encode();
        assert_eq!(today.len(), 4);

        let daily = ICrowdsale::dailyTotalsCall { day: U256::from(7) }.abi_encode();
        assert_eq!(daily.len(), 36);
        assert_eq!(U256::from_be_slice(&daily[4..]), U256::from(7));
    }

    #[test]
    fn test_decode_word() {
        let word = U256::from(123_456).to_be_bytes::<32>();
        assert_eq!(decode_word(&word).unwrap(), U256::from(123_456));
        assert!(decode_word(&word[..10]).is_err());
    }

    #[tokio::test]
    async fn test_latest_snapshot_updates_today() {
        let (chain, mut oracle) = setup();
        assert_eq!(oracle.today(), None);

        let snapshot = oracle.read_snapshot(BlockRef::Latest).await.unwrap();
        assert_eq!(snapshot.day, 101);
        assert_eq!(snapshot.daily_total, eth(30_000));
        assert_eq!(snapshot.block, 1_000);
        assert_eq!(oracle.today(), Some(101));
        // both reads pinned to the head number
        assert_eq!(chain.calls_at(BlockRef::Number(1_000)), 2);
        assert_eq!(chain.calls_at(BlockRef::Latest), 0);

        assert!((snapshot.implied_price(oracle.daily_cap()) - 0.015).abs() < 1e-12);
        assert_eq!(snapshot.contributed_eth(), 30_000.0);
    }

    #[tokio::test]
    async fn test_historical_reads_do_not_touch_today() {
        let (_chain, mut oracle) = setup();

        let historical = oracle.read_snapshot(BlockRef::Number(500)).await.unwrap();
        assert_eq!(historical.day, 100);
        assert_eq!(historical.daily_total, eth(10_000));
        assert_eq!(oracle.today(), None);

        oracle.read_snapshot(BlockRef::Latest).await.unwrap();
        assert_eq!(oracle.today(), Some(101));

        let historical = oracle.read_snapshot(BlockRef::Number(920)).await.unwrap();
        assert_eq!(historical.day, 101);
        assert_eq!(historical.daily_total, eth(2_000));

        oracle.read_snapshot(BlockRef::Number(10)).await.unwrap();
        assert_eq!(oracle.today(), Some(101));
    }

    #[tokio::test]
    async fn test_partial_read_is_discarded() {
        let (chain, mut oracle) = setup();
        chain.set_daily_totals_failing(true);

        let err = oracle.read_snapshot(BlockRef::Latest).await.unwrap_err();
        assert!(matches!(err, MonitorError::PartialReadAbort { step: "dailyTotals", .. }));
        assert!(err.is_transient());
        assert_eq!(oracle.today(), None);
    }

    #[tokio::test]
    async fn test_chain_failure_aborts_snapshot() {
        let (chain, mut oracle) = setup();
        chain.set_failing(true);

        let err = oracle.read_snapshot(BlockRef::Number(10)).await.unwrap_err();
        assert!(matches!(err, MonitorError::PartialReadAbort { step: "today", .. }));
    }

    #[tokio::test]
    async fn test_oversized_day_index_aborts_snapshot() {
        let (chain, mut oracle) = setup();
        chain.set_raw_sale_state(990, U256::from(u64::MAX) + U256::from(1), eth(1));

        let err = oracle.read_snapshot(BlockRef::Latest).await.unwrap_err();
        assert!(matches!(err, MonitorError::PartialReadAbort { step: "today", .. }));
        assert!(err.to_string().contains("out of range"));
        assert_eq!(oracle.today(), None);
    }
}
