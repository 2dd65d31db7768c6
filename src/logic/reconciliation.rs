use super::report::{ReportSink, build_status, gas_percentiles};
use super::types::{Diagnostic, ReconciliationState};
use crate::data_sync::block_time::BlockTimeIndex;
use crate::data_sync::config::MonitorConfig;
use crate::data_sync::crowdsale::CrowdsaleOracle;
use crate::data_sync::market::{MarketDataAggregator, primary};
use crate::data_sync::pending::PendingContributionTracker;
use crate::data_sync::rpc::{BlockRef, ChainBlock, ChainClient};
use crate::data_sync::websocket::BlockHeader;
use crate::error::{MonitorResult, bounded};
use crate::utils::constants::REFERENCE_LOOKBACK_SECS;
use crate::utils::units::{ratio, wei_to_eth};
use alloy_primitives::{B256, U256};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// Ties the data layer together and decides when a report is due.
///
/// Four transitions mutate [`ReconciliationState`]: a new block, a sighted
/// pending transaction, the market timer and the reference timer. They are
/// dispatched from one loop in [`ReconciliationEngine::run`], so no two
/// handlers ever overlap and the state needs no locking.
pub struct ReconciliationEngine<C> {
    chain: Arc<C>,
    index: Arc<BlockTimeIndex<C>>,
    oracle: CrowdsaleOracle<C>,
    pending: PendingContributionTracker,
    market: MarketDataAggregator,
    sink: Box<dyn ReportSink>,
    state: ReconciliationState,
    /// Upper bound for every chain round trip made by a handler
    call_timeout: Duration,
    market_poll_interval: Duration,
    reference_interval: Duration,
}

impl<C: ChainClient + 'static> ReconciliationEngine<C> {
    pub fn new(
        config: &MonitorConfig,
        chain: Arc<C>,
        market: MarketDataAggregator,
        sink: Box<dyn ReportSink>,
    ) -> eyre::Result<Self> {
        let daily_cap = config.daily_cap()?;
        let index = Arc::new(BlockTimeIndex::with_sample_size(Arc::clone(&chain), config.avg_block_sample_size));
        let oracle = CrowdsaleOracle::new(Arc::clone(&chain), config.sale_address, daily_cap);

        Ok(Self {
            chain,
            index,
            oracle,
            pending: PendingContributionTracker::new(config.sale_address),
            market,
            sink,
            state: ReconciliationState::default(),
            call_timeout: config.http_timeout(),
            market_poll_interval: config.market_poll_interval(),
            reference_interval: config.reference_interval(),
        })
    }

    pub fn state(&self) -> &ReconciliationState {
        &self.state
    }

    pub fn index(&self) -> &Arc<BlockTimeIndex<C>> {
        &self.index
    }

    pub fn pending(&self) -> &PendingContributionTracker {
        &self.pending
    }

    /// Confirm the block's contributions, re-read the sale at the head and
    /// report the block's gas prices.
    pub async fn on_new_block(&mut self, number: u64) -> MonitorResult<()> {
        let block = bounded(self.call_timeout, self.chain.block(number, true)).await?;
        self.index.record(block.number, block.timestamp);

        let confirmed = self.pending.confirm(block.transactions.hashes().iter());
        if confirmed > 0 {
            debug!("Block #{} confirmed {} pending contributions", block.number, confirmed);
        }

        let refreshed = self.refresh_crowdsale_price().await;
        self.emit_gas_prices(&block);
        refreshed
    }

    /// Track a mempool transaction if it pays the sale. Never reports.
    pub async fn on_pending_transaction(&mut self, hash: B256) -> MonitorResult<()> {
        let Some(tx) = bounded(self.call_timeout, self.chain.transaction(hash)).await? else {
            return Ok(());
        };
        if self.pending.observe(tx.hash, tx.to, tx.value) {
            debug!("Pending contribution {} of {:.4} ETH", tx.hash, wei_to_eth(tx.value));
        }
        Ok(())
    }

    /// Poll every venue; report when the leading venue's price moved
    pub async fn on_market_tick(&mut self) {
        let floor = self.state.crowdsale_price.unwrap_or(0.0);
        let snapshots = self.market.poll(floor).await;
        for snapshot in &snapshots {
            debug!("{} price {:?} depth {:?}", snapshot.venue, snapshot.price, snapshot.depth);
        }

        let Some(leading) = primary(&snapshots) else {
            warn!("error: could not fetch market price from any venue");
            return;
        };

        self.state.market_depth = leading.depth;
        self.state.market_venue = Some(leading.venue);
        if self.state.market_price != leading.price {
            self.state.market_price = leading.price;
            self.emit_status();
        }
    }

    pub async fn on_reference_tick(&mut self) -> MonitorResult<()> {
        self.on_reference_tick_at(unix_now()).await
    }

    /// Compare today's contributions with the window 23 hours before `now`.
    ///
    /// Skips quietly while the index cannot resolve that time or no crowdsale
    /// price is known. A comparison is only shown once the index is warm and
    /// when the prior window's contribution is a new high-water mark.
    pub async fn on_reference_tick_at(&mut self, now: u64) -> MonitorResult<()> {
        let target = now.saturating_sub(REFERENCE_LOOKBACK_SECS);
        let block = match self.index.find_closest_block(target) {
            Ok(block) => block,
            Err(e) => {
                debug!("Reference comparison skipped: {}", e);
                return Ok(());
            }
        };
        let Some(price) = self.state.crowdsale_price else {
            return Ok(());
        };
        if !self.index.is_ready() {
            return Ok(());
        }

        let snapshot = bounded(self.call_timeout, self.oracle.read_snapshot(BlockRef::Number(block))).await?;
        let current_eth = price * wei_to_eth(self.oracle.daily_cap());
        let previous_eth = snapshot.contributed_eth();

        if self.state.prev_eth_contrib.is_some_and(|prev| prev >= previous_eth) {
            return Ok(());
        }
        self.state.prev_eth_contrib = Some(previous_eth);

        let diff_pct = (previous_eth > 0.0).then(|| current_eth * 100.0 / previous_eth);
        self.sink.emit_diagnostic(&Diagnostic::ReferenceComparison {
            current_eth,
            previous_day: snapshot.day,
            previous_eth,
            diff_pct,
        });
        Ok(())
    }

    /// Start warming the index for the reference time so the first comparison
    /// does not wait for a timer-triggered miss.
    pub fn warm_up(&self) {
        let target = unix_now().saturating_sub(REFERENCE_LOOKBACK_SECS);
        info!("Warming block time index for {}", target);
        self.index.schedule_rebuild(target);
    }

    /// Dispatch loop. Returns when the block feed closes or on shutdown.
    pub async fn run(
        mut self,
        mut blocks: mpsc::Receiver<BlockHeader>,
        mut pending: mpsc::Receiver<B256>,
        mut shutdown: mpsc::Receiver<()>,
    ) -> eyre::Result<()> {
        self.warm_up();

        let mut market_timer = interval(self.market_poll_interval);
        market_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reference_timer = interval(self.reference_interval);
        reference_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending_open = true;

        info!("Reconciliation engine started");

        loop {
            tokio::select! {
                header = blocks.recv() => {
                    let Some(header) = header else {
                        warn!("Block feed closed");
                        break;
                    };
                    match (header.block_number(), header.timestamp_secs()) {
                        (Ok(number), Ok(timestamp)) => {
                            self.index.record(number, timestamp);
                            if let Err(e) = self.on_new_block(number).await {
                                warn!("error: could not process block #{}: {}", number, e);
                            }
                        }
                        (Err(e), _) | (_, Err(e)) => warn!("Skipping malformed block header: {}", e),
                    }
                }

                hash = pending.recv(), if pending_open => {
                    match hash {
                        Some(hash) => {
                            if let Err(e) = self.on_pending_transaction(hash).await {
                                debug!("Could not fetch pending transaction {}: {}", hash, e);
                            }
                        }
                        None => {
                            warn!("Pending transaction feed closed");
                            pending_open = false;
                        }
                    }
                }

                _ = market_timer.tick() => self.on_market_tick().await,

                _ = reference_timer.tick() => {
                    if let Err(e) = self.on_reference_tick().await {
                        warn!("error: could not fetch reference price: {}", e);
                    }
                }

                Some(()) = shutdown.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        info!("Reconciliation engine stopped");
        Ok(())
    }

    async fn refresh_crowdsale_price(&mut self) -> MonitorResult<()> {
        let snapshot = bounded(self.call_timeout, self.oracle.read_snapshot(BlockRef::Latest)).await?;
        let price = snapshot.implied_price(self.oracle.daily_cap());
        self.state.day = Some(snapshot.day);

        if self.state.crowdsale_price != Some(price) {
            self.state.crowdsale_price = Some(price);
            self.emit_status();
        }
        Ok(())
    }

    fn emit_gas_prices(&self, block: &ChainBlock) {
        if let Some((min, median, max)) = gas_percentiles(&block.transactions.gas_prices()) {
            self.sink.emit_diagnostic(&Diagnostic::GasPrices { block: block.number, min, median, max });
        }
    }

    fn emit_status(&mut self) {
        let pending_price = self.pending_price();
        let time = chrono::Local::now().format("%H:%M:%S").to_string();
        let report = build_status(&mut self.state, pending_price, time);
        self.sink.emit_status(&report);
    }

    fn pending_price(&self) -> f64 {
        let total: U256 = self.pending.total();
        ratio(total, self.oracle.daily_cap())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
