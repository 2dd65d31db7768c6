use crate::data_sync::rpc::ChainClient;
use crate::error::{MonitorError, MonitorResult};
use crate::utils::constants::REFERENCE_LOOKBACK_SECS;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A candidate more than this many seconds before the target is "too early"
pub const OVERSHOOT_SECS: u64 = 600;
/// Backward correction step, in blocks
pub const BACKWARD_STRIDE: u64 = 10;
/// `find_closest_block` only accepts cached blocks this close to the target
pub const CLOSEST_TOLERANCE_SECS: u64 = 300;
/// Span cached after a successful locate. Rebuilds for targets closer than
/// this to one already running are coalesced into it.
pub const PREFETCH_WINDOW_SECS: u64 = 3600;
/// Entries older than this, relative to the newest recorded head, are dropped
pub const RETENTION_SECS: u64 = REFERENCE_LOOKBACK_SECS + 2 * PREFETCH_WINDOW_SECS;
pub const MAX_LOCATE_STEPS: usize = 10_000;
pub const DEFAULT_SAMPLE_SIZE: u64 = 100;

/// Sparse `block number -> timestamp` index.
///
/// Nodes have no timestamp index, so locating "the block around time T" is
/// done by extrapolating from an average block time and correcting against
/// fetched block timestamps. Every fetched timestamp is kept until it falls
/// out of the retention window, which makes later lookups near the same
/// time cheap.
pub struct BlockTimeIndex<C> {
    chain: Arc<C>,
    timestamps: DashMap<u64, u64>,
    avg_block_time: OnceCell<f64>,
    avg_computations: AtomicU64,
    sample_size: u64,
    ready: AtomicBool,
    /// Running rebuilds, `target / PREFETCH_WINDOW_SECS -> target`
    rebuilds_in_flight: DashMap<u64, u64>,
}

impl<C: ChainClient> BlockTimeIndex<C> {
    pub fn new(chain: Arc<C>) -> Self {
        Self::with_sample_size(chain, DEFAULT_SAMPLE_SIZE)
    }

    pub fn with_sample_size(chain: Arc<C>, sample_size: u64) -> Self {
        Self {
            chain,
            timestamps: DashMap::new(),
            avg_block_time: OnceCell::new(),
            avg_computations: AtomicU64::new(0),
            sample_size: sample_size.max(2),
            ready: AtomicBool::new(false),
            rebuilds_in_flight: DashMap::new(),
        }
    }

    /// Timestamp of `block_number`, fetched from the chain on first use.
    ///
    /// Concurrent misses on the same key may both fetch; both write the same
    /// value so the cache stays consistent.
    pub async fn cache_timestamp(&self, block_number: u64) -> MonitorResult<u64> {
        if let Some(ts) = self.timestamps.get(&block_number) {
            return Ok(*ts);
        }

        let block = self.chain.block(block_number, false).await?;
        self.timestamps.insert(block_number, block.timestamp);
        Ok(block.timestamp)
    }

    /// Record a timestamp already known from elsewhere (e.g. a new head) and
    /// drop entries that fell out of the retention window behind it.
    pub fn record(&self, block_number: u64, timestamp: u64) {
        self.timestamps.insert(block_number, timestamp);

        let cutoff = timestamp.saturating_sub(RETENTION_SECS);
        if cutoff > 0 {
            self.timestamps.retain(|_, ts| *ts >= cutoff);
        }
    }

    pub fn cached(&self, block_number: u64) -> Option<u64> {
        self.timestamps.get(&block_number).map(|ts| *ts)
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// True once a locate and its trailing prefetch have completed
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Cached average, `None` before the first estimate
    pub fn average_block_time(&self) -> Option<f64> {
        self.avg_block_time.get().copied()
    }

    /// How many times the sample walk actually ran
    pub fn avg_computations(&self) -> u64 {
        self.avg_computations.load(Ordering::SeqCst)
    }

    /// Mean seconds per block over the `sample_size` blocks below the head.
    ///
    /// Computed once and kept for the lifetime of the index. A failed sample
    /// leaves the cell empty so the next caller retries.
    pub async fn estimate_average_block_time(&self) -> MonitorResult<f64> {
        self.avg_block_time
            .get_or_try_init(|| self.sample_average_block_time())
            .await
            .copied()
    }

    async fn sample_average_block_time(&self) -> MonitorResult<f64> {
        self.avg_computations.fetch_add(1, Ordering::SeqCst);

        let head = self.chain.block_number().await?;
        let lowest = head.saturating_sub(self.sample_size - 1);

        let mut deltas = Vec::with_capacity(self.sample_size as usize);
        let mut last_timestamp: Option<u64> = None;
        for number in (lowest..=head).rev() {
            let ts = self.cache_timestamp(number).await?;
            if let Some(last) = last_timestamp {
                deltas.push(last.saturating_sub(ts));
            }
            last_timestamp = Some(ts);
        }

        if deltas.is_empty() {
            return Err(MonitorError::InsufficientHistory(format!(
                "need at least 2 blocks to sample, head is {}",
                head
            )));
        }

        let avg = deltas.iter().sum::<u64>() as f64 / deltas.len() as f64;
        if avg <= 0.0 {
            return Err(MonitorError::InsufficientHistory(format!(
                "blocks {}..={} share one timestamp",
                lowest, head
            )));
        }

        info!("Average block time {:.2}s over {} blocks below #{}", avg, deltas.len() + 1, head);
        Ok(avg)
    }

    /// Find a block whose timestamp lies in `[target - OVERSHOOT_SECS, target]`.
    ///
    /// Seeds a candidate by extrapolating back from the head, jumps forward by
    /// the estimated gap when the candidate is too early, and steps back by
    /// `BACKWARD_STRIDE` when it is after the target. Known too-early and
    /// too-late candidates bound the search so it cannot oscillate. On success
    /// the hour following the found block is cached.
    pub async fn locate_block_at_or_before(&self, target: u64) -> MonitorResult<u64> {
        let avg = self.estimate_average_block_time().await?;
        let head = self.chain.block_number().await?;
        let now = self.cache_timestamp(head).await?;

        let back = (now.saturating_sub(target) as f64 / avg) as u64;
        let mut candidate = head.saturating_sub(back);
        let mut too_early: Option<u64> = None;
        let mut too_late: Option<u64> = None;
        let mut found = None;

        for step in 0..MAX_LOCATE_STEPS {
            let ts = self.cache_timestamp(candidate).await?;

            if ts > target {
                too_late = Some(too_late.map_or(candidate, |late| late.min(candidate)));
                if candidate == 0 {
                    return Err(MonitorError::LocateFailed {
                        target,
                        reason: format!("genesis timestamp {} is after target", ts),
                    });
                }

                let mut next = candidate.saturating_sub(BACKWARD_STRIDE);
                if let Some(early) = too_early {
                    if early + 1 >= candidate {
                        // no block between a too-early and a too-late one
                        found = Some(early);
                        break;
                    }
                    next = next.max(early + 1);
                }
                candidate = next;
                continue;
            }

            if ts + OVERSHOOT_SECS >= target {
                debug!("Located block #{} for {} after {} steps (diff {}s)", candidate, target, step + 1, target - ts);
                found = Some(candidate);
                break;
            }

            too_early = Some(too_early.map_or(candidate, |early| early.max(candidate)));
            if candidate >= head {
                found = Some(head);
                break;
            }

            let jump = ((target - ts) as f64 / avg) as u64;
            let mut next = (candidate + jump.max(1)).min(head);
            if let Some(late) = too_late {
                if late <= candidate + 1 {
                    found = Some(candidate);
                    break;
                }
                next = next.min(late - 1);
            }
            candidate = next;
        }

        let Some(found) = found else {
            return Err(MonitorError::LocateFailed {
                target,
                reason: format!("no convergence after {} steps", MAX_LOCATE_STEPS),
            });
        };

        let found_ts = self.cache_timestamp(found).await?;
        info!("Found starting point #{} for {} (diff {}s)", found, target, target.saturating_sub(found_ts));

        match self.prefetch_window(found, found_ts, head).await {
            Ok(cached) => {
                debug!("Prefetched {} blocks after #{}", cached, found);
                self.ready.store(true, Ordering::SeqCst);
            }
            Err(e) => warn!("Prefetch after #{} stopped early: {}", found, e),
        }

        Ok(found)
    }

    async fn prefetch_window(&self, from: u64, from_ts: u64, head: u64) -> MonitorResult<usize> {
        let until = from_ts + PREFETCH_WINDOW_SECS;
        let mut cached = 0;
        for number in from..=head {
            let ts = self.cache_timestamp(number).await?;
            cached += 1;
            if ts > until {
                break;
            }
        }
        Ok(cached)
    }

    /// Nearest cached block to `target` as `(number, timestamp)`, ties going to
    /// the lower block number. Never touches the chain.
    pub fn closest_cached(&self, target: u64) -> Option<(u64, u64)> {
        self.timestamps
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .min_by_key(|(number, ts)| (ts.abs_diff(target), *number))
    }

    /// True while a rebuild runs for a target within `PREFETCH_WINDOW_SECS`
    pub fn rebuild_in_flight(&self, target: u64) -> bool {
        self.overlapping_rebuild(target).is_some()
    }

    /// Any target closer than a prefetch window lives in the same bucket or
    /// one of its two neighbours.
    fn overlapping_rebuild(&self, target: u64) -> Option<u64> {
        let bucket = rebuild_bucket(target);
        [bucket.checked_sub(1), Some(bucket), bucket.checked_add(1)]
            .into_iter()
            .flatten()
            .filter_map(|b| self.rebuilds_in_flight.get(&b).map(|running| *running))
            .find(|running| running.abs_diff(target) < PREFETCH_WINDOW_SECS)
    }
}

impl<C: ChainClient + 'static> BlockTimeIndex<C> {
    /// Cached block within `CLOSEST_TOLERANCE_SECS` of `target`.
    ///
    /// On a miss a background rebuild for `target` is scheduled and
    /// [`MonitorError::IndexMiss`] is returned right away; the caller retries
    /// on its next tick.
    pub fn find_closest_block(self: &Arc<Self>, target: u64) -> MonitorResult<u64> {
        match self.closest_cached(target) {
            Some((number, ts)) if ts.abs_diff(target) <= CLOSEST_TOLERANCE_SECS => Ok(number),
            closest => {
                debug!(
                    "Index miss for {} (closest {:?}), scheduling rebuild",
                    target, closest
                );
                self.schedule_rebuild(target);
                Err(MonitorError::IndexMiss(target))
            }
        }
    }

    /// Spawn `locate_block_at_or_before(target)` unless a rebuild for a
    /// target less than a prefetch window away is already running.
    pub fn schedule_rebuild(self: &Arc<Self>, target: u64) -> Option<JoinHandle<()>> {
        if let Some(running) = self.overlapping_rebuild(target) {
            debug!("Rebuild for {} covers {}, not starting another", running, target);
            return None;
        }

        let bucket = rebuild_bucket(target);
        match self.rebuilds_in_flight.entry(bucket) {
            Entry::Occupied(running) => {
                debug!("Rebuild for {} covers {}, not starting another", running.get(), target);
                return None;
            }
            Entry::Vacant(slot) => {
                slot.insert(target);
            }
        }

        let index = Arc::clone(self);
        Some(tokio::spawn(async move {
            match index.locate_block_at_or_before(target).await {
                Ok(number) => info!("Rebuild for {} settled on #{}", target, number),
                Err(e) => warn!("Rebuild for {} failed: {}", target, e),
            }
            index.rebuilds_in_flight.remove(&bucket);
        }))
    }
}

fn rebuild_bucket(target: u64) -> u64 {
    target / PREFETCH_WINDOW_SECS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_sync::mock_chain::MockChainClient;
    use std::time::Duration;

    const HEAD: u64 = 1_000_000;
    const HEAD_TS: u64 = 1_500_000_000;

    fn linear_index() -> (Arc<MockChainClient>, Arc<BlockTimeIndex<MockChainClient>>) {
        let chain = Arc::new(MockChainClient::linear(HEAD, HEAD_TS, 15));
        let index = Arc::new(BlockTimeIndex::new(Arc::clone(&chain)));
        (chain, index)
    }

    async fn wait_for_rebuild(index: &BlockTimeIndex<MockChainClient>, target: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while index.rebuild_in_flight(target) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_cache_timestamp_is_memoized() {
        let (chain, index) = linear_index();

        let first = index.cache_timestamp(HEAD - 3).await.unwrap();
        let second = index.cache_timestamp(HEAD - 3).await.unwrap();

        assert_eq!(first, HEAD_TS - 45);
        assert_eq!(first, second);
        assert_eq!(chain.block_fetches(), 1);
        assert_eq!(index.cached(HEAD - 3), Some(HEAD_TS - 45));
    }

    #[tokio::test]
    async fn test_fetch_errors_propagate() {
        let (chain, index) = linear_index();
        chain.set_failing(true);

        assert!(index.cache_timestamp(10).await.unwrap_err().is_transient());
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_average_block_time_computed_once() {
        let (chain, index) = linear_index();

        let avg = index.estimate_average_block_time().await.unwrap();
        let fetches = chain.block_fetches();
        for _ in 0..5 {
            assert_eq!(index.estimate_average_block_time().await.unwrap(), avg);
        }

        assert_eq!(avg, 15.0);
        assert_eq!(fetches, DEFAULT_SAMPLE_SIZE);
        assert_eq!(chain.block_fetches(), fetches);
        assert_eq!(index.avg_computations(), 1);
    }

    #[tokio::test]
    async fn test_average_block_time_concurrent_callers() {
        let (_chain, index) = linear_index();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let index = Arc::clone(&index);
                tokio::spawn(async move { index.estimate_average_block_time().await.unwrap() })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 15.0);
        }

        assert_eq!(index.avg_computations(), 1);
    }

    #[tokio::test]
    async fn test_failed_sample_is_retried() {
        let (chain, index) = linear_index();
        chain.set_failing(true);
        assert!(index.estimate_average_block_time().await.is_err());

        chain.set_failing(false);
        assert_eq!(index.estimate_average_block_time().await.unwrap(), 15.0);
        assert_eq!(index.avg_computations(), 2);
    }

    #[tokio::test]
    async fn test_locate_twenty_three_hours_back() {
        let (_chain, index) = linear_index();
        let target = HEAD_TS - 82_800;

        let found = index.locate_block_at_or_before(target).await.unwrap();
        let ts = index.cached(found).unwrap();

        assert!(found.abs_diff(HEAD - 5_520) <= 40, "found #{}", found);
        assert!(ts <= target && ts + CLOSEST_TOLERANCE_SECS >= target);
        assert!(index.is_ready());
        // the following hour is cached
        assert!(index.cached(found + 240).is_some());
    }

    #[tokio::test]
    async fn test_locate_with_uneven_block_times() {
        let chain = Arc::new(MockChainClient::alternating(HEAD, HEAD_TS, 5, 40));
        let index = BlockTimeIndex::new(Arc::clone(&chain));

        for hours_back in [1u64, 6, 23] {
            let target = HEAD_TS - hours_back * 3600 - 7;
            let found = index.locate_block_at_or_before(target).await.unwrap();
            let ts = chain.timestamp_of(found);
            assert!(ts <= target, "block #{} at {} is after {}", found, ts, target);
            assert!(ts + OVERSHOOT_SECS >= target, "block #{} at {} too early for {}", found, ts, target);
        }
    }

    #[tokio::test]
    async fn test_locate_after_block_time_drift() {
        // recent blocks every 15s, older history every 60s: the estimate is
        // far off for the target region and the search has to correct
        let chain = Arc::new(MockChainClient::with_schedule(HEAD, |n| {
            let boundary = HEAD - 1_000;
            if n >= boundary {
                HEAD_TS - (HEAD - n) * 15
            } else {
                HEAD_TS - 15_000 - (boundary - n) * 60
            }
        }));
        let index = BlockTimeIndex::new(Arc::clone(&chain));

        let target = HEAD_TS - 82_800;
        let found = index.locate_block_at_or_before(target).await.unwrap();
        let ts = chain.timestamp_of(found);
        assert!(ts <= target && ts + OVERSHOOT_SECS >= target);
    }

    #[tokio::test]
    async fn test_locate_across_chain_gap() {
        // a single 20 minute gap right before the target: the best block at
        // or before the target is older than the overshoot threshold
        let chain = Arc::new(MockChainClient::with_schedule(HEAD, |n| {
            let gap_block = HEAD - 2_000;
            if n >= gap_block {
                HEAD_TS - (HEAD - n) * 15
            } else {
                HEAD_TS - 30_000 - 1_200 - (gap_block - 1 - n) * 15
            }
        }));
        let index = BlockTimeIndex::new(Arc::clone(&chain));

        let target = HEAD_TS - 30_000 - 10;
        let found = index.locate_block_at_or_before(target).await.unwrap();
        assert_eq!(found, HEAD - 2_001);
    }

    #[tokio::test]
    async fn test_locate_future_target_returns_head() {
        let (_chain, index) = linear_index();
        let found = index.locate_block_at_or_before(HEAD_TS + 10_000).await.unwrap();
        assert_eq!(found, HEAD);
    }

    #[tokio::test]
    async fn test_locate_before_genesis_fails() {
        let chain = Arc::new(MockChainClient::linear(500, HEAD_TS, 15));
        let index = BlockTimeIndex::new(Arc::clone(&chain));

        let err = index.locate_block_at_or_before(HEAD_TS - 100_000).await.unwrap_err();
        assert!(matches!(err, MonitorError::LocateFailed { .. }));
        assert!(!index.is_ready());
    }

    #[tokio::test]
    async fn test_closest_cached_prefers_nearest() {
        let (_chain, index) = linear_index();
        index.record(10, 1_000);
        index.record(11, 1_015);
        index.record(12, 1_030);

        assert_eq!(index.closest_cached(1_016), Some((11, 1_015)));
        assert_eq!(index.closest_cached(0), Some((10, 1_000)));
        assert_eq!(index.closest_cached(5_000), Some((12, 1_030)));
    }

    #[tokio::test]
    async fn test_find_closest_block_within_tolerance() {
        let (_chain, index) = linear_index();
        index.record(100, 10_000);

        assert_eq!(index.find_closest_block(10_300).unwrap(), 100);
        assert_eq!(index.find_closest_block(9_700).unwrap(), 100);
        assert!(!index.rebuild_in_flight(10_300));

        // one second past the tolerance on either side is a miss
        assert!(matches!(index.find_closest_block(10_301), Err(MonitorError::IndexMiss(10_301))));
        assert!(index.rebuild_in_flight(10_301));
        assert!(matches!(index.find_closest_block(9_699), Err(MonitorError::IndexMiss(9_699))));
    }

    #[tokio::test]
    async fn test_find_closest_block_miss_schedules_rebuild() {
        let (_chain, index) = linear_index();
        let target = HEAD_TS - 82_800;
        index.record(HEAD, HEAD_TS);

        assert!(matches!(index.find_closest_block(target), Err(MonitorError::IndexMiss(t)) if t == target));
        wait_for_rebuild(&index, target).await;

        let found = index.find_closest_block(target).unwrap();
        let ts = index.cached(found).unwrap();
        assert!(ts.abs_diff(target) <= CLOSEST_TOLERANCE_SECS);
    }

    #[tokio::test]
    async fn test_rebuilds_are_coalesced() {
        let (_chain, index) = linear_index();
        let target = HEAD_TS - 82_800;

        let first = index.schedule_rebuild(target);
        let second = index.schedule_rebuild(target + 60);
        assert!(first.is_some());
        assert!(second.is_none());

        first.unwrap().await.unwrap();
        assert!(!index.rebuild_in_flight(target));
        assert!(index.schedule_rebuild(target).is_some());
    }

    #[tokio::test]
    async fn test_rebuilds_straddling_an_hour_boundary_are_coalesced() {
        let (_chain, index) = linear_index();
        let boundary = (HEAD_TS - 82_800) / PREFETCH_WINDOW_SECS * PREFETCH_WINDOW_SECS;
        let before = boundary - 1;

        let first = index.schedule_rebuild(before);
        assert!(first.is_some());
        assert!(index.schedule_rebuild(before + 2).is_none());
        assert!(index.schedule_rebuild(boundary + PREFETCH_WINDOW_SECS - 2).is_none());
        assert!(index.rebuild_in_flight(before + 2));

        // a full window away is a separate range
        let other = index.schedule_rebuild(before + PREFETCH_WINDOW_SECS);
        assert!(other.is_some());

        first.unwrap().await.unwrap();
        other.unwrap().await.unwrap();
        assert!(!index.rebuild_in_flight(before + 2));
    }

    #[tokio::test]
    async fn test_record_prunes_entries_behind_retention_window() {
        let (_chain, index) = linear_index();
        index.record(1, HEAD_TS - RETENTION_SECS - 1);
        index.record(2, HEAD_TS - RETENTION_SECS);
        index.record(3, HEAD_TS - REFERENCE_LOOKBACK_SECS);

        index.record(HEAD, HEAD_TS);

        assert_eq!(index.cached(1), None);
        assert_eq!(index.cached(2), Some(HEAD_TS - RETENTION_SECS));
        assert_eq!(index.cached(3), Some(HEAD_TS - REFERENCE_LOOKBACK_SECS));
        assert_eq!(index.len(), 3);

        // an older timestamp never prunes newer entries
        index.record(4, HEAD_TS - RETENTION_SECS - 10);
        assert_eq!(index.len(), 4);
    }
}
