use ahash::HashMap;
use alloy_primitives::{Address, B256, U256};
use tracing::debug;

/// Unconfirmed value sent to the sale contract, keyed by transaction hash.
///
/// Entries live from the first mempool sighting until any block containing
/// the hash is seen. Mined and dropped transactions are treated alike.
#[derive(Debug, Default)]
pub struct PendingContributionTracker {
    sale_address: Address,
    pending: HashMap<B256, U256>,
}

impl PendingContributionTracker {
    pub fn new(sale_address: Address) -> Self {
        Self {
            sale_address,
            pending: HashMap::default(),
        }
    }

    /// Record `value` for `tx_hash` when it is addressed to the sale contract.
    /// Returns whether the transaction is tracked. Seeing a hash again
    /// overwrites its value.
    pub fn observe(&mut self, tx_hash: B256, recipient: Option<Address>, value: U256) -> bool {
        // Address equality is byte equality, so checksum casing never matters
        if recipient != Some(self.sale_address) {
            return false;
        }
        if self.pending.insert(tx_hash, value).is_none() {
            debug!("Pending contribution {} of {} wei", tx_hash, value);
        }
        true
    }

    /// Drop every entry whose hash appears in `block_tx_hashes`; unknown
    /// hashes are ignored. Returns how many entries were removed.
    pub fn confirm<'a>(&mut self, block_tx_hashes: impl IntoIterator<Item = &'a B256>) -> usize {
        block_tx_hashes
            .into_iter()
            .filter(|hash| self.pending.remove(*hash).is_some())
            .count()
    }

    pub fn total(&self) -> U256 {
        self.pending.values().fold(U256::ZERO, |acc, value| acc.saturating_add(*value))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, tx_hash: &B256) -> bool {
        self.pending.contains_key(tx_hash)
    }
}
