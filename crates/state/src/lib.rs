//! Relay State - Process-wide in-memory stores
//!
//! All relay state lives here: the products/lot-multiplier cache, the
//! idempotency seen-set, the signal-chain store, and the last-entry memo.
//! Nothing survives a restart; horizontal scaling requires a single
//! instance. Every store evicts by TTL on access.

pub mod cache;
pub mod chain;
pub mod memo;
pub mod seen;

pub use cache::products::ProductsCache;
pub use chain::{sig_key, ChainRecord, ChainStore};
pub use memo::{LastEntry, LastEntryMemo};
pub use seen::SeenSet;

/// The collaborator handed to the dispatcher: every process-wide store in
/// one place, so nothing reaches for implicit globals.
pub struct RelayState {
    pub products: ProductsCache,
    pub chains: ChainStore,
    pub seen: SeenSet,
    pub memo: LastEntryMemo,
}

impl RelayState {
    pub fn new() -> Self {
        Self {
            products: ProductsCache::default(),
            chains: ChainStore::default(),
            seen: SeenSet::default(),
            memo: LastEntryMemo::default(),
        }
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}
