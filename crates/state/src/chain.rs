//! Signal-chain records and store
//!
//! A chain buffers the three legs of one logical trade (CANCAL, ENTER,
//! BATCH_TPS) keyed by `(sig_id, product_symbol)`. Slots are last-writer-
//! wins; progress flags only ever advance. Execution order is enforced by
//! the engine; this module owns the data and its TTL lifecycle.

use relay_core::{SignalKind, SignalMessage};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default chain record TTL (idle eviction)
pub const CHAIN_TTL: Duration = Duration::from_secs(120);

/// Stable key for a chain: hash of `sig_id || UPPER(product_symbol)`
pub fn sig_key(sig_id: &str, product_symbol: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sig_id.as_bytes());
    hasher.update(product_symbol.to_ascii_uppercase().as_bytes());
    hex::encode(hasher.finalize())
}

/// One signal chain: buffered messages plus monotonic progress flags
pub struct ChainRecord {
    pub created_at: Instant,
    pub last_touch: Instant,
    created_utc: chrono::DateTime<chrono::Utc>,

    pub cancel_msg: Option<SignalMessage>,
    pub enter_msg: Option<SignalMessage>,
    pub batch_msg: Option<SignalMessage>,

    did_cancel: bool,
    did_enter_prep: bool,
    did_enter: bool,
    did_batch: bool,
}

impl ChainRecord {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            created_at: now,
            last_touch: now,
            created_utc: chrono::Utc::now(),
            cancel_msg: None,
            enter_msg: None,
            batch_msg: None,
            did_cancel: false,
            did_enter_prep: false,
            did_enter: false,
            did_batch: false,
        }
    }

    /// Buffer a message into its slot (last writer wins) and touch the chain
    pub fn merge(&mut self, msg: SignalMessage) {
        self.last_touch = Instant::now();
        match &msg.kind {
            SignalKind::Cancal(_) => self.cancel_msg = Some(msg),
            SignalKind::Enter(_) => self.enter_msg = Some(msg),
            SignalKind::BatchTps(_) => self.batch_msg = Some(msg),
            // EXIT and legacy actions never reach a chain
            SignalKind::Exit | SignalKind::Legacy(_) => {}
        }
    }

    pub fn age_ms(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }

    // Flags can only be raised, never cleared.
    pub fn did_cancel(&self) -> bool {
        self.did_cancel
    }
    pub fn did_enter_prep(&self) -> bool {
        self.did_enter_prep
    }
    pub fn did_enter(&self) -> bool {
        self.did_enter
    }
    pub fn did_batch(&self) -> bool {
        self.did_batch
    }

    pub fn mark_cancel(&mut self) {
        self.did_cancel = true;
    }
    pub fn mark_enter_prep(&mut self) {
        self.did_enter_prep = true;
    }
    pub fn mark_enter(&mut self) {
        debug_assert!(self.did_cancel, "ENTER before CANCAL");
        self.did_enter = true;
    }
    pub fn mark_batch(&mut self) {
        debug_assert!(self.did_enter, "BATCH before ENTER");
        self.did_batch = true;
    }

    pub fn is_done(&self) -> bool {
        self.did_cancel && self.did_enter && self.did_batch
    }

    /// Which slots hold a message, in protocol order
    pub fn have(&self) -> [bool; 3] {
        [
            self.cancel_msg.is_some(),
            self.enter_msg.is_some(),
            self.batch_msg.is_some(),
        ]
    }

    /// Which steps have run, in protocol order
    pub fn did(&self) -> [bool; 3] {
        [self.did_cancel, self.did_enter, self.did_batch]
    }
}

/// Debug view of one chain, for `/debug/chain`
#[derive(Debug, Clone, Serialize)]
pub struct ChainDebug {
    pub key: String,
    pub created_at: String,
    pub age_ms: u64,
    pub have: [bool; 3],
    pub did: [bool; 3],
    pub did_enter_prep: bool,
}

/// Thread-safe chain store with TTL eviction on access
pub struct ChainStore {
    chains: Mutex<HashMap<String, ChainRecord>>,
    ttl: Duration,
}

impl ChainStore {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            chains: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Merge a message into its chain, creating the record if needed.
    /// Idle chains are evicted on the way, except the one being merged
    /// into: a late leg must still find its record so the window guard can
    /// reject it as expired instead of silently starting a fresh chain.
    pub fn merge(&self, key: &str, msg: SignalMessage) {
        if let Ok(mut chains) = self.chains.lock() {
            chains.retain(|k, c| k == key || c.last_touch.elapsed() <= self.ttl);
            chains
                .entry(key.to_string())
                .or_insert_with(ChainRecord::new)
                .merge(msg);
        }
    }

    /// Run a closure against a chain record. Returns `None` when the chain
    /// does not exist (or was evicted).
    pub fn with_chain<R>(&self, key: &str, f: impl FnOnce(&mut ChainRecord) -> R) -> Option<R> {
        let mut chains = self.chains.lock().ok()?;
        chains.retain(|_, c| c.last_touch.elapsed() <= self.ttl);
        chains.get_mut(key).map(f)
    }

    pub fn snapshot(&self) -> Vec<ChainDebug> {
        match self.chains.lock() {
            Ok(chains) => chains
                .iter()
                .map(|(key, c)| ChainDebug {
                    key: key.clone(),
                    created_at: c.created_utc.to_rfc3339(),
                    age_ms: c.age_ms(),
                    have: c.have(),
                    did: c.did(),
                    did_enter_prep: c.did_enter_prep(),
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.chains.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChainStore {
    fn default() -> Self {
        Self::with_ttl(CHAIN_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(action: &str) -> SignalMessage {
        let mut body = json!({
            "action": action, "sig_id": "S1", "symbol": "ARCUSD", "side": "buy"
        });
        if action == "BATCH_TPS" {
            body["orders"] = json!([{"limit_price": "2.1", "size": 3}]);
        }
        SignalMessage::parse(&body).unwrap()
    }

    #[test]
    fn test_sig_key_is_case_insensitive_on_symbol() {
        assert_eq!(sig_key("S1", "arcusd"), sig_key("S1", "ARCUSD"));
        assert_ne!(sig_key("S1", "ARCUSD"), sig_key("S2", "ARCUSD"));
    }

    #[test]
    fn test_merge_fills_slots_last_writer_wins() {
        let store = ChainStore::default();
        let key = sig_key("S1", "ARCUSD");
        store.merge(&key, msg("CANCAL"));
        store.merge(&key, msg("ENTER"));
        store.merge(&key, msg("ENTER"));
        let have = store.with_chain(&key, |c| c.have()).unwrap();
        assert_eq!(have, [true, true, false]);
    }

    #[test]
    fn test_flags_only_advance() {
        let store = ChainStore::default();
        let key = sig_key("S1", "ARCUSD");
        store.merge(&key, msg("CANCAL"));
        store.with_chain(&key, |c| {
            c.mark_cancel();
            c.mark_enter_prep();
            c.mark_enter();
        });
        // Re-merging a message must not clear progress
        store.merge(&key, msg("CANCAL"));
        let did = store.with_chain(&key, |c| c.did()).unwrap();
        assert_eq!(did, [true, true, false]);
    }

    #[test]
    fn test_expired_chain_is_evicted() {
        let store = ChainStore::with_ttl(Duration::from_millis(0));
        let key = sig_key("S1", "ARCUSD");
        store.merge(&key, msg("CANCAL"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.with_chain(&key, |_| ()).is_none());
    }
}
