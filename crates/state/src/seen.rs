//! Idempotency seen-set
//!
//! Replayed webhook deliveries are common (upstream retries, double-fires).
//! A fingerprint over `(sig_id, product_symbol, seq, orders)` admits each
//! logical message at most once per TTL window.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

const SEEN_TTL: Duration = Duration::from_secs(60);
const SOFT_CAP: usize = 300;
const EVICT_TO: usize = 200;

/// Compute the dedup fingerprint for a message
pub fn fingerprint(
    sig_id: &str,
    product_symbol: &str,
    seq: u8,
    orders: Option<&serde_json::Value>,
) -> String {
    let orders_hash = match orders {
        Some(v) => {
            let mut hasher = Sha256::new();
            hasher.update(v.to_string().as_bytes());
            hex::encode(hasher.finalize())
        }
        None => String::new(),
    };
    let mut hasher = Sha256::new();
    hasher.update(sig_id.as_bytes());
    hasher.update(b"|");
    hasher.update(product_symbol.to_ascii_uppercase().as_bytes());
    hasher.update(b"|");
    hasher.update(seq.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(orders_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Thread-safe dedup set with TTL and a soft entry cap
pub struct SeenSet {
    entries: RwLock<HashMap<String, Instant>>,
    ttl: Duration,
    soft_cap: usize,
    evict_to: usize,
}

impl SeenSet {
    pub fn with_limits(ttl: Duration, soft_cap: usize, evict_to: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            soft_cap,
            evict_to,
        }
    }

    /// Admit a fingerprint. Returns `true` when fresh (caller should
    /// proceed), `false` when this is a duplicate within the TTL.
    pub fn admit(&self, fp: &str) -> bool {
        let mut entries = match self.entries.write() {
            Ok(g) => g,
            Err(_) => return true,
        };

        entries.retain(|_, at| at.elapsed() <= self.ttl);

        if entries.contains_key(fp) {
            return false;
        }

        // Oldest-first eviction down to the low-water mark
        if entries.len() >= self.soft_cap {
            let mut by_age: Vec<(String, Instant)> =
                entries.iter().map(|(k, v)| (k.clone(), *v)).collect();
            by_age.sort_by_key(|(_, at)| *at);
            let excess = entries.len().saturating_sub(self.evict_to);
            for (key, _) in by_age.into_iter().take(excess) {
                entries.remove(&key);
            }
        }

        entries.insert(fp.to_string(), Instant::now());
        true
    }

    /// Fingerprints with their ages, for the debug endpoint
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        match self.entries.read() {
            Ok(entries) => entries
                .iter()
                .map(|(k, at)| (k.clone(), at.elapsed().as_millis() as u64))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SeenSet {
    fn default() -> Self {
        Self::with_limits(SEEN_TTL, SOFT_CAP, EVICT_TO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_duplicate_is_rejected() {
        let seen = SeenSet::default();
        let fp = fingerprint("S1", "ARCUSD", 1, None);
        assert!(seen.admit(&fp));
        assert!(!seen.admit(&fp));
    }

    #[test]
    fn test_orders_change_fingerprint() {
        let a = fingerprint("S1", "ARCUSD", 2, Some(&json!([{"size": 30}])));
        let b = fingerprint("S1", "ARCUSD", 2, Some(&json!([{"size": 20}])));
        assert_ne!(a, b);
    }

    #[test]
    fn test_symbol_case_folded() {
        assert_eq!(
            fingerprint("S1", "arcusd", 0, None),
            fingerprint("S1", "ARCUSD", 0, None)
        );
    }

    #[test]
    fn test_soft_cap_eviction() {
        let seen = SeenSet::with_limits(Duration::from_secs(60), 10, 5);
        for i in 0..10 {
            assert!(seen.admit(&format!("fp-{}", i)));
        }
        // Next admit trips the cap and evicts down to the low-water mark
        assert!(seen.admit("fp-new"));
        assert!(seen.len() <= 6);
    }
}
