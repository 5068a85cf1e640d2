//! Last-entry memo
//!
//! Remembers the most recent entry per product symbol for a few seconds.
//! Used only as a heuristic input to TP size normalization and runtime
//! lot-multiplier learning.

use relay_core::Side;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

const MEMO_TTL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct LastEntry {
    pub lots: i64,
    pub side: Side,
    pub lot_mult: f64,
    pub at: Instant,
}

/// Per-symbol memo of the last placed entry
pub struct LastEntryMemo {
    entries: RwLock<HashMap<String, LastEntry>>,
    ttl: Duration,
}

impl LastEntryMemo {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn record(&self, symbol: &str, lots: i64, side: Side, lot_mult: f64) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                symbol.to_ascii_uppercase(),
                LastEntry {
                    lots,
                    side,
                    lot_mult,
                    at: Instant::now(),
                },
            );
        }
    }

    /// The last entry for a symbol, unless it has expired
    pub fn get(&self, symbol: &str) -> Option<LastEntry> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(&symbol.to_ascii_uppercase())?;
        if entry.at.elapsed() > self.ttl {
            None
        } else {
            Some(entry.clone())
        }
    }
}

impl Default for LastEntryMemo {
    fn default() -> Self {
        Self::with_ttl(MEMO_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memo_roundtrip_and_expiry() {
        let memo = LastEntryMemo::with_ttl(Duration::from_millis(0));
        memo.record("arcusd", 5, Side::Buy, 10.0);
        std::thread::sleep(Duration::from_millis(5));
        assert!(memo.get("ARCUSD").is_none());

        let memo = LastEntryMemo::default();
        memo.record("ARCUSD", 5, Side::Buy, 10.0);
        let entry = memo.get("arcusd").unwrap();
        assert_eq!(entry.lots, 5);
        assert_eq!(entry.side, Side::Buy);
    }
}
