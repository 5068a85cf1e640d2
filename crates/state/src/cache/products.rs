//! Product metadata cache with TTL and runtime lot-multiplier learning
//!
//! The products snapshot refreshes at most once per 5 minutes. Lot
//! multipliers resolve from the first well-formed metadata field and may be
//! corrected at runtime when the observed position contradicts the metadata.

use relay_core::Product;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long a products snapshot stays fresh
pub const PRODUCTS_TTL: Duration = Duration::from_secs(300);

/// Tolerance for "integer-near" detection on learned multipliers
const NEAR_INT_EPS: f64 = 1e-6;

struct Snapshot {
    products: Vec<Product>,
    fetched_at: Instant,
}

struct MultEntry {
    m: f64,
    ts: Instant,
}

/// Outcome of a runtime lot-multiplier learning attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LearnOutcome {
    Accepted(f64),
    Rejected(f64),
    /// Nothing to learn from (zero lots or zero coins)
    Skipped,
}

/// Thread-safe product metadata cache
pub struct ProductsCache {
    snapshot: RwLock<Option<Snapshot>>,
    multipliers: RwLock<HashMap<String, MultEntry>>,
    ttl: Duration,
}

impl ProductsCache {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            snapshot: RwLock::new(None),
            multipliers: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// True when the snapshot is missing or older than the TTL
    pub fn needs_refresh(&self) -> bool {
        match self.snapshot.read() {
            Ok(guard) => match guard.as_ref() {
                Some(snap) => snap.fetched_at.elapsed() > self.ttl,
                None => true,
            },
            Err(_) => true,
        }
    }

    /// Replace the snapshot. Multiplier entries keep their own TTL and
    /// re-resolve against the fresh metadata when they expire.
    pub fn store_snapshot(&self, products: Vec<Product>) {
        debug!("Products snapshot stored: {} products", products.len());
        if let Ok(mut guard) = self.snapshot.write() {
            *guard = Some(Snapshot {
                products,
                fetched_at: Instant::now(),
            });
        }
    }

    /// Resolve a product id by symbol
    pub fn product_id(&self, symbol: &str) -> Option<i64> {
        let guard = self.snapshot.read().ok()?;
        let snap = guard.as_ref()?;
        snap.products
            .iter()
            .find(|p| p.symbol.eq_ignore_ascii_case(symbol))
            .map(|p| p.id)
    }

    /// Resolve the lot multiplier (coins per lot) for a symbol.
    ///
    /// Resolution order: cached entry (5-minute TTL), then the first
    /// well-formed field of `{lot_size, contract_size, contract_value,
    /// contract_unit}`, then `qty_step` when >= 1, then 1.
    pub fn lot_multiplier(&self, symbol: &str) -> f64 {
        let key = symbol.to_ascii_uppercase();

        if let Ok(cache) = self.multipliers.read() {
            if let Some(entry) = cache.get(&key) {
                if entry.ts.elapsed() <= self.ttl {
                    return entry.m;
                }
            }
        }

        let resolved = self.resolve_from_metadata(symbol).unwrap_or_else(|| {
            debug!("No lot multiplier metadata for {}, defaulting to 1", symbol);
            1.0
        });

        if let Ok(mut cache) = self.multipliers.write() {
            cache.insert(
                key,
                MultEntry {
                    m: resolved,
                    ts: Instant::now(),
                },
            );
        }
        resolved
    }

    fn resolve_from_metadata(&self, symbol: &str) -> Option<f64> {
        let guard = self.snapshot.read().ok()?;
        let snap = guard.as_ref()?;
        let product = snap
            .products
            .iter()
            .find(|p| p.symbol.eq_ignore_ascii_case(symbol))?;

        for field in [
            &product.lot_size,
            &product.contract_size,
            &product.contract_value,
            &product.contract_unit,
        ] {
            if let Some(m) = field.as_ref().and_then(first_numeric_token) {
                if m > 0.0 {
                    return Some(m);
                }
            }
        }

        // qty_step only counts when it looks like a lot granularity
        if let Some(step) = product.qty_step.as_ref().and_then(first_numeric_token) {
            if step >= 1.0 {
                return Some(step);
            }
        }

        None
    }

    /// Runtime learning: after an entry, the observed coin magnitude divided
    /// by the lots just sent proposes a corrected multiplier. Accepted only
    /// when the candidate is integer-near or in (0,1), and within 50% of the
    /// metadata-derived value.
    pub fn learn(&self, symbol: &str, observed_coins: f64, lots_sent: i64) -> LearnOutcome {
        if lots_sent <= 0 || observed_coins <= 0.0 {
            return LearnOutcome::Skipped;
        }
        let candidate = observed_coins / lots_sent as f64;
        let well_formed = is_near_integer(candidate) || (candidate > 0.0 && candidate < 1.0);

        let metadata = self.resolve_from_metadata(symbol).unwrap_or(1.0);
        let within_half = (candidate - metadata).abs() / metadata <= 0.5;

        if well_formed && within_half {
            let m = if is_near_integer(candidate) {
                candidate.round()
            } else {
                candidate
            };
            debug!(
                "Learned lot multiplier for {}: {} (metadata said {})",
                symbol, m, metadata
            );
            if let Ok(mut cache) = self.multipliers.write() {
                cache.insert(
                    symbol.to_ascii_uppercase(),
                    MultEntry {
                        m,
                        ts: Instant::now(),
                    },
                );
            }
            LearnOutcome::Accepted(m)
        } else {
            warn!(
                "Rejected learned lot multiplier for {}: candidate {} vs metadata {}",
                symbol, candidate, metadata
            );
            LearnOutcome::Rejected(candidate)
        }
    }
}

impl Default for ProductsCache {
    fn default() -> Self {
        Self::with_ttl(PRODUCTS_TTL)
    }
}

fn is_near_integer(v: f64) -> bool {
    (v - v.round()).abs() < NEAR_INT_EPS && v.round() >= 1.0
}

/// Extract the first numeric token from a possibly-mixed metadata value
/// (`"10 ARC"` -> 10, `"0.1 LINK"` -> 0.1, `2.5` -> 2.5).
pub fn first_numeric_token(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => {
            let start = s.find(|c: char| c.is_ascii_digit() || c == '.' || c == '-')?;
            let token: String = s[start..]
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-' || *c == 'e' || *c == 'E')
                .collect();
            token.parse::<f64>().ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn product(symbol: &str, fields: serde_json::Value) -> Product {
        let mut base = json!({"id": 42, "symbol": symbol});
        base.as_object_mut()
            .unwrap()
            .extend(fields.as_object().unwrap().clone());
        serde_json::from_value(base).unwrap()
    }

    #[test]
    fn test_first_numeric_token() {
        assert_eq!(first_numeric_token(&json!("10 ARC")), Some(10.0));
        assert_eq!(first_numeric_token(&json!("0.1 LINK")), Some(0.1));
        assert_eq!(first_numeric_token(&json!(2.5)), Some(2.5));
        assert_eq!(first_numeric_token(&json!("ARC")), None);
    }

    #[test]
    fn test_lot_multiplier_resolution_order() {
        let cache = ProductsCache::default();
        cache.store_snapshot(vec![
            product("ARCUSD", json!({"contract_value": "10 ARC"})),
            product("LINKUSD", json!({"lot_size": "0.1 LINK", "contract_value": "99"})),
            product("BTCUSD", json!({"qty_step": "0.001"})),
        ]);
        assert_eq!(cache.lot_multiplier("ARCUSD"), 10.0);
        // lot_size wins over contract_value
        assert_eq!(cache.lot_multiplier("LINKUSD"), 0.1);
        // fractional qty_step is not a lot multiplier
        assert_eq!(cache.lot_multiplier("BTCUSD"), 1.0);
        assert_eq!(cache.lot_multiplier("UNLISTED"), 1.0);
    }

    #[test]
    fn test_product_id_lookup() {
        let cache = ProductsCache::default();
        cache.store_snapshot(vec![product("ARCUSD", json!({}))]);
        assert_eq!(cache.product_id("arcusd"), Some(42));
        assert_eq!(cache.product_id("ETHUSD"), None);
    }

    #[test]
    fn test_learning_accepts_integer_near_within_half() {
        let cache = ProductsCache::default();
        cache.store_snapshot(vec![product("ARCUSD", json!({"contract_value": "10"}))]);
        // observed 50 coins over 5 lots -> candidate 10, exact match
        assert_eq!(cache.learn("ARCUSD", 50.0, 5), LearnOutcome::Accepted(10.0));
        assert_eq!(cache.lot_multiplier("ARCUSD"), 10.0);
    }

    #[test]
    fn test_learning_rejects_far_from_metadata() {
        let cache = ProductsCache::default();
        cache.store_snapshot(vec![product("ARCUSD", json!({"contract_value": "10"}))]);
        // candidate 100 is integer-near but 10x the metadata value
        assert!(matches!(
            cache.learn("ARCUSD", 500.0, 5),
            LearnOutcome::Rejected(_)
        ));
        assert_eq!(cache.lot_multiplier("ARCUSD"), 10.0);
    }

    #[test]
    fn test_learning_rejects_awkward_fraction() {
        let cache = ProductsCache::default();
        cache.store_snapshot(vec![product("ARCUSD", json!({"contract_value": "10"}))]);
        // 7.3 coins/lot is neither integer-near nor in (0,1)
        assert!(matches!(
            cache.learn("ARCUSD", 36.5, 5),
            LearnOutcome::Rejected(_)
        ));
    }

    #[test]
    fn test_learning_skips_empty_observation() {
        let cache = ProductsCache::default();
        assert_eq!(cache.learn("ARCUSD", 0.0, 5), LearnOutcome::Skipped);
        assert_eq!(cache.learn("ARCUSD", 10.0, 0), LearnOutcome::Skipped);
    }
}
