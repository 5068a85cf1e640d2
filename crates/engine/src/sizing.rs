//! Order sizing
//!
//! Three related problems live here: converting a money budget into lots,
//! deciding whether a raw position size is lots or coins, and normalizing
//! take-profit leg sizes that upstreams send in whichever unit they feel
//! like. All rounding is explicit: `floor` when sizing down an order,
//! `round` for near-integer detection.

use relay_core::{AmountCcy, Error, PositionUnits, PositionRow, Result, TpLeg};
use relay_state::LastEntry;
use tracing::debug;

/// Tolerance for treating an f64 as an integer
const INT_EPS: f64 = 1e-9;

/// Relative-error threshold for the notional-based units estimate
const ESTIMATE_REL_ERR: f64 = 0.25;

fn is_integer(v: f64) -> bool {
    (v - v.round()).abs() < INT_EPS
}

fn divisible(v: f64, m: f64) -> bool {
    if m <= 0.0 {
        return false;
    }
    let q = v / m;
    (q - q.round()).abs() < 1e-6
}

/// Convert a money budget into lots.
///
/// `notionalUSD = marginUSD * leverage * (1 - buffer)`, then
/// `lots = floor(notionalUSD / price / lot_mult)`, clamped to
/// `[1, max_lots]`.
pub fn lots_from_amount(
    amount: f64,
    ccy: AmountCcy,
    leverage: u32,
    entry_px_usd: f64,
    lot_mult: f64,
    fx_inr_per_usd: f64,
    margin_buffer_pct: f64,
    max_lots: i64,
) -> Result<i64> {
    if amount <= 0.0 {
        return Err(Error::SizingError(format!("amount must be > 0 (got {})", amount)));
    }
    if entry_px_usd <= 0.0 {
        return Err(Error::SizingError(format!(
            "entry price must be > 0 (got {})",
            entry_px_usd
        )));
    }

    let margin_usd = match ccy {
        AmountCcy::Usd => amount,
        AmountCcy::Inr => {
            if fx_inr_per_usd <= 0.0 {
                return Err(Error::SizingError(format!(
                    "fx rate must be > 0 (got {})",
                    fx_inr_per_usd
                )));
            }
            amount / fx_inr_per_usd
        }
    };

    let leverage = leverage.max(1) as f64;
    let notional_usd = margin_usd * leverage * (1.0 - margin_buffer_pct);
    let coins_wanted = notional_usd / entry_px_usd;
    let lot_mult = if lot_mult > 0.0 { lot_mult } else { 1.0 };
    let lots = (coins_wanted / lot_mult).floor() as i64;
    Ok(lots.clamp(1, max_lots))
}

/// Result of position-units inference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitsDecision {
    pub units: PositionUnits,
    /// Position size normalized to lots, never below 1
    pub lots: i64,
}

/// Decide whether a raw position size is expressed in lots or coins.
///
/// When the row carries enough data for a notional-based estimate, the
/// closer of the two candidates wins (if it is close enough). Otherwise a
/// divisibility/magnitude ladder decides.
pub fn infer_position_units(
    raw_size: f64,
    lot_mult: f64,
    row: &PositionRow,
    max_lots: i64,
) -> UnitsDecision {
    let magnitude = raw_size.abs();
    if magnitude < INT_EPS {
        return UnitsDecision {
            units: PositionUnits::Unknown,
            lots: 1,
        };
    }
    let lot_mult = if lot_mult > 0.0 { lot_mult } else { 1.0 };

    // Estimate from notional and price when both are present
    if let (Some(notional), Some(price)) = (row.notional, row.reference_price()) {
        if notional > 0.0 && price > 0.0 {
            let coins_est = notional / price;
            let lots_est = coins_est / lot_mult;
            let err_as_lots = (magnitude - lots_est).abs() / lots_est.max(INT_EPS);
            let err_as_coins = (magnitude - coins_est).abs() / coins_est.max(INT_EPS);
            let (units, err) = if err_as_lots <= err_as_coins {
                (PositionUnits::Lots, err_as_lots)
            } else {
                (PositionUnits::Coins, err_as_coins)
            };
            if err < ESTIMATE_REL_ERR {
                return finish(units, magnitude, lot_mult);
            }
        }
    }

    let units = if lot_mult > 1.0 && is_integer(magnitude) && !divisible(magnitude, lot_mult) {
        PositionUnits::Lots
    } else if lot_mult > 1.0 && magnitude > max_lots as f64 {
        PositionUnits::Coins
    } else if lot_mult > 1.0 {
        // Divisible magnitudes default to coins
        PositionUnits::Coins
    } else {
        PositionUnits::Lots
    };
    finish(units, magnitude, lot_mult)
}

fn finish(units: PositionUnits, magnitude: f64, lot_mult: f64) -> UnitsDecision {
    let lots = match units {
        PositionUnits::Coins => (magnitude / lot_mult).floor() as i64,
        _ => magnitude.round() as i64,
    };
    UnitsDecision {
        units,
        lots: lots.max(1),
    }
}

/// Normalize one take-profit leg to lots.
///
/// The upstream may quote the size in coins or in lots, and for round
/// multiples of the lot multiplier the two are indistinguishable without
/// context. The last-entry memo provides that context when fresh.
pub fn normalize_tp_size(
    leg: &TpLeg,
    lot_mult: f64,
    last: Option<&LastEntry>,
    max_lots: i64,
) -> i64 {
    let lot_mult = if lot_mult > 0.0 { lot_mult } else { 1.0 };

    // Explicit coins are unambiguous
    if let Some(coins) = leg.size_coins.filter(|c| *c > 0.0) {
        return ((coins / lot_mult).floor() as i64).clamp(1, max_lots);
    }

    let s = leg.size.unwrap_or(0.0);
    if s <= 0.0 {
        return 1;
    }
    let s_int = is_integer(s);
    let last_lots = last.map(|l| l.lots).unwrap_or(0);
    let last_coins = last_lots as f64 * lot_mult;

    let lots = if lot_mult > 1.0 && s_int && s >= lot_mult && divisible(s, lot_mult) {
        // Large round multiples are the ambiguous case; treat as coins
        debug!("TP size {} read as coins (lot_mult {})", s, lot_mult);
        (s / lot_mult).round() as i64
    } else if s_int && last_lots > 0 && s <= 2.0 * last_lots as f64 {
        s.round() as i64
    } else if last_coins > 0.0 && s >= (0.5 * last_coins).max(2.0 * lot_mult) {
        (s / lot_mult).floor() as i64
    } else if lot_mult > 1.0 && s_int && !divisible(s, lot_mult) {
        s.round() as i64
    } else if lot_mult > 1.0 && s > max_lots as f64 {
        (s / lot_mult).floor() as i64
    } else {
        s.round() as i64
    };

    lots.clamp(1, max_lots)
}

/// Clamp normalized leg sizes so the batch never exceeds the live position.
///
/// Fewer position lots than legs: excess legs are dropped and each survivor
/// gets one lot. Otherwise an over-sum batch is floor-scaled and the
/// remainder is distributed round-robin until the sum matches the position
/// exactly (decrementing, never below one, if the scale overshot).
pub fn clamp_legs_to_position(lots: &[i64], position_lots: i64) -> Vec<i64> {
    let n = lots.len() as i64;
    if n == 0 || position_lots <= 0 {
        return Vec::new();
    }
    if position_lots < n {
        return vec![1; position_lots as usize];
    }

    let sum: i64 = lots.iter().sum();
    if sum <= position_lots {
        return lots.to_vec();
    }

    let mut scaled: Vec<i64> = lots
        .iter()
        .map(|l| ((l * position_lots) / sum).max(1))
        .collect();
    let mut total: i64 = scaled.iter().sum();

    let mut i = 0usize;
    while total < position_lots {
        let idx = i % scaled.len();
        scaled[idx] += 1;
        total += 1;
        i += 1;
    }
    while total > position_lots {
        let idx = i % scaled.len();
        if scaled[idx] > 1 {
            scaled[idx] -= 1;
            total -= 1;
        }
        i += 1;
    }
    scaled
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::Side;
    use std::time::Instant;

    fn leg(size: Option<f64>, size_coins: Option<f64>) -> TpLeg {
        TpLeg {
            limit_price: 2.1,
            size,
            size_coins,
            post_only: false,
            mmp: false,
            client_order_id: None,
        }
    }

    fn last_entry(lots: i64, lot_mult: f64) -> LastEntry {
        LastEntry {
            lots,
            side: Side::Buy,
            lot_mult,
            at: Instant::now(),
        }
    }

    fn bare_row() -> PositionRow {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }

    const MAX: i64 = 1_000_000;

    #[test]
    fn test_lots_from_amount_usd() {
        // floor(100 * 10 * 0.97 / (2.0 * 10)) = 48
        let lots =
            lots_from_amount(100.0, AmountCcy::Usd, 10, 2.0, 10.0, 84.0, 0.03, MAX).unwrap();
        assert_eq!(lots, 48);
    }

    #[test]
    fn test_lots_from_amount_inr_uses_fx() {
        // 8400 INR / 84 = 100 USD, same as above
        let lots =
            lots_from_amount(8400.0, AmountCcy::Inr, 10, 2.0, 10.0, 84.0, 0.03, MAX).unwrap();
        assert_eq!(lots, 48);
    }

    #[test]
    fn test_lots_from_amount_clamps_and_validates() {
        assert!(lots_from_amount(0.0, AmountCcy::Usd, 10, 2.0, 10.0, 84.0, 0.03, MAX).is_err());
        assert!(lots_from_amount(100.0, AmountCcy::Usd, 10, 0.0, 10.0, 84.0, 0.03, MAX).is_err());
        // Tiny budget floors to 0 and clamps up to 1
        let lots = lots_from_amount(0.01, AmountCcy::Usd, 1, 100.0, 10.0, 84.0, 0.03, MAX).unwrap();
        assert_eq!(lots, 1);
        // Huge budget clamps to the cap
        let lots = lots_from_amount(1e12, AmountCcy::Usd, 100, 0.01, 1.0, 84.0, 0.03, 500).unwrap();
        assert_eq!(lots, 500);
    }

    #[test]
    fn test_infer_units_from_notional_estimate() {
        // notional 100 @ price 2 -> 50 coins -> 5 lots with mult 10
        let row: PositionRow = serde_json::from_value(
            serde_json::json!({"notional": 100.0, "mark_price": 2.0}),
        )
        .unwrap();
        let d = infer_position_units(5.0, 10.0, &row, MAX);
        assert_eq!(d.units, PositionUnits::Lots);
        assert_eq!(d.lots, 5);

        let d = infer_position_units(50.0, 10.0, &row, MAX);
        assert_eq!(d.units, PositionUnits::Coins);
        assert_eq!(d.lots, 5);
    }

    #[test]
    fn test_infer_units_ladder() {
        // Integer, not divisible by mult -> lots
        let d = infer_position_units(7.0, 10.0, &bare_row(), MAX);
        assert_eq!(d.units, PositionUnits::Lots);
        assert_eq!(d.lots, 7);

        // Above the per-order cap -> coins
        let d = infer_position_units(2_000_000.0, 10.0, &bare_row(), 1_000_000);
        assert_eq!(d.units, PositionUnits::Coins);

        // Divisible magnitude defaults to coins
        let d = infer_position_units(50.0, 10.0, &bare_row(), MAX);
        assert_eq!(d.units, PositionUnits::Coins);
        assert_eq!(d.lots, 5);

        // Multiplier 1 -> lots
        let d = infer_position_units(-3.0, 1.0, &bare_row(), MAX);
        assert_eq!(d.units, PositionUnits::Lots);
        assert_eq!(d.lots, 3);
    }

    #[test]
    fn test_infer_units_is_deterministic() {
        let row = bare_row();
        let a = infer_position_units(30.0, 10.0, &row, MAX);
        let b = infer_position_units(30.0, 10.0, &row, MAX);
        assert_eq!(a, b);
    }

    #[test]
    fn test_tp_explicit_coins() {
        // normalizeTpSize(lotMult=M, size_coins=k*M) = k
        for k in 1..5 {
            let lots = normalize_tp_size(&leg(None, Some(k as f64 * 10.0)), 10.0, None, MAX);
            assert_eq!(lots, k);
        }
    }

    #[test]
    fn test_tp_round_multiple_reads_as_coins() {
        // lot_mult 1000, sizes 3000/2000 with last entry 5 lots -> 3 and 2 lots
        let last = last_entry(5, 1000.0);
        assert_eq!(
            normalize_tp_size(&leg(Some(3000.0), None), 1000.0, Some(&last), MAX),
            3
        );
        assert_eq!(
            normalize_tp_size(&leg(Some(2000.0), None), 1000.0, Some(&last), MAX),
            2
        );
    }

    #[test]
    fn test_tp_small_integer_near_last_lots_reads_as_lots() {
        let last = last_entry(5, 10.0);
        // 7 <= 2*5, integer, not a round multiple -> lots
        assert_eq!(normalize_tp_size(&leg(Some(7.0), None), 10.0, Some(&last), MAX), 7);
    }

    #[test]
    fn test_tp_near_last_coins_reads_as_coins() {
        let last = last_entry(10, 10.0); // last_coins = 100
        // 55.5 is not integer, >= max(50, 20) -> coins, floor(55.5/10) = 5
        assert_eq!(
            normalize_tp_size(&leg(Some(55.5), None), 10.0, Some(&last), MAX),
            5
        );
    }

    #[test]
    fn test_tp_fallback_rounds() {
        assert_eq!(normalize_tp_size(&leg(Some(2.4), None), 1.0, None, MAX), 2);
        assert_eq!(normalize_tp_size(&leg(Some(0.4), None), 1.0, None, MAX), 1);
    }

    #[test]
    fn test_clamp_passthrough_when_within_position() {
        assert_eq!(clamp_legs_to_position(&[3, 2], 5), vec![3, 2]);
        assert_eq!(clamp_legs_to_position(&[1, 1], 5), vec![1, 1]);
    }

    #[test]
    fn test_clamp_drops_legs_when_position_small() {
        // Position of 1 lot, 3 legs: one surviving leg of one lot
        assert_eq!(clamp_legs_to_position(&[5, 3, 2], 1), vec![1]);
        assert_eq!(clamp_legs_to_position(&[5, 3, 2], 2), vec![1, 1]);
    }

    #[test]
    fn test_clamp_scales_down_oversized_batch() {
        assert_eq!(clamp_legs_to_position(&[30, 20], 5), vec![3, 2]);
        // Remainder distribution lands on the exact position total
        let clamped = clamp_legs_to_position(&[10, 10, 10], 4);
        assert_eq!(clamped.iter().sum::<i64>(), 4);
        assert!(clamped.iter().all(|l| *l >= 1));
        // Tiny leg never scales below one
        let clamped = clamp_legs_to_position(&[5, 1], 3);
        assert_eq!(clamped.iter().sum::<i64>(), 3);
        assert!(clamped.iter().all(|l| *l >= 1));
    }

    #[test]
    fn test_clamp_never_exceeds_position() {
        for position in 1..12 {
            for legs in [vec![7, 5, 3], vec![100], vec![2, 2, 2, 2]] {
                let clamped = clamp_legs_to_position(&legs, position);
                assert!(clamped.iter().sum::<i64>() <= position);
                assert!(clamped.len() <= legs.len().min(position as usize));
            }
        }
    }
}
