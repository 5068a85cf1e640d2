//! Signal-chain execution
//!
//! Advances the three-step state machine for one chain: CANCAL flattens,
//! ENTER places the market entry, BATCH_TPS places reduce-only take-profit
//! legs sized off the live position. Steps run in protocol order; a step
//! whose message has not arrived yet parks the chain with a `waiting_for_*`
//! note. Progress flags are only raised after the exchange call succeeds,
//! so a failed dispatch is retried by the next delivery.

use crate::context::Engine;
use crate::flatten::{self, FlattenOptions};
use crate::sizing;
use relay_core::{
    BatchLegRequest, BatchOrdersRequest, EnterRequest, Error, NewOrderRequest, Result, Scope,
    Side, SignalKind, SignalMessage,
};
use relay_networking::api::{orders, positions, products};
use serde_json::json;
use sha1::{Digest, Sha1};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How long to let the fill settle before reading the position back for
/// lot-multiplier learning
const LEARN_DELAY_MS: u64 = 1500;

/// Outcome of one dispatch against a chain
#[derive(Debug)]
pub struct ChainOutcome {
    pub status: &'static str,
    pub queued: Option<&'static str>,
    /// Which slots held a message when the dispatch started
    pub have: [bool; 3],
    /// Which steps have completed after the dispatch
    pub did: [bool; 3],
    pub progressed: Vec<serde_json::Value>,
}

struct Snapshot {
    age_ms: u64,
    cancel_msg: Option<SignalMessage>,
    enter_msg: Option<SignalMessage>,
    batch_msg: Option<SignalMessage>,
    did_cancel: bool,
    did_enter_prep: bool,
    did_enter: bool,
    did_batch: bool,
}

/// Advance a chain as far as its buffered messages allow
pub async fn advance_chain(engine: Arc<Engine>, key: String) -> Result<ChainOutcome> {
    let snap = engine
        .state
        .chains
        .with_chain(&key, |c| Snapshot {
            age_ms: c.age_ms(),
            cancel_msg: c.cancel_msg.clone(),
            enter_msg: c.enter_msg.clone(),
            batch_msg: c.batch_msg.clone(),
            did_cancel: c.did_cancel(),
            did_enter_prep: c.did_enter_prep(),
            did_enter: c.did_enter(),
            did_batch: c.did_batch(),
        })
        .ok_or_else(|| Error::Internal("chain record evicted before dispatch".to_string()))?;

    if snap.age_ms > engine.cfg.chain_window_ms {
        return Err(Error::ChainExpired {
            age_ms: snap.age_ms,
            window_ms: engine.cfg.chain_window_ms,
        });
    }

    let have = [
        snap.cancel_msg.is_some(),
        snap.enter_msg.is_some(),
        snap.batch_msg.is_some(),
    ];
    let mut did_cancel = snap.did_cancel;
    let mut did_enter = snap.did_enter;
    let mut did_batch = snap.did_batch;
    let mut did_enter_prep = snap.did_enter_prep;
    let mut progressed = Vec::new();

    let outcome = |status: &'static str,
                   queued: Option<&'static str>,
                   progressed: Vec<serde_json::Value>,
                   did: [bool; 3]| ChainOutcome {
        status,
        queued,
        have,
        did,
        progressed,
    };

    // ── Step 0: CANCAL ──────────────────────────────────────────────
    if !did_cancel {
        if let Some(msg) = &snap.cancel_msg {
            let entry = execute_cancel(&engine, msg).await?;
            engine.state.chains.with_chain(&key, |c| c.mark_cancel());
            did_cancel = true;
            progressed.push(entry);
        } else if engine.cfg.auto_cancel_on_enter && snap.enter_msg.is_some() {
            // Synthesize the missing cancel from the buffered enter
            if let Some(enter) = &snap.enter_msg {
                let opts = FlattenOptions {
                    scope: Scope::Symbol,
                    symbol: enter.envelope.product_symbol.clone(),
                    cancel_orders: true,
                    close_position: engine.cfg.force_close_on_cancel,
                    fallback_all: false,
                };
                let report = flatten::flatten(&engine, &opts).await?;
                engine.state.chains.with_chain(&key, |c| c.mark_cancel());
                did_cancel = true;
                progressed.push(json!({
                    "step": "CANCAL",
                    "synthesized": true,
                    "report": report,
                }));
            }
        } else if enter_requests_preflight(&snap.enter_msg) {
            // The buffered ENTER will flatten on its own; a separate cancel
            // step would be redundant
            engine.state.chains.with_chain(&key, |c| c.mark_cancel());
            did_cancel = true;
            progressed.push(json!({"step": "CANCAL", "skipped": true}));
        } else {
            return Ok(outcome(
                "queued",
                Some("waiting_for_CANCAL"),
                progressed,
                [did_cancel, did_enter, did_batch],
            ));
        }
    }

    // ── Step 1: ENTER ───────────────────────────────────────────────
    if !did_enter {
        let Some(msg) = &snap.enter_msg else {
            let status = if progressed.is_empty() { "queued" } else { "progressed" };
            return Ok(outcome(
                status,
                Some("waiting_for_ENTER"),
                progressed,
                [did_cancel, did_enter, did_batch],
            ));
        };
        let entry = execute_enter(&engine, &key, msg, &mut did_enter_prep).await?;
        engine.state.chains.with_chain(&key, |c| c.mark_enter());
        did_enter = true;
        progressed.push(entry);
    }

    // ── Step 2: BATCH_TPS ───────────────────────────────────────────
    if !did_batch {
        let Some(msg) = &snap.batch_msg else {
            let status = if progressed.is_empty() { "queued" } else { "progressed" };
            return Ok(outcome(
                status,
                Some("waiting_for_BATCH_TPS"),
                progressed,
                [did_cancel, did_enter, did_batch],
            ));
        };
        let entry = execute_batch(&engine, msg).await?;
        engine.state.chains.with_chain(&key, |c| c.mark_batch());
        did_batch = true;
        progressed.push(entry);
    }

    let status = if did_cancel && did_enter && did_batch {
        "done"
    } else {
        "progressed"
    };
    Ok(outcome(status, None, progressed, [did_cancel, did_enter, did_batch]))
}

fn enter_requests_preflight(enter_msg: &Option<SignalMessage>) -> bool {
    match enter_msg.as_ref().map(|m| &m.kind) {
        Some(SignalKind::Enter(e)) => e.cancel_orders || e.close_position,
        _ => false,
    }
}

async fn execute_cancel(engine: &Engine, msg: &SignalMessage) -> Result<serde_json::Value> {
    let SignalKind::Cancal(req) = &msg.kind else {
        return Err(Error::Internal("cancel slot holds a non-CANCAL message".to_string()));
    };

    let mut opts = FlattenOptions {
        scope: msg.envelope.scope,
        symbol: msg.envelope.product_symbol.clone(),
        cancel_orders: req
            .cancel_orders
            .unwrap_or(engine.cfg.force_cancel_orders_on_cancel),
        close_position: req
            .close_position
            .unwrap_or(engine.cfg.force_close_on_cancel),
        fallback_all: req.fallback_all,
    };

    // An account-wide order cancel may ride on a symbol-scoped close
    let mut cancelled_all = false;
    if opts.cancel_orders
        && opts.scope == Scope::Symbol
        && req.cancel_orders_scope == Some(Scope::All)
    {
        orders::cancel_all(&engine.client).await?;
        cancelled_all = true;
        opts.cancel_orders = false;
    }

    let mut report = flatten::flatten(engine, &opts).await?;
    report.cancelled_all = report.cancelled_all || cancelled_all;

    let mut entry = json!({
        "step": "CANCAL",
        "scope": opts.scope,
        "report": report,
    });
    if req.require_flat {
        let symbol = match opts.scope {
            Scope::Symbol => opts.symbol.as_deref(),
            Scope::All => None,
        };
        let flat = flatten::wait_until_flat(engine, symbol, engine.cfg.flat_timeout_ms).await;
        entry["flat"] = json!(flat);
    }
    Ok(entry)
}

async fn execute_enter(
    engine: &Arc<Engine>,
    key: &str,
    msg: &SignalMessage,
    did_enter_prep: &mut bool,
) -> Result<serde_json::Value> {
    let SignalKind::Enter(req) = &msg.kind else {
        return Err(Error::Internal("enter slot holds a non-ENTER message".to_string()));
    };
    let symbol = msg
        .envelope
        .product_symbol
        .clone()
        .ok_or_else(|| Error::MissingField("product_symbol".to_string()))?;

    // Preflight flatten runs once per chain, even across retried dispatches
    if !*did_enter_prep {
        if req.cancel_orders || req.close_position {
            let opts = FlattenOptions {
                scope: Scope::Symbol,
                symbol: Some(symbol.clone()),
                cancel_orders: req.cancel_orders,
                close_position: req.close_position,
                fallback_all: false,
            };
            flatten::flatten(engine, &opts).await?;
        }
        engine.state.chains.with_chain(key, |c| c.mark_enter_prep());
        *did_enter_prep = true;
    }

    if req.require_flat.unwrap_or(true) {
        ensure_flat_for_enter(engine, &symbol).await?;
    }

    let size_lots = resolve_entry_size(engine, req, &symbol).await?;
    let lot_mult = engine.state.products.lot_multiplier(&symbol);

    let order = NewOrderRequest::market(symbol.clone(), req.side, size_lots);
    orders::place_order(&engine.client, &order).await?;
    info!("Entry placed: {} {} x{} lots", symbol, req.side, size_lots);

    engine.state.memo.record(&symbol, size_lots, req.side, lot_mult);
    schedule_multiplier_learning(Arc::clone(engine), symbol.clone(), size_lots);

    Ok(json!({
        "step": "ENTER",
        "side": req.side,
        "size": size_lots,
        "lot_mult": lot_mult,
    }))
}

/// Gate an entry on flatness. Fast-enter tries a short wait and one longer
/// retry instead of the full flat timeout.
async fn ensure_flat_for_enter(engine: &Engine, symbol: &str) -> Result<()> {
    if flatten::is_flat(engine, Some(symbol)).await.unwrap_or(false) {
        return Ok(());
    }

    let flat = if engine.cfg.fast_enter {
        flatten::wait_until_flat(engine, Some(symbol), engine.cfg.fast_enter_wait_ms).await
            || flatten::wait_until_flat(engine, Some(symbol), engine.cfg.fast_enter_retry_ms).await
    } else {
        flatten::wait_until_flat(engine, Some(symbol), engine.cfg.flat_timeout_ms).await
    };

    if flat {
        Ok(())
    } else {
        Err(Error::FlatTimeout(format!("{} not flat before ENTER", symbol)))
    }
}

/// Entry size: explicit qty caps a budget when both are present
async fn resolve_entry_size(engine: &Engine, req: &EnterRequest, symbol: &str) -> Result<i64> {
    products::ensure_fresh(&engine.client, &engine.state.products).await?;
    let lot_mult = engine.state.products.lot_multiplier(symbol);

    let budget_lots = match &req.budget {
        Some(budget) => {
            let price = match req.entry_price {
                Some(p) => p,
                None => products::ticker_price(&engine.client, symbol).await?,
            };
            Some(sizing::lots_from_amount(
                budget.amount,
                budget.ccy,
                req.leverage.unwrap_or(engine.cfg.default_leverage),
                price,
                lot_mult,
                req.fx_inr_per_usd.unwrap_or(engine.cfg.fx_inr_per_usd),
                engine.cfg.margin_buffer_pct,
                engine.cfg.max_lots_per_order,
            )?)
        }
        None => None,
    };

    let size = match (req.qty, budget_lots) {
        (Some(qty), Some(budget)) => qty.min(budget),
        (None, Some(budget)) => budget,
        (Some(qty), None) => qty,
        (None, None) => return Err(Error::MissingField("qty or amount".to_string())),
    };
    Ok(size.clamp(1, engine.cfg.max_lots_per_order))
}

async fn execute_batch(engine: &Engine, msg: &SignalMessage) -> Result<serde_json::Value> {
    let SignalKind::BatchTps(req) = &msg.kind else {
        return Err(Error::Internal("batch slot holds a non-BATCH message".to_string()));
    };
    let symbol = msg
        .envelope
        .product_symbol
        .clone()
        .ok_or_else(|| Error::MissingField("product_symbol".to_string()))?;

    let product_id = products::product_id(&engine.client, &engine.state.products, &symbol).await?;

    // The live position decides side and size; any side hint in the message
    // is ignored
    let Some(row) = positions::find_position(&engine.client, &symbol).await? else {
        return Err(Error::BatchRefused("no open position".to_string()));
    };
    let raw = row.size.unwrap_or(0.0);
    let close_side = if raw > 0.0 { Side::Sell } else { Side::Buy };

    let lot_mult = engine.state.products.lot_multiplier(&symbol);
    let position = sizing::infer_position_units(raw, lot_mult, &row, engine.cfg.max_lots_per_order);
    let last = engine.state.memo.get(&symbol);

    let pre_lots: Vec<i64> = req
        .legs
        .iter()
        .map(|leg| sizing::normalize_tp_size(leg, lot_mult, last.as_ref(), engine.cfg.max_lots_per_order))
        .collect();
    let clamped = sizing::clamp_legs_to_position(&pre_lots, position.lots);
    if clamped.is_empty() {
        return Err(Error::BatchRefused("no legs survive position clamp".to_string()));
    }

    let total: i64 = clamped.iter().sum();
    if total > position.lots {
        return Err(Error::BatchRefused(format!(
            "batch total {} exceeds position {}",
            total, position.lots
        )));
    }

    let sig_id = msg.envelope.sig_id.as_deref().unwrap_or("");
    let now_ms = chrono::Utc::now().timestamp_millis();
    let legs: Vec<BatchLegRequest> = clamped
        .iter()
        .enumerate()
        .map(|(idx, lots)| {
            let src = &req.legs[idx];
            BatchLegRequest {
                limit_price: format_price(src.limit_price),
                size: *lots,
                side: close_side,
                order_type: "limit_order",
                reduce_only: true,
                client_order_id: src
                    .client_order_id
                    .clone()
                    .filter(|id| !id.is_empty() && id.len() <= 32)
                    .unwrap_or_else(|| short_client_order_id(sig_id, &symbol, idx, now_ms)),
                post_only: src.post_only.then_some(true),
                mmp: src.mmp.then_some(true),
            }
        })
        .collect();

    info!(
        "TP batch for {}: {} legs, {} lots total, side {} (position {} lots)",
        symbol,
        legs.len(),
        total,
        close_side,
        position.lots
    );
    let batch = BatchOrdersRequest {
        product_id,
        product_symbol: symbol.clone(),
        orders: legs,
    };
    orders::place_batch(&engine.client, &batch).await?;

    Ok(json!({
        "step": "BATCH_TPS",
        "side": close_side,
        "legs": clamped.len(),
        "total_lots": total,
        "position_lots": position.lots,
    }))
}

/// Non-blocking lot-multiplier learning after an entry fill
pub fn schedule_multiplier_learning(engine: Arc<Engine>, symbol: String, lots_sent: i64) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(LEARN_DELAY_MS)).await;
        match positions::find_position(&engine.client, &symbol).await {
            Ok(Some(row)) => {
                let coins = match (row.notional, row.reference_price()) {
                    (Some(notional), Some(price)) if notional > 0.0 && price > 0.0 => {
                        notional / price
                    }
                    _ => row.size.map(f64::abs).unwrap_or(0.0),
                };
                let outcome = engine.state.products.learn(&symbol, coins, lots_sent);
                debug!("Lot-multiplier learning for {}: {:?}", symbol, outcome);
            }
            Ok(None) => debug!("No position visible for {} after entry, skipping learning", symbol),
            Err(e) => debug!("Learning fetch failed for {}: {}", symbol, e),
        }
    });
}

/// Price formatting for the wire: shortest roundtrip decimal
fn format_price(price: f64) -> String {
    format!("{}", price)
}

/// Client order id for one TP leg, at most 32 characters:
/// `T<idx><sanitized-symbol-prefix>_` + truncated SHA-1 of the full tuple.
pub fn short_client_order_id(sig_id: &str, product_symbol: &str, idx: usize, now_ms: i64) -> String {
    let sanitized: String = product_symbol
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(6)
        .collect::<String>()
        .to_ascii_uppercase();
    let prefix = format!("T{}{}_", idx, sanitized);

    let mut hasher = Sha1::new();
    hasher.update(format!("{}|{}|TP|{}|{}", sig_id, product_symbol, idx, now_ms).as_bytes());
    let digest = hex::encode(hasher.finalize());

    let budget = 32usize.saturating_sub(prefix.len());
    format!("{}{}", prefix, &digest[..budget.min(digest.len())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id_fits_and_is_prefixed() {
        let id = short_client_order_id("signal-123", "ARCUSD.P", 0, 1_700_000_000_000);
        assert!(id.len() <= 32);
        assert!(id.starts_with("T0ARCUSD_"));
    }

    #[test]
    fn test_short_id_distinct_per_leg() {
        let a = short_client_order_id("S1", "ARCUSD", 0, 1_700_000_000_000);
        let b = short_client_order_id("S1", "ARCUSD", 1, 1_700_000_000_000);
        assert_ne!(a, b);
    }

    #[test]
    fn test_short_id_handles_long_symbols() {
        let id = short_client_order_id("S1", "1000SHIBUSDT", 12, 1_700_000_000_000);
        assert!(id.len() <= 32);
        assert!(id.starts_with("T12"));
    }

    #[test]
    fn test_format_price_is_compact() {
        assert_eq!(format_price(2.1), "2.1");
        assert_eq!(format_price(0.00123), "0.00123");
        assert_eq!(format_price(100.0), "100");
    }
}
