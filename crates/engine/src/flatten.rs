//! Flatten primitives
//!
//! "Flat" means no open orders and no position, optionally scoped to one
//! symbol. The composite here backs the CANCAL step, the ENTER preflight,
//! and the require-flat gate.

use crate::context::Engine;
use crate::sizing::infer_position_units;
use relay_core::{CancelOrderRequest, Error, NewOrderRequest, Result, Scope, Side};
use relay_networking::api::{orders, positions, products};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Order states that count against flatness
const BUSY_STATES: [&str; 4] = ["open", "pending", "triggered", "untriggered"];

/// What a flatten invocation should do
#[derive(Debug, Clone)]
pub struct FlattenOptions {
    pub scope: Scope,
    pub symbol: Option<String>,
    pub cancel_orders: bool,
    pub close_position: bool,
    /// Fall back to cancel-all when a per-order cancel fails
    pub fallback_all: bool,
}

/// What a flatten invocation actually did
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlattenReport {
    pub cancelled_orders: usize,
    pub cancelled_all: bool,
    pub closed_position: bool,
}

/// Cancel open orders and/or close positions per the options
pub async fn flatten(engine: &Engine, opts: &FlattenOptions) -> Result<FlattenReport> {
    let mut report = FlattenReport::default();

    match opts.scope {
        Scope::All => {
            if opts.cancel_orders {
                orders::cancel_all(&engine.client).await?;
                report.cancelled_all = true;
                info!("Cancelled all open orders (scope ALL)");
            }
            if opts.close_position {
                orders::close_all_positions(&engine.client).await?;
                report.closed_position = true;
                info!("Closed all positions (scope ALL)");
            }
        }
        Scope::Symbol => {
            let symbol = opts
                .symbol
                .as_deref()
                .ok_or_else(|| Error::MissingField("product_symbol".to_string()))?;
            if opts.cancel_orders {
                report.cancelled_orders =
                    cancel_orders_for_symbol(engine, symbol, opts.fallback_all).await?;
            }
            if opts.close_position {
                report.closed_position = close_position_for_symbol(engine, symbol).await?;
            }
        }
    }

    Ok(report)
}

/// Cancel every open order on one symbol. Returns the number cancelled.
pub async fn cancel_orders_for_symbol(
    engine: &Engine,
    symbol: &str,
    fallback_all: bool,
) -> Result<usize> {
    let open = orders::list_open_orders(&engine.client).await?;
    let mine: Vec<_> = open
        .into_iter()
        .filter(|o| {
            o.product_symbol
                .as_deref()
                .map(|s| s.eq_ignore_ascii_case(symbol))
                .unwrap_or(false)
        })
        .collect();

    if mine.is_empty() {
        debug!("No open orders to cancel for {}", symbol);
        return Ok(0);
    }

    let mut cancelled = 0;
    let mut any_failed = false;
    for order in &mine {
        let product_id = match order.product_id {
            Some(id) => id,
            None => products::product_id(&engine.client, &engine.state.products, symbol).await?,
        };
        let request = CancelOrderRequest {
            id: Some(order.id),
            client_order_id: order.client_order_id.clone(),
            product_id,
        };
        match orders::cancel_order(&engine.client, &request).await {
            Ok(_) => cancelled += 1,
            Err(e) => {
                warn!("Cancel failed for {} order {}: {}", symbol, order.id, e);
                any_failed = true;
            }
        }
    }

    if any_failed && fallback_all {
        warn!("Falling back to cancel-all after per-order failures on {}", symbol);
        orders::cancel_all(&engine.client).await?;
    }

    info!("Cancelled {}/{} orders for {}", cancelled, mine.len(), symbol);
    Ok(cancelled)
}

/// Close the live position on one symbol with a reduce-only market order.
/// No-op (returns false) when there is no position.
pub async fn close_position_for_symbol(engine: &Engine, symbol: &str) -> Result<bool> {
    let Some(row) = positions::find_position(&engine.client, symbol).await? else {
        debug!("No position to close for {}", symbol);
        return Ok(false);
    };
    let raw = row.size.unwrap_or(0.0);
    if raw == 0.0 {
        return Ok(false);
    }

    products::ensure_fresh(&engine.client, &engine.state.products).await?;
    let lot_mult = engine.state.products.lot_multiplier(symbol);
    let decision = infer_position_units(raw, lot_mult, &row, engine.cfg.max_lots_per_order);
    let close_side = if raw > 0.0 { Side::Sell } else { Side::Buy };

    info!(
        "Closing {} position: raw {} read as {:?} -> {} lots, side {}",
        symbol, raw, decision.units, decision.lots, close_side
    );
    let order =
        NewOrderRequest::market(symbol.to_ascii_uppercase(), close_side, decision.lots).reduce_only();
    orders::place_order(&engine.client, &order).await?;
    Ok(true)
}

/// One flatness probe. Transient errors bubble up to the caller.
pub async fn is_flat(engine: &Engine, symbol: Option<&str>) -> Result<bool> {
    let open = orders::list_open_orders(&engine.client).await?;
    let busy_order = open.iter().any(|o| {
        let state_busy = o
            .state
            .as_deref()
            .map(|s| BUSY_STATES.contains(&s))
            .unwrap_or(true);
        let symbol_match = match symbol {
            Some(sym) => o
                .product_symbol
                .as_deref()
                .map(|s| s.eq_ignore_ascii_case(sym))
                .unwrap_or(false),
            None => true,
        };
        state_busy && symbol_match
    });
    if busy_order {
        return Ok(false);
    }

    let rows = positions::list_positions(&engine.client).await?;
    let has_position = rows.iter().any(|row| {
        let symbol_match = match symbol {
            Some(sym) => row
                .product_symbol
                .as_deref()
                .map(|s| s.eq_ignore_ascii_case(sym))
                .unwrap_or(false),
            None => true,
        };
        symbol_match && row.size.map(|s| s.abs() > f64::EPSILON).unwrap_or(false)
    });
    Ok(!has_position)
}

/// Poll until flat or until the deadline. Transient errors are swallowed;
/// only the timeout is observable.
pub async fn wait_until_flat(engine: &Engine, symbol: Option<&str>, timeout_ms: u64) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        match is_flat(engine, symbol).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => debug!("Flat probe error (ignored): {}", e),
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(engine.cfg.flat_poll_ms)).await;
    }
}
