//! Position queries

use crate::ExchangeClient;
use relay_core::{PositionRow, Result};
use reqwest::Method;
use tracing::{debug, warn};

/// List all positions. Some deployments only expose the margined endpoint,
/// so `/v2/positions/margined` is the fallback when the primary call fails.
pub async fn list_positions(client: &ExchangeClient) -> Result<Vec<PositionRow>> {
    let response = match client.call(Method::GET, "/v2/positions", None, None).await {
        Ok(r) => r,
        Err(primary_err) => {
            warn!("GET /v2/positions failed ({}), trying margined", primary_err);
            client
                .call(Method::GET, "/v2/positions/margined", None, None)
                .await?
        }
    };

    let rows: Vec<PositionRow> = response
        .get("result")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();
    debug!("Listed {} position rows", rows.len());
    Ok(rows)
}

/// The live position for a symbol, if any (zero-size rows don't count)
pub async fn find_position(
    client: &ExchangeClient,
    symbol: &str,
) -> Result<Option<PositionRow>> {
    let rows = list_positions(client).await?;
    Ok(rows.into_iter().find(|row| {
        row.product_symbol
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case(symbol))
            .unwrap_or(false)
            && row.size.map(|s| s.abs() > f64::EPSILON).unwrap_or(false)
    }))
}
