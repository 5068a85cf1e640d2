//! Order placement, listing, and cancellation

use crate::ExchangeClient;
use relay_core::{
    BatchOrdersRequest, CancelOrderRequest, NewOrderRequest, OpenOrder, Result,
};
use reqwest::Method;
use tracing::debug;

const PAGE_SIZE: u32 = 200;

/// List all open and pending orders, following the `meta.after` cursor
pub async fn list_open_orders(client: &ExchangeClient) -> Result<Vec<OpenOrder>> {
    let mut all = Vec::new();
    let mut after: Option<String> = None;

    loop {
        let query = match &after {
            Some(cursor) => format!(
                "states=open,pending&page_size={}&after={}",
                PAGE_SIZE, cursor
            ),
            None => format!("states=open,pending&page_size={}", PAGE_SIZE),
        };
        let response = client
            .call(Method::GET, "/v2/orders", Some(&query), None)
            .await?;

        let page: Vec<OpenOrder> = response
            .get("result")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();

        if page.is_empty() {
            break;
        }
        all.extend(page);

        after = response
            .get("meta")
            .and_then(|m| m.get("after"))
            .and_then(|a| a.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        if after.is_none() {
            break;
        }
    }

    debug!("Listed {} open orders", all.len());
    Ok(all)
}

/// Place a single order (`POST /v2/orders`)
pub async fn place_order(
    client: &ExchangeClient,
    order: &NewOrderRequest,
) -> Result<serde_json::Value> {
    let body = serde_json::to_value(order)?;
    client.call(Method::POST, "/v2/orders", None, Some(&body)).await
}

/// Place a batch of orders (`POST /v2/orders/batch`)
pub async fn place_batch(
    client: &ExchangeClient,
    batch: &BatchOrdersRequest,
) -> Result<serde_json::Value> {
    let body = serde_json::to_value(batch)?;
    client
        .call(Method::POST, "/v2/orders/batch", None, Some(&body))
        .await
}

/// Cancel one order (`DELETE /v2/orders`)
pub async fn cancel_order(
    client: &ExchangeClient,
    request: &CancelOrderRequest,
) -> Result<serde_json::Value> {
    let body = serde_json::to_value(request)?;
    client
        .call(Method::DELETE, "/v2/orders", None, Some(&body))
        .await
}

/// Cancel every open order on the account (`DELETE /v2/orders/all`)
pub async fn cancel_all(client: &ExchangeClient) -> Result<serde_json::Value> {
    client.call(Method::DELETE, "/v2/orders/all", None, None).await
}

/// Close every position on the account (`POST /v2/positions/close_all`)
pub async fn close_all_positions(client: &ExchangeClient) -> Result<serde_json::Value> {
    let body = serde_json::json!({});
    client
        .call(Method::POST, "/v2/positions/close_all", None, Some(&body))
        .await
}
