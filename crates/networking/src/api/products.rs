//! Product metadata and ticker lookups

use crate::ExchangeClient;
use relay_core::{Error, Product, Result, Ticker};
use relay_state::ProductsCache;
use reqwest::Method;
use tracing::debug;

/// Fetch the full products list
pub async fn fetch_products(client: &ExchangeClient) -> Result<Vec<Product>> {
    let response = client.call(Method::GET, "/v2/products", None, None).await?;
    let result = response
        .get("result")
        .cloned()
        .unwrap_or(serde_json::Value::Array(Vec::new()));
    let products: Vec<Product> = serde_json::from_value(result)?;
    debug!("Fetched {} products", products.len());
    Ok(products)
}

/// Refresh the cache when the snapshot is stale (at most once per TTL)
pub async fn ensure_fresh(client: &ExchangeClient, cache: &ProductsCache) -> Result<()> {
    if cache.needs_refresh() {
        let products = fetch_products(client).await?;
        cache.store_snapshot(products);
    }
    Ok(())
}

/// Resolve a product id, refreshing the snapshot if needed
pub async fn product_id(
    client: &ExchangeClient,
    cache: &ProductsCache,
    symbol: &str,
) -> Result<i64> {
    ensure_fresh(client, cache).await?;
    cache
        .product_id(symbol)
        .ok_or_else(|| Error::ProductNotFound(symbol.to_string()))
}

/// Current USD price for a symbol from the ticker endpoint.
/// The result may be a single ticker object or a list.
pub async fn ticker_price(client: &ExchangeClient, symbol: &str) -> Result<f64> {
    let query = format!("symbol={}", symbol);
    let response = client
        .call(Method::GET, "/v2/tickers", Some(&query), None)
        .await?;
    let result = response.get("result").cloned().unwrap_or_default();

    let ticker: Option<Ticker> = match result {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|v| serde_json::from_value::<Ticker>(v).ok())
            .find(|t| {
                t.symbol
                    .as_deref()
                    .map(|s| s.eq_ignore_ascii_case(symbol))
                    .unwrap_or(true)
            }),
        obj @ serde_json::Value::Object(_) => serde_json::from_value(obj).ok(),
        _ => None,
    };

    ticker
        .and_then(|t| t.best_price())
        .ok_or_else(|| Error::SizingError(format!("no usable ticker price for {}", symbol)))
}
