//! Exchange HTTP client with HMAC signing and bounded retry
//!
//! Every request can be retried up to three times on transient failures
//! (HTTP 429/5xx, or a `success:false` body carrying one of those codes)
//! with linear backoff. The signature binds the timestamp, so the canonical
//! payload is rebuilt with a fresh timestamp on every attempt.

use hmac::{Hmac, Mac};
use relay_core::{Error, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Method;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, instrument, warn};

type HmacSha256 = Hmac<Sha256>;

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_MS: u64 = 300;
const RETRYABLE_CODES: [u16; 5] = [429, 500, 502, 503, 504];

/// How requests are authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// api-key + HMAC-SHA256 signature + timestamp headers
    Hmac,
    /// api-key header only
    KeyOnly,
}

/// Static client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub auth_mode: AuthMode,
    pub header_api_key: String,
    pub header_signature: String,
    pub header_timestamp: String,
}

impl ClientConfig {
    pub fn new(base_url: String, api_key: String, api_secret: String) -> Self {
        Self {
            base_url,
            api_key,
            api_secret,
            auth_mode: AuthMode::Hmac,
            header_api_key: "api-key".to_string(),
            header_signature: "signature".to_string(),
            header_timestamp: "timestamp".to_string(),
        }
    }
}

/// HTTP client for the derivatives exchange REST API
pub struct ExchangeClient {
    http: reqwest::Client,
    cfg: ClientConfig,
}

impl ExchangeClient {
    pub fn new(cfg: ClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .expect("Failed to create HTTP client");
        Self { http, cfg }
    }

    /// Issue a signed request and return the parsed JSON body.
    ///
    /// `query` is the raw query string without the leading `?` (it takes
    /// part in the signature byte-for-byte, so it is never re-encoded).
    #[instrument(skip(self, body), fields(method = %method, path = path))]
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let body_string = body.map(|b| b.to_string()).unwrap_or_default();
        let url = match query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", self.cfg.base_url, path, q),
            _ => format!("{}{}", self.cfg.base_url, path),
        };

        let mut attempt = 1;
        loop {
            let response = self
                .request(&method, path, query, &url, &body_string)
                .send()
                .await?;

            let status = response.status().as_u16();
            let text = response.text().await?;
            let json: serde_json::Value = serde_json::from_str(&text)
                .unwrap_or_else(|_| serde_json::json!({ "raw": text }));

            if is_transient(status, &json) {
                if attempt < MAX_ATTEMPTS {
                    let delay = Duration::from_millis(BACKOFF_MS * attempt as u64);
                    warn!(
                        "Transient exchange error ({} attempt {}/{}), retrying in {:?}",
                        status, attempt, MAX_ATTEMPTS, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Err(Error::ExchangeError {
                    method: method.to_string(),
                    url,
                    status,
                    body: json.to_string(),
                });
            }

            if !(200..300).contains(&status) || json.get("success") == Some(&serde_json::json!(false))
            {
                return Err(Error::ExchangeError {
                    method: method.to_string(),
                    url,
                    status,
                    body: json.to_string(),
                });
            }

            debug!("Exchange call ok: {} {} ({})", method, path, status);
            return Ok(json);
        }
    }

    fn request(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        url: &str,
        body_string: &str,
    ) -> reqwest::RequestBuilder {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(&self.cfg.api_key) {
            if let Ok(name) = self.cfg.header_api_key.parse::<reqwest::header::HeaderName>() {
                headers.insert(name, value);
            }
        }

        if self.cfg.auth_mode == AuthMode::Hmac {
            // Fresh timestamp per attempt; the signature binds it
            let ts = chrono::Utc::now().timestamp().to_string();
            let canonical =
                canonical_payload(method.as_str(), &ts, path, query.unwrap_or(""), body_string);
            let signature = self.sign(&canonical);
            if let (Ok(sig_name), Ok(ts_name)) = (
                self.cfg.header_signature.parse::<reqwest::header::HeaderName>(),
                self.cfg.header_timestamp.parse::<reqwest::header::HeaderName>(),
            ) {
                if let (Ok(sig_value), Ok(ts_value)) =
                    (HeaderValue::from_str(&signature), HeaderValue::from_str(&ts))
                {
                    headers.insert(sig_name, sig_value);
                    headers.insert(ts_name, ts_value);
                }
            }
        }

        let mut req = self.http.request(method.clone(), url).headers(headers);
        if !body_string.is_empty() {
            req = req.body(body_string.to_string());
        }
        req
    }

    fn sign(&self, canonical: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.cfg.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(canonical.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// The canonical string the signature is computed over:
/// `METHOD ‖ timestamp_seconds ‖ path ‖ query ‖ body`
pub fn canonical_payload(method: &str, ts: &str, path: &str, query: &str, body: &str) -> String {
    format!("{}{}{}{}{}", method, ts, path, query, body)
}

/// Retry condition: transient HTTP status, or a `success:false` body whose
/// error code is one of the transient statuses.
fn is_transient(status: u16, json: &serde_json::Value) -> bool {
    if RETRYABLE_CODES.contains(&status) {
        return true;
    }
    if json.get("success") == Some(&serde_json::json!(false)) {
        let code = json
            .get("error")
            .and_then(|e| e.get("code"))
            .or_else(|| json.get("code"));
        if let Some(code) = code {
            let numeric = code
                .as_u64()
                .or_else(|| code.as_str().and_then(|s| s.parse::<u64>().ok()));
            if let Some(n) = numeric {
                return RETRYABLE_CODES.contains(&(n as u16));
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_payload_layout() {
        let canonical = canonical_payload(
            "POST",
            "1700000000",
            "/v2/orders",
            "",
            r#"{"size":1}"#,
        );
        assert_eq!(canonical, r#"POST1700000000/v2/orders{"size":1}"#);

        let with_query = canonical_payload("GET", "1700000000", "/v2/orders", "states=open,pending&page_size=200", "");
        assert_eq!(
            with_query,
            "GET1700000000/v2/ordersstates=open,pending&page_size=200"
        );
    }

    #[test]
    fn test_signature_is_hex_and_deterministic() {
        let cfg = ClientConfig::new(
            "https://api.example.test".into(),
            "key".into(),
            "secret".into(),
        );
        let client = ExchangeClient::new(cfg);
        let a = client.sign("POST1700000000/v2/orders");
        let b = client.sign("POST1700000000/v2/orders");
        let c = client.sign("POST1700000001/v2/orders");
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(429, &json!({})));
        assert!(is_transient(503, &json!({})));
        assert!(!is_transient(400, &json!({})));
        assert!(is_transient(
            200,
            &json!({"success": false, "error": {"code": 503}})
        ));
        assert!(is_transient(200, &json!({"success": false, "code": "429"})));
        assert!(!is_transient(
            200,
            &json!({"success": false, "error": {"code": "insufficient_margin"}})
        ));
        assert!(!is_transient(200, &json!({"success": true})));
    }
}
