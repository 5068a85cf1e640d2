//! Relay Networking - Signed exchange HTTP client and typed API calls

pub mod api;
pub mod http;

pub use http::client::{AuthMode, ClientConfig, ExchangeClient};
