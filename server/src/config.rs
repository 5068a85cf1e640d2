//! Environment configuration
//!
//! Required variables are checked first and reported by name; everything
//! else has a default matching the engine defaults.

use relay_core::{Error, Result};
use relay_engine::EngineConfig;
use relay_networking::{AuthMode, ClientConfig};
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub auth_mode: AuthMode,
    /// Compared verbatim against the `x-webhook-token` header when set
    pub webhook_token: Option<String>,
    pub header_api_key: String,
    pub header_signature: String,
    pub header_timestamp: String,
    pub port: u16,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Result<Config> {
        // Required vars first, so a broken deployment fails with a clear name
        let base_url = required("DELTA_BASE_URL")?;
        let api_key = required("DELTA_API_KEY")?;

        let auth_mode = match env::var("AUTH_MODE").ok().as_deref() {
            None => AuthMode::Hmac,
            Some(mode) if mode.eq_ignore_ascii_case("hmac") => AuthMode::Hmac,
            Some(mode) if mode.eq_ignore_ascii_case("keyonly") => AuthMode::KeyOnly,
            Some(other) => {
                return Err(Error::ConfigError(format!(
                    "AUTH_MODE must be hmac or keyonly (got {})",
                    other
                )))
            }
        };
        let api_secret = match auth_mode {
            AuthMode::Hmac => required("DELTA_API_SECRET")?,
            AuthMode::KeyOnly => env::var("DELTA_API_SECRET").unwrap_or_default(),
        };

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            default_leverage: parsed("DEFAULT_LEVERAGE", defaults.default_leverage)?,
            fx_inr_per_usd: parsed("FX_INR_PER_USD", defaults.fx_inr_per_usd)?,
            margin_buffer_pct: parsed("MARGIN_BUFFER_PCT", defaults.margin_buffer_pct)?,
            max_lots_per_order: parsed("MAX_LOTS_PER_ORDER", defaults.max_lots_per_order)?,
            flat_timeout_ms: parsed("FLAT_TIMEOUT_MS", defaults.flat_timeout_ms)?,
            flat_poll_ms: parsed("FLAT_POLL_MS", defaults.flat_poll_ms)?,
            fast_enter: parsed_bool("FAST_ENTER", defaults.fast_enter)?,
            fast_enter_wait_ms: parsed("FAST_ENTER_WAIT_MS", defaults.fast_enter_wait_ms)?,
            fast_enter_retry_ms: parsed("FAST_ENTER_RETRY_MS", defaults.fast_enter_retry_ms)?,
            strict_sequence: parsed_bool("STRICT_SEQUENCE", defaults.strict_sequence)?,
            chain_window_ms: parsed("SIGNAL_CHAIN_WINDOW_MS", defaults.chain_window_ms)?,
            auto_cancel_on_enter: parsed_bool("AUTO_CANCEL_ON_ENTER", defaults.auto_cancel_on_enter)?,
            force_cancel_orders_on_cancel: parsed_bool(
                "FORCE_CANCEL_ORDERS_ON_CANCEL",
                defaults.force_cancel_orders_on_cancel,
            )?,
            force_close_on_cancel: parsed_bool("FORCE_CLOSE_ON_CANCEL", defaults.force_close_on_cancel)?,
        };

        Ok(Config {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            api_secret,
            auth_mode,
            webhook_token: env::var("WEBHOOK_TOKEN").ok().filter(|t| !t.is_empty()),
            header_api_key: env::var("HEADER_API_KEY").unwrap_or_else(|_| "api-key".to_string()),
            header_signature: env::var("HEADER_SIGNATURE")
                .unwrap_or_else(|_| "signature".to_string()),
            header_timestamp: env::var("HEADER_TIMESTAMP")
                .unwrap_or_else(|_| "timestamp".to_string()),
            port: parsed("PORT", 8787)?,
            engine,
        })
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            api_secret: self.api_secret.clone(),
            auth_mode: self.auth_mode,
            header_api_key: self.header_api_key.clone(),
            header_signature: self.header_signature.clone(),
            header_timestamp: self.header_timestamp.clone(),
        }
    }
}

fn required(name: &str) -> Result<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::ConfigError(format!("Missing {}", name)))
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| Error::ConfigError(format!("Invalid {}: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

fn parsed_bool(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(raw) => parse_bool(&raw)
            .ok_or_else(|| Error::ConfigError(format!("Invalid {}: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_values() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool(" 1 "), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
