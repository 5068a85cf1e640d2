//! Shared engine context
//!
//! The engine never reaches for globals: the exchange client, every
//! process-wide store, and the tuning knobs are injected through one
//! collaborator.

use relay_networking::ExchangeClient;
use relay_state::RelayState;
use std::sync::Arc;

/// Tuning knobs for the signal-chain engine. Defaults match the deployment
/// env-var defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_leverage: u32,
    /// Fallback INR-per-USD rate when the message carries none
    pub fx_inr_per_usd: f64,
    /// Haircut applied to notional before sizing (0.03 = 3%)
    pub margin_buffer_pct: f64,
    pub max_lots_per_order: i64,
    pub flat_timeout_ms: u64,
    pub flat_poll_ms: u64,
    pub fast_enter: bool,
    pub fast_enter_wait_ms: u64,
    pub fast_enter_retry_ms: u64,
    pub strict_sequence: bool,
    pub chain_window_ms: u64,
    pub auto_cancel_on_enter: bool,
    pub force_cancel_orders_on_cancel: bool,
    pub force_close_on_cancel: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_leverage: 10,
            fx_inr_per_usd: 84.0,
            margin_buffer_pct: 0.03,
            max_lots_per_order: 1_000_000,
            flat_timeout_ms: 15_000,
            flat_poll_ms: 400,
            fast_enter: true,
            fast_enter_wait_ms: 2_000,
            fast_enter_retry_ms: 8_000,
            strict_sequence: true,
            chain_window_ms: 120_000,
            auto_cancel_on_enter: true,
            force_cancel_orders_on_cancel: true,
            force_close_on_cancel: false,
        }
    }
}

/// Everything a dispatch needs: client, stores, and configuration
pub struct Engine {
    pub client: Arc<ExchangeClient>,
    pub state: Arc<RelayState>,
    pub cfg: EngineConfig,
}

impl Engine {
    pub fn new(client: Arc<ExchangeClient>, state: Arc<RelayState>, cfg: EngineConfig) -> Self {
        Self { client, state, cfg }
    }
}
