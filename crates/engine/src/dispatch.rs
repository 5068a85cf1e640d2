//! Webhook dispatcher
//!
//! One entry point per inbound message: parse, gate on strict sequencing,
//! dedupe, buffer into the chain, then advance the chain under the per-key
//! queue. The returned JSON is the webhook response body; transport errors
//! map to HTTP 400 at the server layer.

use crate::chain::advance_chain;
use crate::context::Engine;
use crate::queue::{queue_key, KeyedQueue};
use relay_core::{Result, Scope, SignalKind, SignalMessage};
use relay_state::{seen, sig_key};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

/// Serializes chain dispatches per key and aggregates their outcomes
pub struct Dispatcher {
    engine: Arc<Engine>,
    queue: KeyedQueue,
}

impl Dispatcher {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            queue: KeyedQueue::new(),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Handle one webhook delivery. `Ok` values map to HTTP 200, errors to
    /// HTTP 400.
    pub async fn handle(&self, body: &serde_json::Value) -> Result<serde_json::Value> {
        let msg = SignalMessage::parse(body)?;
        let action = msg.action_name().to_string();

        // EXIT and V1 legacy actions are acknowledged, never executed
        match &msg.kind {
            SignalKind::Exit | SignalKind::Legacy(_) => {
                debug!("Acknowledged non-chain action {}", action);
                return Ok(json!({"ok": true, "ignored": action}));
            }
            _ => {}
        }

        // Chain messages need an identity; dropping here is informational,
        // not a client error (the upstream may be mid-upgrade)
        let (Some(sig_id), Some(seq)) = (msg.envelope.sig_id.clone(), msg.envelope.seq) else {
            let note = if self.engine.cfg.strict_sequence {
                "missing sig_id/seq (strict mode)"
            } else {
                "missing sig_id/seq"
            };
            info!("Dropping {}: {}", action, note);
            return Ok(json!({"ok": true, "ignored": note}));
        };

        if msg.envelope.product_symbol.is_none() && msg.envelope.scope != Scope::All {
            return Err(relay_core::Error::MissingField("product_symbol".to_string()));
        }
        let psym = msg.envelope.product_symbol.clone().unwrap_or_default();

        // Idempotent replay: admit each fingerprint once per TTL window
        let fp = seen::fingerprint(&sig_id, &psym, seq, body.get("orders"));
        if !self.engine.state.seen.admit(&fp) {
            info!("Duplicate delivery for {} {} seq {}", sig_id, psym, seq);
            return Ok(json!({"ok": true, "dedup": true}));
        }

        let key = sig_key(&sig_id, &psym);
        let lane = queue_key(msg.envelope.scope, msg.envelope.product_symbol.as_deref());
        self.engine.state.chains.merge(&key, msg);

        debug!("Dispatching {} for chain {} on lane {}", action, key, lane);
        let engine = Arc::clone(&self.engine);
        let outcome = self
            .queue
            .run(&lane, advance_chain(engine, key))
            .await??;

        let mut response = json!({
            "ok": true,
            "status": outcome.status,
            "have": outcome.have,
            "did": outcome.did,
            "progressed": outcome.progressed,
        });
        if let Some(queued) = outcome.queued {
            response["queued"] = json!(queued);
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EngineConfig;
    use relay_networking::{ClientConfig, ExchangeClient};
    use relay_state::RelayState;
    use serde_json::json;

    /// Engine wired to a dead endpoint: anything that reaches the exchange
    /// fails fast with a network error.
    fn offline_dispatcher(cfg: EngineConfig) -> Dispatcher {
        let client = Arc::new(ExchangeClient::new(ClientConfig::new(
            "http://127.0.0.1:9".to_string(),
            "test-key".to_string(),
            "test-secret".to_string(),
        )));
        let state = Arc::new(RelayState::new());
        Dispatcher::new(Arc::new(Engine::new(client, state, cfg)))
    }

    #[tokio::test]
    async fn test_exit_and_legacy_are_acknowledged() {
        let dispatcher = offline_dispatcher(EngineConfig::default());
        let response = dispatcher
            .handle(&json!({"action": "EXIT", "sig_id": "S1", "seq": 1, "symbol": "ARCUSD"}))
            .await
            .unwrap();
        assert_eq!(response["ok"], json!(true));
        assert_eq!(response["ignored"], json!("EXIT"));

        let response = dispatcher
            .handle(&json!({"action": "CANCEL_ALL"}))
            .await
            .unwrap();
        assert_eq!(response["ignored"], json!("CANCEL_ALL"));
    }

    #[tokio::test]
    async fn test_strict_mode_drops_unkeyed_messages() {
        let dispatcher = offline_dispatcher(EngineConfig::default());
        let response = dispatcher
            .handle(&json!({"action": "CANCAL", "symbol": "ARCUSD"}))
            .await
            .unwrap();
        assert_eq!(response["ok"], json!(true));
        assert!(response["ignored"].as_str().unwrap().contains("sig_id"));
    }

    #[tokio::test]
    async fn test_missing_symbol_is_a_client_error() {
        let dispatcher = offline_dispatcher(EngineConfig::default());
        let result = dispatcher
            .handle(&json!({"action": "CANCAL", "sig_id": "S1", "seq": 0}))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_enter_before_cancal_queues_without_mutation() {
        // S2: auto-cancel off, ENTER first -> waiting_for_CANCAL, and the
        // dead endpoint proves no exchange call was attempted
        let cfg = EngineConfig {
            auto_cancel_on_enter: false,
            ..EngineConfig::default()
        };
        let dispatcher = offline_dispatcher(cfg);
        let response = dispatcher
            .handle(&json!({
                "action": "ENTER", "sig_id": "S2", "seq": 1,
                "symbol": "ARCUSD", "side": "buy", "qty": 3
            }))
            .await
            .unwrap();
        assert_eq!(response["status"], json!("queued"));
        assert_eq!(response["queued"], json!("waiting_for_CANCAL"));
        assert_eq!(response["did"], json!([false, false, false]));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_dedups() {
        // S5 shape: identical deliveries inside the TTL window reach the
        // exchange at most once (here: the first fails on the dead endpoint,
        // the second never leaves the dedup gate)
        let dispatcher = offline_dispatcher(EngineConfig::default());
        let body = json!({
            "action": "CANCAL", "sig_id": "S5", "seq": 0, "symbol": "ARCUSD"
        });
        let first = dispatcher.handle(&body).await;
        assert!(first.is_err());

        let second = dispatcher.handle(&body).await.unwrap();
        assert_eq!(second["dedup"], json!(true));
    }

    #[tokio::test]
    async fn test_chain_expiry_rejects_dispatch() {
        // S6 shape: a chain older than the window refuses to advance
        let cfg = EngineConfig {
            chain_window_ms: 0,
            ..EngineConfig::default()
        };
        let dispatcher = offline_dispatcher(cfg);
        // First leg creates the chain (and fails on the dead endpoint)
        let _ = dispatcher
            .handle(&json!({
                "action": "CANCAL", "sig_id": "S6", "seq": 0, "symbol": "ARCUSD"
            }))
            .await;

        // By the time the next leg arrives the zero-width window has passed
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let result = dispatcher
            .handle(&json!({
                "action": "ENTER", "sig_id": "S6", "seq": 1,
                "symbol": "ARCUSD", "side": "buy", "qty": 1
            }))
            .await;
        match result {
            Err(relay_core::Error::ChainExpired { .. }) => {}
            other => panic!("expected ChainExpired, got {:?}", other),
        }
    }
}
