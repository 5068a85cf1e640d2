//! Inbound webhook signal models
//!
//! Upstream alerts arrive as loosely-typed JSON with several historical
//! field aliases (`symbol`/`product_symbol`, `sig_id`/`signal_id`,
//! `amount`/`amount_inr`/`amount_usd`, numbers that may be strings).
//! Everything is parsed exactly once, here, into a typed message.

use crate::errors::{Error, Result};
use crate::types::{AmountCcy, Scope, Side};
use serde::Deserialize;

/// Protocol step an inbound message belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// seq=0: flatten before entering
    Cancal,
    /// seq=1: place the entry order
    Enter,
    /// seq=2: place the take-profit batch
    BatchTps,
    /// Acknowledged and ignored
    Exit,
    /// Webhook V1 action name, kept for upstreams mid-upgrade; acknowledged, never executed
    Legacy(String),
}

impl Action {
    pub fn parse(s: &str) -> Option<Action> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.as_str() {
            "CANCAL" => Some(Action::Cancal),
            "ENTER" => Some(Action::Enter),
            "BATCH_TPS" => Some(Action::BatchTps),
            "EXIT" => Some(Action::Exit),
            "DELTA_CANCEL_ALL" | "CANCEL_ALL" | "CANCEL_ORDERS" | "CLOSE_POSITION" | "FLIP"
            | "CLOSE_ALL" => Some(Action::Legacy(upper)),
            _ => None,
        }
    }
}

/// Fields shared by every protocol message
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sig_id: Option<String>,
    pub seq: Option<u8>,
    /// Normalized product symbol (`.P` suffix and `EXCHANGE:` prefix stripped)
    pub product_symbol: Option<String>,
    pub scope: Scope,
}

/// A fully parsed webhook message
#[derive(Debug, Clone)]
pub struct SignalMessage {
    pub envelope: Envelope,
    pub kind: SignalKind,
}

#[derive(Debug, Clone)]
pub enum SignalKind {
    Cancal(CancalRequest),
    Enter(EnterRequest),
    BatchTps(BatchTpsRequest),
    Exit,
    Legacy(String),
}

/// seq=0: flatten request carried by a CANCAL message
#[derive(Debug, Clone)]
pub struct CancalRequest {
    /// None means "use the deployment default"
    pub cancel_orders: Option<bool>,
    pub close_position: Option<bool>,
    /// Widen the order-cancel to the whole account while the close stays
    /// on the message's own scope
    pub cancel_orders_scope: Option<Scope>,
    /// Fall back to cancel-all when a per-order cancel fails
    pub fallback_all: bool,
    /// Block until no open orders and no position remain
    pub require_flat: bool,
}

/// Budget for an entry, in the currency the upstream quoted it
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    pub amount: f64,
    pub ccy: AmountCcy,
}

/// seq=1: entry request
#[derive(Debug, Clone)]
pub struct EnterRequest {
    pub side: Side,
    /// Explicit lot count; acts as a cap when a budget is also present
    pub qty: Option<i64>,
    pub budget: Option<Budget>,
    pub leverage: Option<u32>,
    /// Entry price hint in USD; ticker is the fallback
    pub entry_price: Option<f64>,
    pub fx_inr_per_usd: Option<f64>,
    /// Preflight flatten flags
    pub cancel_orders: bool,
    pub close_position: bool,
    /// None means "default true for ENTER"
    pub require_flat: Option<bool>,
}

/// seq=2: take-profit batch request
#[derive(Debug, Clone)]
pub struct BatchTpsRequest {
    pub legs: Vec<TpLeg>,
}

/// One take-profit leg as the upstream sent it, before size normalization
#[derive(Debug, Clone)]
pub struct TpLeg {
    pub limit_price: f64,
    /// Ambiguous size in lots or coins, disambiguated by the sizing engine
    pub size: Option<f64>,
    /// Explicitly coin-denominated size
    pub size_coins: Option<f64>,
    pub post_only: bool,
    pub mmp: bool,
    pub client_order_id: Option<String>,
}

/// Normalize an upstream symbol: strip any `EXCHANGE:` prefix and the
/// TradingView perpetual `.P` suffix, then uppercase.
pub fn normalize_symbol(raw: &str) -> String {
    let s = raw.trim();
    let s = match s.rfind(':') {
        Some(idx) => &s[idx + 1..],
        None => s,
    };
    let mut upper = s.to_ascii_uppercase();
    if let Some(stripped) = upper.strip_suffix(".P") {
        upper = stripped.to_string();
    }
    upper
}

// ─── Raw wire shape ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawSignal {
    action: Option<String>,
    #[serde(alias = "signal_id")]
    sig_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    seq: Option<f64>,
    symbol: Option<String>,
    product_symbol: Option<String>,
    side: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    qty: Option<f64>,
    #[serde(default, alias = "order_amount", deserialize_with = "de_opt_f64")]
    amount: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    amount_inr: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    amount_usd: Option<f64>,
    amount_ccy: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    leverage: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    entry: Option<f64>,
    #[serde(
        default,
        alias = "fxQuoteToINR",
        alias = "fx_quote_to_inr",
        alias = "fx",
        deserialize_with = "de_opt_f64"
    )]
    fx_inr_per_usd: Option<f64>,
    #[serde(default)]
    orders: Vec<RawTpLeg>,
    scope: Option<String>,
    #[serde(default)]
    close_all: bool,
    cancel_orders: Option<bool>,
    close_position: Option<bool>,
    cancel_orders_scope: Option<String>,
    #[serde(default)]
    cancel_fallback_all: bool,
    require_flat: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawTpLeg {
    #[serde(default, deserialize_with = "de_opt_f64")]
    limit_price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    lmt_price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    size: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    size_coins: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    coins: Option<f64>,
    #[serde(default)]
    post_only: bool,
    #[serde(default)]
    mmp: bool,
    client_order_id: Option<String>,
}

impl SignalMessage {
    /// Parse a raw webhook body into a typed message.
    ///
    /// Validation here covers shape only (unknown action, malformed seq,
    /// bad TP legs). Strict-sequence and chain rules live in the dispatcher.
    pub fn parse(value: &serde_json::Value) -> Result<SignalMessage> {
        let raw: RawSignal = serde_json::from_value(value.clone())?;

        let action_str = raw
            .action
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::MissingField("action".into()))?;
        let action = Action::parse(action_str)
            .ok_or_else(|| Error::InvalidData(format!("unknown action: {}", action_str)))?;

        let seq = match raw.seq {
            None => None,
            Some(s) if s == 0.0 || s == 1.0 || s == 2.0 => Some(s as u8),
            Some(s) => {
                return Err(Error::InvalidData(format!(
                    "seq must be 0, 1 or 2 (got {})",
                    s
                )))
            }
        };

        let product_symbol = raw
            .product_symbol
            .as_deref()
            .or(raw.symbol.as_deref())
            .map(normalize_symbol)
            .filter(|s| !s.is_empty());

        let scope = if raw.scope.as_deref().map(str::trim).map(str::to_ascii_uppercase)
            == Some("ALL".to_string())
            || raw.close_all
        {
            Scope::All
        } else {
            Scope::Symbol
        };

        let sig_id = raw
            .sig_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let kind = match action {
            Action::Cancal => SignalKind::Cancal(CancalRequest {
                cancel_orders: raw.cancel_orders,
                close_position: raw.close_position,
                cancel_orders_scope: raw
                    .cancel_orders_scope
                    .as_deref()
                    .map(str::trim)
                    .map(|s| {
                        if s.eq_ignore_ascii_case("all") {
                            Scope::All
                        } else {
                            Scope::Symbol
                        }
                    }),
                fallback_all: raw.cancel_fallback_all,
                require_flat: raw.require_flat.unwrap_or(false),
            }),
            Action::Enter => {
                let side = raw
                    .side
                    .as_deref()
                    .and_then(Side::parse)
                    .ok_or_else(|| Error::MissingField("side".into()))?;
                SignalKind::Enter(EnterRequest {
                    side,
                    qty: raw.qty.filter(|q| *q >= 1.0).map(|q| q.floor() as i64),
                    budget: resolve_budget(&raw)?,
                    leverage: raw.leverage.filter(|l| *l >= 1.0).map(|l| l.floor() as u32),
                    entry_price: raw.entry.filter(|p| *p > 0.0),
                    fx_inr_per_usd: raw.fx_inr_per_usd.filter(|f| *f > 0.0),
                    cancel_orders: raw.cancel_orders.unwrap_or(false),
                    close_position: raw.close_position.unwrap_or(false),
                    require_flat: raw.require_flat,
                })
            }
            Action::BatchTps => {
                if raw.orders.is_empty() {
                    return Err(Error::MissingField("orders".into()));
                }
                let legs = raw
                    .orders
                    .iter()
                    .enumerate()
                    .map(|(i, leg)| parse_tp_leg(i, leg))
                    .collect::<Result<Vec<_>>>()?;
                SignalKind::BatchTps(BatchTpsRequest { legs })
            }
            Action::Exit => SignalKind::Exit,
            Action::Legacy(name) => SignalKind::Legacy(name),
        };

        Ok(SignalMessage {
            envelope: Envelope {
                sig_id,
                seq,
                product_symbol,
                scope,
            },
            kind,
        })
    }

    pub fn action_name(&self) -> &str {
        match &self.kind {
            SignalKind::Cancal(_) => "CANCAL",
            SignalKind::Enter(_) => "ENTER",
            SignalKind::BatchTps(_) => "BATCH_TPS",
            SignalKind::Exit => "EXIT",
            SignalKind::Legacy(s) => s.as_str(),
        }
    }
}

/// Budget precedence: `amount_usd`, then `amount_inr`, then bare
/// `amount`/`order_amount` with `amount_ccy` (INR when unspecified).
fn resolve_budget(raw: &RawSignal) -> Result<Option<Budget>> {
    let budget = if let Some(usd) = raw.amount_usd {
        Some(Budget {
            amount: usd,
            ccy: AmountCcy::Usd,
        })
    } else if let Some(inr) = raw.amount_inr {
        Some(Budget {
            amount: inr,
            ccy: AmountCcy::Inr,
        })
    } else if let Some(amount) = raw.amount {
        let ccy = match raw.amount_ccy.as_deref().map(str::trim) {
            Some(c) if c.eq_ignore_ascii_case("usd") => AmountCcy::Usd,
            Some(c) if c.eq_ignore_ascii_case("inr") => AmountCcy::Inr,
            Some(other) => {
                return Err(Error::InvalidData(format!("unknown amount_ccy: {}", other)))
            }
            None => AmountCcy::Inr,
        };
        Some(Budget { amount, ccy })
    } else {
        None
    };

    match budget {
        Some(b) if b.amount <= 0.0 => {
            Err(Error::InvalidData(format!("amount must be > 0 (got {})", b.amount)))
        }
        other => Ok(other),
    }
}

fn parse_tp_leg(idx: usize, raw: &RawTpLeg) -> Result<TpLeg> {
    let limit_price = raw
        .limit_price
        .or(raw.price)
        .or(raw.lmt_price)
        .filter(|p| *p > 0.0)
        .ok_or_else(|| Error::InvalidData(format!("TP leg {}: missing limit_price", idx)))?;

    let size_coins = raw.size_coins.or(raw.coins).filter(|s| *s > 0.0);
    let size = raw.size.filter(|s| *s > 0.0);
    if size.is_none() && size_coins.is_none() {
        return Err(Error::InvalidData(format!("TP leg {}: missing size", idx)));
    }

    Ok(TpLeg {
        limit_price,
        size,
        size_coins,
        post_only: raw.post_only,
        mmp: raw.mmp,
        client_order_id: raw.client_order_id.clone(),
    })
}

/// Deserialize an optional f64 that may arrive as a number, string, or null
pub(crate) fn de_opt_f64<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    struct OptF64;

    impl<'de> de::Visitor<'de> for OptF64 {
        type Value = Option<f64>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a number, numeric string, or null")
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Self::Value, E> {
            Ok(Some(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
            Ok(Some(v as f64))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
            Ok(Some(v as f64))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
            if v.trim().is_empty() {
                return Ok(None);
            }
            v.trim().parse::<f64>().map(Some).map_err(de::Error::custom)
        }

        fn visit_none<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D2: serde::Deserializer<'de>>(
            self,
            deserializer: D2,
        ) -> std::result::Result<Self::Value, D2::Error> {
            deserializer.deserialize_any(OptF64)
        }
    }

    deserializer.deserialize_option(OptF64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_symbol() {
        assert_eq!(normalize_symbol("BINANCE:arcusd.P"), "ARCUSD");
        assert_eq!(normalize_symbol("BTCUSD"), "BTCUSD");
        assert_eq!(normalize_symbol(" DELTA:ethusd "), "ETHUSD");
    }

    #[test]
    fn test_parse_enter_with_aliases() {
        let body = json!({
            "action": "ENTER",
            "signal_id": "S1",
            "seq": "1",
            "symbol": "BINANCE:ARCUSD.P",
            "side": "buy",
            "amount_usd": "100",
            "leverage": 10,
            "entry": 2.0,
            "fxQuoteToINR": 84.5
        });
        let msg = SignalMessage::parse(&body).unwrap();
        assert_eq!(msg.envelope.sig_id.as_deref(), Some("S1"));
        assert_eq!(msg.envelope.seq, Some(1));
        assert_eq!(msg.envelope.product_symbol.as_deref(), Some("ARCUSD"));
        match msg.kind {
            SignalKind::Enter(e) => {
                assert_eq!(e.side, Side::Buy);
                let budget = e.budget.unwrap();
                assert_eq!(budget.ccy, AmountCcy::Usd);
                assert_eq!(budget.amount, 100.0);
                assert_eq!(e.leverage, Some(10));
                assert_eq!(e.fx_inr_per_usd, Some(84.5));
            }
            other => panic!("expected ENTER, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_bad_seq() {
        let body = json!({"action": "ENTER", "sig_id": "S1", "seq": 7, "symbol": "BTCUSD", "side": "buy"});
        assert!(SignalMessage::parse(&body).is_err());
    }

    #[test]
    fn test_parse_scope_all() {
        let body = json!({"action": "CANCAL", "sig_id": "S1", "seq": 0, "close_all": true});
        let msg = SignalMessage::parse(&body).unwrap();
        assert_eq!(msg.envelope.scope, Scope::All);
        assert!(msg.envelope.product_symbol.is_none());
    }

    #[test]
    fn test_parse_batch_rejects_priceless_leg() {
        let body = json!({
            "action": "BATCH_TPS", "sig_id": "S1", "seq": 2, "symbol": "ARCUSD",
            "orders": [{"size": 30}]
        });
        assert!(SignalMessage::parse(&body).is_err());
    }

    #[test]
    fn test_parse_batch_legs() {
        let body = json!({
            "action": "BATCH_TPS", "sig_id": "S1", "seq": 2, "symbol": "ARCUSD",
            "orders": [
                {"limit_price": "2.1", "size": 30},
                {"price": 2.2, "coins": 20, "post_only": true}
            ]
        });
        let msg = SignalMessage::parse(&body).unwrap();
        match msg.kind {
            SignalKind::BatchTps(b) => {
                assert_eq!(b.legs.len(), 2);
                assert_eq!(b.legs[0].limit_price, 2.1);
                assert_eq!(b.legs[1].size_coins, Some(20.0));
                assert!(b.legs[1].post_only);
            }
            other => panic!("expected BATCH_TPS, got {:?}", other),
        }
    }

    #[test]
    fn test_legacy_action_is_recognized() {
        let body = json!({"action": "DELTA_CANCEL_ALL"});
        let msg = SignalMessage::parse(&body).unwrap();
        assert!(matches!(msg.kind, SignalKind::Legacy(_)));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let body = json!({"action": "YOLO"});
        assert!(SignalMessage::parse(&body).is_err());
    }
}
