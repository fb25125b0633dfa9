//! Inbound relay events and settlement payload parsing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PaymentError;

/// How many layers of JSON-in-a-string are peeled before giving up.
const MAX_ENCODING_DEPTH: usize = 4;

/// Event delivered by the relay subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    TokenTransfer(SettlementNotification),
    #[serde(other)]
    Other,
}

impl RelayEvent {
    /// The settlement notification, if this event is one.
    pub fn into_settlement(self) -> Option<SettlementNotification> {
        match self {
            RelayEvent::TokenTransfer(n) => Some(n),
            RelayEvent::Other => None,
        }
    }
}

/// A settlement notification. The payload has already been decrypted by the
/// relay SDK but may still be double-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementNotification {
    pub id: String,
    pub sender: String,
    #[serde(default)]
    pub in_reply_to: Option<String>,
    pub payload: Value,
}

/// Addressing scheme of the transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressScheme {
    /// Recipient owns the target address; the token only needs storing.
    #[default]
    Direct,
    /// Recipient is reached through a proxy address; the ledger must finalize.
    Proxy,
}

/// Parsed settlement payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementPayload {
    pub amount: u64,
    pub coin_id: Option<String>,
    pub scheme: AddressScheme,
    pub source_token: Value,
    pub transfer_tx: Value,
    pub recipient_state: Option<Value>,
    pub aux_tokens: Vec<Value>,
    pub transaction_id: Option<String>,
}

impl SettlementPayload {
    /// Parse a payload whose fields may arrive as objects or JSON strings.
    pub fn parse(raw: &Value) -> Result<Self, PaymentError> {
        let root = unwrap_json(raw.clone());
        let obj = root
            .as_object()
            .ok_or_else(|| PaymentError::InvalidPayload("payload is not an object".into()))?;

        let amount = field(obj, "amount", "amount")
            .ok_or_else(|| PaymentError::InvalidPayload("missing amount".into()))
            .and_then(|v| parse_amount(&v))?;

        let scheme = match field(obj, "scheme", "scheme") {
            Some(v) => serde_json::from_value(v)
                .map_err(|e| PaymentError::InvalidPayload(format!("unknown scheme: {e}")))?,
            None => AddressScheme::default(),
        };

        let source_token = field(obj, "sourceToken", "source_token")
            .ok_or_else(|| PaymentError::InvalidPayload("missing sourceToken".into()))?;
        let transfer_tx = field(obj, "transferTx", "transfer_tx")
            .ok_or_else(|| PaymentError::InvalidPayload("missing transferTx".into()))?;

        let aux_tokens = match field(obj, "auxTokens", "aux_tokens") {
            Some(Value::Array(items)) => items.into_iter().map(unwrap_json).collect(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other],
        };

        Ok(Self {
            amount,
            coin_id: field(obj, "coinId", "coin_id").and_then(as_string),
            scheme,
            source_token,
            transfer_tx,
            recipient_state: field(obj, "recipientState", "recipient_state")
                .filter(|v| !v.is_null()),
            aux_tokens,
            transaction_id: field(obj, "transactionId", "transaction_id").and_then(as_string),
        })
    }
}

/// Peel JSON-encoded strings until a non-string (or non-JSON string) remains.
pub fn unwrap_json(mut value: Value) -> Value {
    for _ in 0..MAX_ENCODING_DEPTH {
        let Value::String(s) = &value else { break };
        let head = s.trim_start();
        if !(head.starts_with('{') || head.starts_with('[') || head.starts_with('"')) {
            break;
        }
        match serde_json::from_str::<Value>(s) {
            Ok(inner) => value = inner,
            Err(_) => break,
        }
    }
    value
}

fn field(obj: &Map<String, Value>, camel: &str, snake: &str) -> Option<Value> {
    obj.get(camel)
        .or_else(|| obj.get(snake))
        .cloned()
        .map(unwrap_json)
}

fn as_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_amount(value: &Value) -> Result<u64, PaymentError> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| PaymentError::InvalidPayload(format!("amount {n} is not a u64"))),
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| PaymentError::InvalidPayload(format!("amount '{s}' is not a u64"))),
        other => Err(PaymentError::InvalidPayload(format!(
            "amount has unexpected type: {other}"
        ))),
    }
}
