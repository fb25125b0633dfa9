//! Traits for the external collaborators this crate talks to.
//!
//! - [`AliasDirectory`]: alias to address lookup
//! - [`Relay`]: outbound payment requests and the inbound event subscription
//! - [`Ledger`]: token finalization and persistence
//! - [`CartStore`] / [`Catalog`]: cart persistence and stock levels
//!
//! In-memory implementations live in [`crate::memory`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::PaymentError;
use crate::settlement::RelayEvent;

/// Resolves normalized aliases to counterparty addresses.
#[async_trait]
pub trait AliasDirectory: Send + Sync {
    /// `Ok(None)` when the alias is not registered.
    async fn lookup(&self, name: &str) -> Result<Option<String>, PaymentError>;
}

/// Outbound payment request published on the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequestMessage {
    pub recipient_address: String,
    pub amount: u64,
    pub coin_id: String,
    pub message: String,
}

/// Publish/subscribe relay.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Publish a payment request; returns the relay-assigned request id.
    async fn issue_request(&self, request: &PaymentRequestMessage) -> Result<String, PaymentError>;

    /// Open the inbound event subscription.
    async fn subscribe(&self) -> Result<mpsc::Receiver<RelayEvent>, PaymentError>;

    /// Release the inbound subscription.
    async fn unsubscribe(&self) {}
}

/// Arguments for proxy-scheme finalization. The trust root is held by the
/// ledger implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub source_token: Value,
    pub recipient_state: Option<Value>,
    pub transfer_tx: Value,
    pub aux_tokens: Vec<Value>,
}

/// External ledger SDK.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Complete custody change of a proxy-addressed transfer.
    async fn finalize(&self, request: &FinalizeRequest) -> Result<Value, PaymentError>;

    /// Store a received token locally.
    async fn persist_token(&self, token: &Value) -> Result<(), PaymentError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub item_id: String,
    pub quantity: u64,
    /// Price per unit in the coin's smallest unit.
    pub unit_price: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    pub id: String,
    pub lines: Vec<CartLine>,
    #[serde(default)]
    pub locked: bool,
}

impl Cart {
    /// Sum of line totals; `None` on overflow.
    pub fn total(&self) -> Option<u64> {
        self.lines.iter().try_fold(0u64, |acc, line| {
            line.quantity
                .checked_mul(line.unit_price)
                .and_then(|t| acc.checked_add(t))
        })
    }
}

/// Current stock for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockLevel {
    pub available: bool,
    /// `None` means unlimited.
    pub quantity: Option<u64>,
}

#[async_trait]
pub trait CartStore: Send + Sync {
    async fn get_cart(&self, cart_id: &str) -> Result<Option<Cart>, PaymentError>;
    async fn set_locked(&self, cart_id: &str, locked: bool) -> Result<(), PaymentError>;
}

#[async_trait]
pub trait Catalog: Send + Sync {
    /// `Ok(None)` when the item no longer exists.
    async fn stock(&self, item_id: &str) -> Result<Option<StockLevel>, PaymentError>;
}
