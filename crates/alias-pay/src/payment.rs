use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::FailureReason;

/// Result of a settled payment, retained per cart for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedPayment {
    pub cart_id: String,
    pub request_id: String,
    pub settlement_ref: String,
    pub amount: u64,
    pub confirmed_at: DateTime<Utc>,
}

/// Terminal value of an expectation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Settled(ConfirmedPayment),
    Failed(FailureReason),
}

/// Single-fire completion signal shared by everyone waiting on one request.
///
/// The first call to [`fire`](Self::fire) stores the outcome; later calls are
/// no-ops and report `false`.
#[derive(Debug)]
pub struct CompletionSignal {
    tx: watch::Sender<Option<Outcome>>,
}

impl CompletionSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Store `outcome` if nothing was stored yet. Returns `true` for the winner.
    pub fn fire(&self, outcome: Outcome) -> bool {
        self.tx.send_if_modified(move |current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        })
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.tx.borrow().clone()
    }

    pub fn is_fired(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait until the signal fires. Returns immediately if it already has.
    pub async fn wait(&self) -> Outcome {
        let mut rx = self.tx.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => Option::clone(&value),
            // Unreachable while `self` holds the sender.
            Err(_) => None,
        };
        outcome.unwrap_or(Outcome::Failed(FailureReason::Shutdown))
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything needed to (re)create an expectation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectationParams {
    pub request_id: String,
    pub cart_id: String,
    /// Normalized alias (no leading marker).
    pub alias: String,
    /// Resolved counterparty address.
    pub address: String,
    /// Expected amount in the coin's smallest unit.
    pub amount: u64,
    pub coin_id: String,
}

/// One outstanding payment request awaiting settlement.
#[derive(Debug)]
pub struct PaymentExpectation {
    pub request_id: String,
    pub cart_id: String,
    pub alias: String,
    pub address: String,
    pub amount: u64,
    pub coin_id: String,
    pub created_at: DateTime<Utc>,
    signal: CompletionSignal,
}

impl PaymentExpectation {
    pub fn new(params: ExpectationParams) -> Self {
        Self {
            request_id: params.request_id,
            cart_id: params.cart_id,
            alias: params.alias,
            address: params.address,
            amount: params.amount,
            coin_id: params.coin_id,
            created_at: Utc::now(),
            signal: CompletionSignal::new(),
        }
    }

    pub fn params(&self) -> ExpectationParams {
        ExpectationParams {
            request_id: self.request_id.clone(),
            cart_id: self.cart_id.clone(),
            alias: self.alias.clone(),
            address: self.address.clone(),
            amount: self.amount,
            coin_id: self.coin_id.clone(),
        }
    }

    pub fn signal(&self) -> &CompletionSignal {
        &self.signal
    }

    /// Terminal result, if any.
    pub fn outcome(&self) -> Option<Outcome> {
        self.signal.outcome()
    }
}

/// Returned to the tool layer after a successful checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutReceipt {
    pub order_id: String,
    pub request_id: String,
    pub amount: u64,
    pub counterparty_alias: String,
    pub coin_id: String,
}

/// Non-error results of a confirmation query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmStatus {
    Pending { cart_id: String, request_id: String },
    Confirmed(ConfirmedPayment),
}
