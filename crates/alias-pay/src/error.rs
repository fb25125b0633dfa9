use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reason codes for checkout validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ValidationReason {
    CartNotFound,
    EmptyCart,
    ItemUnavailable {
        item_id: String,
    },
    InsufficientStock {
        item_id: String,
        requested: u64,
        available: u64,
    },
    AlreadyPaid {
        request_id: String,
    },
    InvalidAmount,
}

impl ValidationReason {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationReason::CartNotFound => "cart_not_found",
            ValidationReason::EmptyCart => "empty_cart",
            ValidationReason::ItemUnavailable { .. } => "item_unavailable",
            ValidationReason::InsufficientStock { .. } => "insufficient_stock",
            ValidationReason::AlreadyPaid { .. } => "already_paid",
            ValidationReason::InvalidAmount => "invalid_amount",
        }
    }
}

impl std::fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationReason::CartNotFound => write!(f, "cart not found"),
            ValidationReason::EmptyCart => write!(f, "cart is empty"),
            ValidationReason::ItemUnavailable { item_id } => {
                write!(f, "item {item_id} is no longer available")
            }
            ValidationReason::InsufficientStock {
                item_id,
                requested,
                available,
            } => write!(
                f,
                "item {item_id}: requested {requested}, only {available} available"
            ),
            ValidationReason::AlreadyPaid { request_id } => {
                write!(f, "already paid by request {request_id}")
            }
            ValidationReason::InvalidAmount => write!(f, "cart total is zero or overflows"),
        }
    }
}

/// Terminal failure carried through a completion signal.
///
/// `Clone` so every waiter on the same expectation observes the same value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    AmountMismatch { expected: u64, received: u64 },
    CoinMismatch { expected: String, received: String },
    Timeout { waited_secs: u64 },
    Cancelled,
    Shutdown,
}

impl FailureReason {
    pub fn into_error(self, cart_id: &str, request_id: &str) -> PaymentError {
        let cart_id = cart_id.to_string();
        let request_id = request_id.to_string();
        match self {
            FailureReason::AmountMismatch { expected, received } => PaymentError::AmountMismatch {
                cart_id,
                request_id,
                expected,
                received,
            },
            FailureReason::CoinMismatch { expected, received } => PaymentError::CoinMismatch {
                cart_id,
                request_id,
                expected,
                received,
            },
            FailureReason::Timeout { waited_secs } => PaymentError::Timeout {
                cart_id,
                request_id,
                waited_secs,
            },
            FailureReason::Cancelled => PaymentError::Cancelled {
                cart_id,
                request_id,
            },
            FailureReason::Shutdown => PaymentError::Shutdown {
                cart_id,
                request_id,
            },
        }
    }
}

/// Errors returned by payment, checkout and order operations.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment service is not initialized")]
    NotInitialized,

    #[error("could not resolve alias '{alias}' after {attempts} attempts")]
    ResolutionFailed {
        cart_id: Option<String>,
        alias: String,
        attempts: u32,
    },

    #[error("checkout rejected for cart {cart_id}: {reason}")]
    Validation {
        cart_id: String,
        reason: ValidationReason,
    },

    #[error("checkout already in progress for cart {cart_id}")]
    CheckoutInProgress { cart_id: String },

    #[error("cart {cart_id} is already awaiting payment for request {request_id}")]
    AwaitingPayment {
        cart_id: String,
        order_id: String,
        request_id: String,
    },

    #[error(
        "amount mismatch for cart {cart_id} (request {request_id}): expected {expected}, received {received}"
    )]
    AmountMismatch {
        cart_id: String,
        request_id: String,
        expected: u64,
        received: u64,
    },

    #[error(
        "coin mismatch for cart {cart_id} (request {request_id}): expected {expected}, received {received}"
    )]
    CoinMismatch {
        cart_id: String,
        request_id: String,
        expected: String,
        received: String,
    },

    #[error("no settlement for cart {cart_id} (request {request_id}) within {waited_secs}s")]
    Timeout {
        cart_id: String,
        request_id: String,
        waited_secs: u64,
    },

    #[error("payment request {request_id} for cart {cart_id} was cancelled")]
    Cancelled { cart_id: String, request_id: String },

    #[error("payment request {request_id} for cart {cart_id} rejected by shutdown")]
    Shutdown { cart_id: String, request_id: String },

    #[error("no payment request known for cart {cart_id}")]
    NoPaymentRequest { cart_id: String },

    #[error("finalization error: {0}")]
    Finalization(String),

    #[error("relay error: {0}")]
    Relay(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("order {order_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        order_id: String,
        from: crate::orders::OrderStatus,
        to: crate::orders::OrderStatus,
    },

    #[error("invalid settlement payload: {0}")]
    InvalidPayload(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

impl PaymentError {
    /// Cart the failure concerns, when known.
    pub fn cart_id(&self) -> Option<&str> {
        match self {
            PaymentError::ResolutionFailed { cart_id, .. } => cart_id.as_deref(),
            PaymentError::Validation { cart_id, .. }
            | PaymentError::CheckoutInProgress { cart_id }
            | PaymentError::AwaitingPayment { cart_id, .. }
            | PaymentError::AmountMismatch { cart_id, .. }
            | PaymentError::CoinMismatch { cart_id, .. }
            | PaymentError::Timeout { cart_id, .. }
            | PaymentError::Cancelled { cart_id, .. }
            | PaymentError::Shutdown { cart_id, .. }
            | PaymentError::NoPaymentRequest { cart_id } => Some(cart_id),
            _ => None,
        }
    }

    /// Payment request the failure concerns, when known.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            PaymentError::AwaitingPayment { request_id, .. }
            | PaymentError::AmountMismatch { request_id, .. }
            | PaymentError::CoinMismatch { request_id, .. }
            | PaymentError::Timeout { request_id, .. }
            | PaymentError::Cancelled { request_id, .. }
            | PaymentError::Shutdown { request_id, .. } => Some(request_id),
            _ => None,
        }
    }

    /// Stable machine-readable code for callers.
    pub fn code(&self) -> &'static str {
        match self {
            PaymentError::NotInitialized => "not_initialized",
            PaymentError::ResolutionFailed { .. } => "resolution_failed",
            PaymentError::Validation { reason, .. } => reason.code(),
            PaymentError::CheckoutInProgress { .. } => "checkout_in_progress",
            PaymentError::AwaitingPayment { .. } => "awaiting_payment",
            PaymentError::AmountMismatch { .. } => "amount_mismatch",
            PaymentError::CoinMismatch { .. } => "coin_mismatch",
            PaymentError::Timeout { .. } => "timeout",
            PaymentError::Cancelled { .. } => "cancelled",
            PaymentError::Shutdown { .. } => "shutdown",
            PaymentError::NoPaymentRequest { .. } => "no_payment_request",
            PaymentError::Finalization(_) => "finalization_failed",
            PaymentError::Relay(_) => "relay_error",
            PaymentError::Upstream(_) => "upstream_error",
            PaymentError::OrderNotFound(_) => "order_not_found",
            PaymentError::InvalidTransition { .. } => "invalid_transition",
            PaymentError::InvalidPayload(_) => "invalid_payload",
            PaymentError::Persistence(_) => "persistence_error",
            PaymentError::SerdeError(_) => "serialization_error",
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for PaymentError {
    fn from(e: rusqlite::Error) -> Self {
        PaymentError::Persistence(e.to_string())
    }
}
