//! Alias-addressed payment confirmation for conversational checkout.
//!
//! Issues payment requests to a counterparty identified by a human-readable
//! alias, waits for the matching settlement notification to arrive over a
//! publish/subscribe relay, and resolves each request exactly once: settled,
//! amount mismatch, timeout, cancelled or rejected by shutdown.
//!
//! # Components
//!
//! - [`IdentityResolver`]: alias to address with bounded retry and backoff
//! - [`PaymentRequestRegistry`]: outstanding expectations and confirmed results
//! - [`EventCorrelator`]: matches relay events to expectations
//! - [`ConfirmationWaiter`]: blocking and non-blocking confirmation queries
//! - [`CheckoutCoordinator`]: per-cart locked checkout sequence
//! - [`OrderBook`]: order lifecycle with retention-based pruning
//!
//! [`PaymentService`] wires them together behind `initialize`/`shutdown`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use alias_pay::memory::{InMemoryCarts, LoopbackRelay, RecordingLedger, StaticDirectory};
//! use alias_pay::{PaymentConfig, PaymentService, ServiceDeps};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), alias_pay::PaymentError> {
//! let carts = Arc::new(InMemoryCarts::new());
//! let service = PaymentService::new(
//!     ServiceDeps {
//!         directory: Arc::new(StaticDirectory::new().with_alias("bob", "addr-bob")),
//!         relay: Arc::new(LoopbackRelay::new()),
//!         ledger: Arc::new(RecordingLedger::new()),
//!         carts: carts.clone(),
//!         catalog: carts,
//!         confirmations: None,
//!     },
//!     PaymentConfig::default(),
//! );
//! service.initialize().await?;
//!
//! let receipt = service.checkout("cart-1", "@bob").await?;
//! let status = service.confirm("cart-1", 30).await?;
//! # let _ = (receipt, status);
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod constants;
pub mod error;
pub mod payment;
pub mod ports;
pub mod settlement;

pub mod checkout;
pub mod confirmation_store;
pub mod correlator;
pub mod identity;
pub mod orders;
pub mod registry;
pub mod service;
pub mod waiter;

pub mod memory;

pub use checkout::{CheckoutCoordinator, CheckoutLock};
pub use confirmation_store::{ConfirmationStore, InMemoryConfirmationStore};
#[cfg(feature = "sqlite")]
pub use confirmation_store::SqliteConfirmationStore;
pub use constants::*;
pub use correlator::{Correlation, EventCorrelator};
pub use error::{FailureReason, PaymentError, ValidationReason};
pub use identity::{normalize_alias, IdentityResolver, ResolvedIdentity};
pub use orders::{Order, OrderBook, OrderStatus};
pub use payment::{
    CheckoutReceipt, CompletionSignal, ConfirmStatus, ConfirmedPayment, ExpectationParams,
    Outcome, PaymentExpectation,
};
pub use ports::{
    AliasDirectory, Cart, CartLine, CartStore, Catalog, FinalizeRequest, Ledger,
    PaymentRequestMessage, Relay, StockLevel,
};
pub use registry::PaymentRequestRegistry;
pub use service::{PaymentService, ServiceDeps};
pub use settlement::{AddressScheme, RelayEvent, SettlementNotification, SettlementPayload};
pub use waiter::ConfirmationWaiter;
