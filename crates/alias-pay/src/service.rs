//! The assembled payment service.
//!
//! [`PaymentService`] owns every component and the two background tasks
//! (event correlation and order pruning). Outcomes feed the order machine:
//! a settlement marks the order `paid`, a mismatch `cancelled` and a timeout
//! `payment_timeout`; the last two also unlock the cart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::checkout::CheckoutCoordinator;
use crate::confirmation_store::ConfirmationStore;
use crate::constants::PaymentConfig;
use crate::correlator::{Correlation, EventCorrelator};
use crate::error::{FailureReason, PaymentError};
use crate::identity::IdentityResolver;
use crate::orders::{Order, OrderBook, OrderStatus};
use crate::payment::{CheckoutReceipt, ConfirmStatus, Outcome};
use crate::ports::{AliasDirectory, CartStore, Catalog, Ledger, Relay};
use crate::registry::PaymentRequestRegistry;
use crate::settlement::RelayEvent;
use crate::waiter::ConfirmationWaiter;

/// External collaborators injected into [`PaymentService::new`].
pub struct ServiceDeps {
    pub directory: Arc<dyn AliasDirectory>,
    pub relay: Arc<dyn Relay>,
    pub ledger: Arc<dyn Ledger>,
    pub carts: Arc<dyn CartStore>,
    pub catalog: Arc<dyn Catalog>,
    /// Defaults to an in-memory store.
    pub confirmations: Option<Arc<dyn ConfirmationStore>>,
}

struct Inner {
    config: PaymentConfig,
    registry: Arc<PaymentRequestRegistry>,
    orders: Arc<OrderBook>,
    checkout: CheckoutCoordinator,
    waiter: ConfirmationWaiter,
    correlator: EventCorrelator,
    relay: Arc<dyn Relay>,
    carts: Arc<dyn CartStore>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct PaymentService {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
    active: AtomicBool,
}

impl PaymentService {
    pub fn new(deps: ServiceDeps, config: PaymentConfig) -> Self {
        let registry = Arc::new(match deps.confirmations {
            Some(store) => PaymentRequestRegistry::with_confirmation_store(store),
            None => PaymentRequestRegistry::new(),
        });
        let orders = Arc::new(OrderBook::new());
        let resolver = IdentityResolver::new(deps.directory)
            .with_retry(config.resolve_attempts, config.resolve_base_delay)
            .with_attempt_timeout(config.resolve_attempt_timeout);
        let checkout = CheckoutCoordinator::new(
            registry.clone(),
            orders.clone(),
            resolver,
            deps.relay.clone(),
            deps.carts.clone(),
            deps.catalog,
            config.coin_id.clone(),
        );
        let waiter = ConfirmationWaiter::new(registry.clone(), config.max_confirm_wait_secs);
        let correlator = EventCorrelator::new(registry.clone(), deps.ledger);

        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                orders,
                checkout,
                waiter,
                correlator,
                relay: deps.relay,
                carts: deps.carts,
            }),
            running: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    /// Subscribe to the relay and start the background tasks. Calling it on
    /// a running service is a no-op.
    pub async fn initialize(&self) -> Result<(), PaymentError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let events = self.inner.relay.subscribe().await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(correlation_loop(
                self.inner.clone(),
                events,
                shutdown_rx.clone(),
            )),
            tokio::spawn(prune_loop(self.inner.clone(), shutdown_rx)),
        ];
        *running = Some(Running {
            shutdown: shutdown_tx,
            tasks,
        });
        self.active.store(true, Ordering::SeqCst);

        tracing::info!(
            coin_id = %self.inner.config.coin_id,
            max_wait_secs = self.inner.config.max_confirm_wait_secs,
            "payment service initialized"
        );
        Ok(())
    }

    /// Stop the background tasks, reject every pending expectation and
    /// release the relay subscription.
    pub async fn shutdown(&self) {
        let mut running = self.running.lock().await;
        let Some(Running { shutdown, tasks }) = running.take() else {
            return;
        };
        self.active.store(false, Ordering::SeqCst);

        let _ = shutdown.send(true);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }

        let rejected = self.inner.registry.drain(FailureReason::Shutdown);
        self.inner.relay.unsubscribe().await;
        tracing::info!(rejected, "payment service shut down");
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), PaymentError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(PaymentError::NotInitialized)
        }
    }

    pub async fn checkout(
        &self,
        cart_id: &str,
        alias: &str,
    ) -> Result<CheckoutReceipt, PaymentError> {
        self.ensure_running()?;
        let receipt = self.inner.checkout.checkout(cart_id, alias).await?;

        // `shutdown` clears the running flag before draining, so a request
        // registered after the drain is caught here.
        if !self.is_running() {
            if let Some(expectation) = self.inner.registry.find_by_request_id(&receipt.request_id) {
                self.inner
                    .registry
                    .resolve(&expectation, Outcome::Failed(FailureReason::Shutdown));
            }
            tracing::warn!(
                cart_id = %cart_id,
                request_id = %receipt.request_id,
                "checkout finished during shutdown, request rejected"
            );
            return Err(PaymentError::Shutdown {
                cart_id: cart_id.to_string(),
                request_id: receipt.request_id,
            });
        }
        Ok(receipt)
    }

    pub async fn confirm(
        &self,
        cart_id: &str,
        wait_secs: u64,
    ) -> Result<ConfirmStatus, PaymentError> {
        self.ensure_running()?;
        match self.inner.waiter.confirm(cart_id, wait_secs).await {
            Ok(status) => {
                if let ConfirmStatus::Confirmed(confirmed) = &status {
                    self.inner.settle_order(&confirmed.request_id);
                }
                Ok(status)
            }
            Err(err) => {
                match &err {
                    PaymentError::Timeout { request_id, .. } => {
                        self.inner
                            .fail_order(request_id, OrderStatus::PaymentTimeout)
                            .await;
                    }
                    PaymentError::AmountMismatch { request_id, .. }
                    | PaymentError::CoinMismatch { request_id, .. } => {
                        self.inner.fail_order(request_id, OrderStatus::Cancelled).await;
                    }
                    _ => {}
                }
                Err(err)
            }
        }
    }

    pub fn order(&self, order_id: &str) -> Result<Order, PaymentError> {
        self.ensure_running()?;
        self.inner
            .orders
            .get(order_id)
            .ok_or_else(|| PaymentError::OrderNotFound(order_id.to_string()))
    }

    pub fn order_for_cart(&self, cart_id: &str) -> Result<Order, PaymentError> {
        self.ensure_running()?;
        self.inner
            .orders
            .latest_for_cart(cart_id)
            .ok_or_else(|| PaymentError::OrderNotFound(format!("cart {cart_id}")))
    }

    /// Administrative override; ignores the transition guards.
    pub fn force_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> Result<Order, PaymentError> {
        self.ensure_running()?;
        self.inner.orders.force_status(order_id, status)
    }

    /// Cancel an order, failing its outstanding request and unlocking the
    /// cart.
    pub async fn cancel_order(&self, order_id: &str) -> Result<Order, PaymentError> {
        self.ensure_running()?;
        let order = self
            .inner
            .orders
            .transition(order_id, OrderStatus::Cancelled)?;

        if let Some(request_id) = order.request_id.as_deref() {
            if let Some(expectation) = self.inner.registry.find_by_request_id(request_id) {
                self.inner
                    .registry
                    .resolve(&expectation, Outcome::Failed(FailureReason::Cancelled));
            }
        }
        self.inner.unlock_cart(&order.cart_id).await;
        tracing::info!(order_id = %order.id, cart_id = %order.cart_id, "order cancelled");
        Ok(order)
    }

    /// Number of expectations still waiting for settlement.
    pub fn pending_payments(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn config(&self) -> &PaymentConfig {
        &self.inner.config
    }
}

impl Inner {
    fn settle_order(&self, request_id: &str) {
        let Some(order) = self.orders.find_by_request_id(request_id) else {
            return;
        };
        if order.status == OrderStatus::Paid {
            return;
        }
        match self.orders.transition(&order.id, OrderStatus::Paid) {
            Ok(_) => tracing::info!(order_id = %order.id, request_id = %request_id, "order paid"),
            Err(e) => tracing::warn!(
                order_id = %order.id,
                request_id = %request_id,
                error = %e,
                "settled payment for an order that can no longer be paid"
            ),
        }
    }

    async fn fail_order(&self, request_id: &str, status: OrderStatus) {
        let Some(order) = self.orders.find_by_request_id(request_id) else {
            return;
        };
        if order.status != OrderStatus::AwaitingPayment {
            return;
        }
        if let Err(e) = self.orders.transition(&order.id, status) {
            tracing::debug!(order_id = %order.id, error = %e, "order already moved on");
            return;
        }
        tracing::info!(order_id = %order.id, request_id = %request_id, status = %status, "order closed");
        self.unlock_cart(&order.cart_id).await;
    }

    async fn unlock_cart(&self, cart_id: &str) {
        if let Err(e) = self.carts.set_locked(cart_id, false).await {
            tracing::warn!(cart_id = %cart_id, error = %e, "failed to unlock cart");
        }
    }

    async fn apply(&self, correlation: Correlation) {
        match correlation {
            Correlation::Settled(confirmed) => self.settle_order(&confirmed.request_id),
            Correlation::Mismatch { request_id, .. } => {
                self.fail_order(&request_id, OrderStatus::Cancelled).await
            }
            Correlation::Ignored
            | Correlation::Unmatched { .. }
            | Correlation::Malformed { .. }
            | Correlation::AlreadyResolved { .. }
            | Correlation::Duplicate { .. } => {}
        }
    }
}

async fn correlation_loop(
    inner: Arc<Inner>,
    mut events: mpsc::Receiver<RelayEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => {
                let Some(event) = event else {
                    tracing::warn!("relay subscription closed");
                    break;
                };
                let correlation = inner.correlator.handle(event).await;
                inner.apply(correlation).await;
            }
        }
    }
    tracing::debug!("correlation loop stopped");
}

async fn prune_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.config.prune_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let pruned = inner
                    .orders
                    .prune_terminal(inner.config.order_retention, Utc::now());
                if pruned > 0 {
                    tracing::info!(pruned, "pruned terminal orders");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryCarts, LoopbackRelay, RecordingLedger, StaticDirectory};

    fn service() -> (PaymentService, Arc<LoopbackRelay>) {
        let relay = Arc::new(LoopbackRelay::new());
        let carts = Arc::new(InMemoryCarts::new());
        let service = PaymentService::new(
            ServiceDeps {
                directory: Arc::new(StaticDirectory::new()),
                relay: relay.clone(),
                ledger: Arc::new(RecordingLedger::new()),
                carts: carts.clone(),
                catalog: carts,
                confirmations: None,
            },
            PaymentConfig::default(),
        );
        (service, relay)
    }

    #[tokio::test]
    async fn test_operations_require_initialize() {
        let (service, _) = service();
        assert!(matches!(
            service.checkout("cart-1", "bob").await,
            Err(PaymentError::NotInitialized)
        ));
        assert!(matches!(
            service.confirm("cart-1", 0).await,
            Err(PaymentError::NotInitialized)
        ));
        assert!(matches!(
            service.order("o"),
            Err(PaymentError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_lifecycle_subscribes_and_releases() {
        let (service, relay) = service();
        service.initialize().await.unwrap();
        service.initialize().await.unwrap();
        assert!(service.is_running());
        assert!(relay.is_subscribed());

        service.shutdown().await;
        assert!(!service.is_running());
        assert!(!relay.is_subscribed());
        assert!(matches!(
            service.order_for_cart("cart-1"),
            Err(PaymentError::NotInitialized)
        ));

        service.initialize().await.unwrap();
        assert!(service.is_running());
        service.shutdown().await;
    }
}
