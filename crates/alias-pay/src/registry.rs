use std::sync::Arc;

use dashmap::{DashMap, DashSet};

use crate::confirmation_store::{ConfirmationStore, InMemoryConfirmationStore};
use crate::error::FailureReason;
use crate::payment::{ConfirmedPayment, ExpectationParams, Outcome, PaymentExpectation};

/// Index of outstanding payment expectations.
///
/// Active entries are keyed by request id; cart and counterparty lookups scan.
/// Confirmed results are kept per cart in a [`ConfirmationStore`], and the
/// parameters of the last request issued per cart are remembered so a waiter
/// can re-register after the active entry was dropped by a shutdown. The last
/// terminal failure per cart is kept until the cart checks out again, so late
/// callers see the same outcome as the ones that were waiting.
pub struct PaymentRequestRegistry {
    active: DashMap<String, Arc<PaymentExpectation>>,
    known: DashMap<String, ExpectationParams>,
    failed: DashMap<String, (String, FailureReason)>,
    settled_events: DashSet<String>,
    confirmed: Arc<dyn ConfirmationStore>,
}

impl PaymentRequestRegistry {
    pub fn new() -> Self {
        Self::with_confirmation_store(Arc::new(InMemoryConfirmationStore::new()))
    }

    pub fn with_confirmation_store(store: Arc<dyn ConfirmationStore>) -> Self {
        Self {
            active: DashMap::new(),
            known: DashMap::new(),
            failed: DashMap::new(),
            settled_events: DashSet::new(),
            confirmed: store,
        }
    }

    /// Insert a new expectation. Callers guarantee there is no other
    /// non-terminal expectation for the same cart.
    pub fn register(&self, params: ExpectationParams) -> Arc<PaymentExpectation> {
        if let Some(existing) = self.find_by_cart_id(&params.cart_id) {
            tracing::warn!(
                cart_id = %params.cart_id,
                existing = %existing.request_id,
                request_id = %params.request_id,
                "registering over a live expectation for the same cart"
            );
        }
        self.failed.remove(&params.cart_id);
        self.known.insert(params.cart_id.clone(), params.clone());
        let expectation = Arc::new(PaymentExpectation::new(params));
        self.active
            .insert(expectation.request_id.clone(), Arc::clone(&expectation));
        tracing::debug!(
            request_id = %expectation.request_id,
            cart_id = %expectation.cart_id,
            amount = expectation.amount,
            "expectation registered"
        );
        expectation
    }

    pub fn find_by_request_id(&self, request_id: &str) -> Option<Arc<PaymentExpectation>> {
        self.active.get(request_id).map(|e| Arc::clone(e.value()))
    }

    pub fn find_by_cart_id(&self, cart_id: &str) -> Option<Arc<PaymentExpectation>> {
        self.active
            .iter()
            .find(|e| e.cart_id == cart_id)
            .map(|e| Arc::clone(e.value()))
    }

    /// Oldest live expectation addressed to `address`.
    pub fn find_by_counterparty(&self, address: &str) -> Option<Arc<PaymentExpectation>> {
        self.active
            .iter()
            .filter(|e| e.address == address)
            .min_by_key(|e| e.created_at)
            .map(|e| Arc::clone(e.value()))
    }

    pub fn remove(&self, request_id: &str) -> Option<Arc<PaymentExpectation>> {
        self.active.remove(request_id).map(|(_, e)| e)
    }

    pub fn confirmed(&self, cart_id: &str) -> Option<ConfirmedPayment> {
        self.confirmed.get(cart_id)
    }

    pub fn known_params(&self, cart_id: &str) -> Option<ExpectationParams> {
        self.known.get(cart_id).map(|p| p.value().clone())
    }

    /// Request id and reason of the last terminal failure for `cart_id`.
    /// Shutdown rejections are not recorded.
    pub fn failure(&self, cart_id: &str) -> Option<(String, FailureReason)> {
        self.failed.get(cart_id).map(|f| f.value().clone())
    }

    /// Remember that the settlement event `event_id` confirmed a payment.
    /// Returns `false` if it already had.
    pub fn record_settlement_event(&self, event_id: &str) -> bool {
        self.settled_events.insert(event_id.to_string())
    }

    pub fn is_settlement_event(&self, event_id: &str) -> bool {
        self.settled_events.contains(event_id)
    }

    /// Move `expectation` to a terminal state.
    ///
    /// Returns `false` if it was already resolved; the caller lost the race and
    /// must read the stored outcome instead.
    pub fn resolve(&self, expectation: &Arc<PaymentExpectation>, outcome: Outcome) -> bool {
        if !expectation.signal().fire(outcome.clone()) {
            return false;
        }

        match &outcome {
            Outcome::Settled(confirmed) => {
                if let Err(e) = self.confirmed.record(confirmed) {
                    tracing::error!(
                        cart_id = %confirmed.cart_id,
                        request_id = %confirmed.request_id,
                        error = %e,
                        "failed to persist confirmation"
                    );
                }
            }
            // Shutdown keeps the parameters so the wait can be re-armed later.
            Outcome::Failed(FailureReason::Shutdown) => {}
            Outcome::Failed(reason) => {
                self.known
                    .remove_if(&expectation.cart_id, |_, p| {
                        p.request_id == expectation.request_id
                    });
                self.failed.insert(
                    expectation.cart_id.clone(),
                    (expectation.request_id.clone(), reason.clone()),
                );
            }
        }

        // Only drop the entry if it is still this expectation.
        self.active.remove_if(&expectation.request_id, |_, current| {
            Arc::ptr_eq(current, expectation)
        });
        true
    }

    /// Resolve every active expectation with `reason`. Returns how many were
    /// resolved by this call.
    pub fn drain(&self, reason: FailureReason) -> usize {
        let pending: Vec<Arc<PaymentExpectation>> =
            self.active.iter().map(|e| Arc::clone(e.value())).collect();
        pending
            .iter()
            .filter(|e| self.resolve(e, Outcome::Failed(reason.clone())))
            .count()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

impl Default for PaymentRequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}
