use std::sync::Arc;
use std::time::Duration;

use crate::error::{FailureReason, PaymentError};
use crate::payment::{ConfirmStatus, Outcome, PaymentExpectation};
use crate::registry::PaymentRequestRegistry;

/// Blocking-with-timeout and non-blocking confirmation queries.
pub struct ConfirmationWaiter {
    registry: Arc<PaymentRequestRegistry>,
    max_wait_secs: u64,
}

impl ConfirmationWaiter {
    pub fn new(registry: Arc<PaymentRequestRegistry>, max_wait_secs: u64) -> Self {
        Self {
            registry,
            max_wait_secs,
        }
    }

    pub fn clamp_wait(&self, wait_secs: u64) -> u64 {
        wait_secs.min(self.max_wait_secs)
    }

    /// Report the payment state of `cart_id`, waiting up to `wait_secs`
    /// (clamped) for an outstanding request to settle.
    ///
    /// A wait that runs out resolves the expectation as timed out. If the
    /// expectation was resolved by someone else in the meantime, that
    /// outcome is returned instead.
    pub async fn confirm(&self, cart_id: &str, wait_secs: u64) -> Result<ConfirmStatus, PaymentError> {
        if let Some(confirmed) = self.registry.confirmed(cart_id) {
            return Ok(ConfirmStatus::Confirmed(confirmed));
        }

        let wait = self.clamp_wait(wait_secs);
        let expectation = match self.registry.find_by_cart_id(cart_id) {
            Some(e) => e,
            None => {
                // Settling records the result before dropping the active entry.
                if let Some(confirmed) = self.registry.confirmed(cart_id) {
                    return Ok(ConfirmStatus::Confirmed(confirmed));
                }
                if let Some((request_id, reason)) = self.registry.failure(cart_id) {
                    return Err(reason.into_error(cart_id, &request_id));
                }
                let params = self.registry.known_params(cart_id).ok_or_else(|| {
                    PaymentError::NoPaymentRequest {
                        cart_id: cart_id.to_string(),
                    }
                })?;
                if wait == 0 {
                    return Ok(ConfirmStatus::Pending {
                        cart_id: params.cart_id,
                        request_id: params.request_id,
                    });
                }
                tracing::info!(
                    cart_id = %cart_id,
                    request_id = %params.request_id,
                    "re-registering expectation from known parameters"
                );
                self.registry.register(params)
            }
        };

        if wait == 0 {
            return match expectation.outcome() {
                Some(outcome) => into_status(&expectation, outcome),
                None => Ok(ConfirmStatus::Pending {
                    cart_id: expectation.cart_id.clone(),
                    request_id: expectation.request_id.clone(),
                }),
            };
        }

        let outcome = match tokio::time::timeout(
            Duration::from_secs(wait),
            expectation.signal().wait(),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => self.expire(&expectation, wait),
        };
        into_status(&expectation, outcome)
    }

    fn expire(&self, expectation: &Arc<PaymentExpectation>, waited_secs: u64) -> Outcome {
        let timeout = Outcome::Failed(FailureReason::Timeout { waited_secs });
        if self.registry.resolve(expectation, timeout.clone()) {
            tracing::warn!(
                cart_id = %expectation.cart_id,
                request_id = %expectation.request_id,
                waited_secs,
                "no settlement within wait window"
            );
            return timeout;
        }
        // Lost the race: report whatever won.
        expectation.outcome().unwrap_or(timeout)
    }
}

fn into_status(
    expectation: &PaymentExpectation,
    outcome: Outcome,
) -> Result<ConfirmStatus, PaymentError> {
    match outcome {
        Outcome::Settled(confirmed) => Ok(ConfirmStatus::Confirmed(confirmed)),
        Outcome::Failed(reason) => {
            Err(reason.into_error(&expectation.cart_id, &expectation.request_id))
        }
    }
}
