//! Matches inbound settlement notifications to outstanding expectations.

use std::sync::Arc;

use chrono::Utc;

use crate::error::FailureReason;
use crate::payment::{ConfirmedPayment, Outcome, PaymentExpectation};
use crate::ports::{FinalizeRequest, Ledger};
use crate::registry::PaymentRequestRegistry;
use crate::settlement::{AddressScheme, RelayEvent, SettlementNotification, SettlementPayload};

/// What handling one event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    /// Not a settlement notification.
    Ignored,
    /// No expectation matched the reference or the sender.
    Unmatched { event_id: String },
    /// Matched, but the payload could not be parsed. The expectation is untouched.
    Malformed { event_id: String, request_id: String },
    /// Matched and settled.
    Settled(ConfirmedPayment),
    /// Matched with the wrong amount or coin; the expectation failed.
    Mismatch {
        cart_id: String,
        request_id: String,
        reason: FailureReason,
    },
    /// Matched an expectation someone else already resolved.
    AlreadyResolved { request_id: String },
    /// The same event already confirmed a payment.
    Duplicate { event_id: String },
}

pub struct EventCorrelator {
    registry: Arc<PaymentRequestRegistry>,
    ledger: Arc<dyn Ledger>,
}

impl EventCorrelator {
    pub fn new(registry: Arc<PaymentRequestRegistry>, ledger: Arc<dyn Ledger>) -> Self {
        Self { registry, ledger }
    }

    pub async fn handle(&self, event: RelayEvent) -> Correlation {
        let Some(notification) = event.into_settlement() else {
            return Correlation::Ignored;
        };

        if self.registry.is_settlement_event(&notification.id) {
            tracing::warn!(
                event_id = %notification.id,
                sender = %notification.sender,
                "settlement event redelivered, dropping"
            );
            return Correlation::Duplicate {
                event_id: notification.id,
            };
        }

        let Some(expectation) = self.match_expectation(&notification) else {
            tracing::info!(
                event_id = %notification.id,
                sender = %notification.sender,
                in_reply_to = ?notification.in_reply_to,
                "settlement notification matched no pending request, dropping"
            );
            return Correlation::Unmatched {
                event_id: notification.id,
            };
        };

        let payload = match SettlementPayload::parse(&notification.payload) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(
                    event_id = %notification.id,
                    request_id = %expectation.request_id,
                    error = %e,
                    "unparseable settlement payload"
                );
                return Correlation::Malformed {
                    event_id: notification.id,
                    request_id: expectation.request_id.clone(),
                };
            }
        };

        // Value has already moved; a ledger fault must not strand the payment.
        self.finalize(&expectation, &payload).await;

        if let Some(coin_id) = payload.coin_id.as_deref() {
            if coin_id != expectation.coin_id {
                return self.reject(
                    &expectation,
                    FailureReason::CoinMismatch {
                        expected: expectation.coin_id.clone(),
                        received: coin_id.to_string(),
                    },
                );
            }
        }
        if payload.amount != expectation.amount {
            return self.reject(
                &expectation,
                FailureReason::AmountMismatch {
                    expected: expectation.amount,
                    received: payload.amount,
                },
            );
        }

        let confirmed = ConfirmedPayment {
            cart_id: expectation.cart_id.clone(),
            request_id: expectation.request_id.clone(),
            settlement_ref: payload
                .transaction_id
                .clone()
                .unwrap_or_else(|| notification.id.clone()),
            amount: payload.amount,
            confirmed_at: Utc::now(),
        };

        if self
            .registry
            .resolve(&expectation, Outcome::Settled(confirmed.clone()))
        {
            self.registry.record_settlement_event(&notification.id);
            tracing::info!(
                cart_id = %confirmed.cart_id,
                request_id = %confirmed.request_id,
                settlement_ref = %confirmed.settlement_ref,
                amount = confirmed.amount,
                "payment confirmed"
            );
            Correlation::Settled(confirmed)
        } else {
            tracing::error!(
                cart_id = %expectation.cart_id,
                request_id = %expectation.request_id,
                event_id = %notification.id,
                amount = payload.amount,
                outcome = ?expectation.outcome(),
                "settlement arrived after the request was already resolved, manual reconciliation required"
            );
            Correlation::AlreadyResolved {
                request_id: expectation.request_id.clone(),
            }
        }
    }

    fn match_expectation(
        &self,
        notification: &SettlementNotification,
    ) -> Option<Arc<PaymentExpectation>> {
        // A reference is authoritative; only unreferenced transfers match by sender.
        match notification.in_reply_to.as_deref() {
            Some(reference) => self.registry.find_by_request_id(reference),
            None => self.registry.find_by_counterparty(&notification.sender),
        }
    }

    async fn finalize(&self, expectation: &PaymentExpectation, payload: &SettlementPayload) {
        let result = match payload.scheme {
            AddressScheme::Proxy => self
                .ledger
                .finalize(&FinalizeRequest {
                    source_token: payload.source_token.clone(),
                    recipient_state: payload.recipient_state.clone(),
                    transfer_tx: payload.transfer_tx.clone(),
                    aux_tokens: payload.aux_tokens.clone(),
                })
                .await
                .map(|_finalized| ()),
            AddressScheme::Direct => self.ledger.persist_token(&payload.source_token).await,
        };

        if let Err(e) = result {
            tracing::warn!(
                cart_id = %expectation.cart_id,
                request_id = %expectation.request_id,
                scheme = ?payload.scheme,
                error = %e,
                "token finalization failed, confirming anyway"
            );
        }
    }

    fn reject(&self, expectation: &Arc<PaymentExpectation>, reason: FailureReason) -> Correlation {
        if !self
            .registry
            .resolve(expectation, Outcome::Failed(reason.clone()))
        {
            return Correlation::AlreadyResolved {
                request_id: expectation.request_id.clone(),
            };
        }
        tracing::error!(
            cart_id = %expectation.cart_id,
            request_id = %expectation.request_id,
            reason = ?reason,
            "settlement does not match the request, manual reconciliation required"
        );
        Correlation::Mismatch {
            cart_id: expectation.cart_id.clone(),
            request_id: expectation.request_id.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RecordingLedger;
    use crate::payment::ExpectationParams;
    use serde_json::json;

    fn setup(
        ledger: RecordingLedger,
    ) -> (Arc<PaymentRequestRegistry>, Arc<RecordingLedger>, EventCorrelator) {
        let registry = Arc::new(PaymentRequestRegistry::new());
        let ledger = Arc::new(ledger);
        let correlator = EventCorrelator::new(registry.clone(), ledger.clone());
        (registry, ledger, correlator)
    }

    fn register(registry: &PaymentRequestRegistry, cart: &str, request: &str, amount: u64) {
        registry.register(ExpectationParams {
            request_id: request.into(),
            cart_id: cart.into(),
            alias: "bob".into(),
            address: "addr-bob".into(),
            amount,
            coin_id: "UCT".into(),
        });
    }

    fn transfer(reply_to: Option<&str>, sender: &str, payload: serde_json::Value) -> RelayEvent {
        RelayEvent::TokenTransfer(SettlementNotification {
            id: "evt-1".into(),
            sender: sender.into(),
            in_reply_to: reply_to.map(String::from),
            payload,
        })
    }

    fn payload(amount: u64) -> serde_json::Value {
        json!({
            "amount": amount,
            "sourceToken": {"id": "tok"},
            "transferTx": {"hash": "0xabc"},
            "transactionId": "tx-1"
        })
    }

    #[tokio::test]
    async fn test_non_settlement_events_are_ignored() {
        let (registry, ledger, correlator) = setup(RecordingLedger::new());
        register(&registry, "cart-1", "req-1", 10);

        assert_eq!(correlator.handle(RelayEvent::Other).await, Correlation::Ignored);
        assert_eq!(registry.len(), 1);
        assert!(ledger.persisted().is_empty());
    }

    #[tokio::test]
    async fn test_matches_by_reference() {
        let (registry, ledger, correlator) = setup(RecordingLedger::new());
        register(&registry, "cart-1", "req-1", 4999);

        let result = correlator
            .handle(transfer(Some("req-1"), "someone-else", payload(4999)))
            .await;

        let Correlation::Settled(c) = &result else {
            panic!("expected settlement, got {result:?}");
        };
        assert_eq!(c.cart_id, "cart-1");
        assert_eq!(c.settlement_ref, "tx-1");
        assert!(registry.is_empty());
        assert_eq!(&registry.confirmed("cart-1").unwrap(), c);
        assert_eq!(ledger.persisted().len(), 1);
    }

    #[tokio::test]
    async fn test_falls_back_to_sender() {
        let (registry, _ledger, correlator) = setup(RecordingLedger::new());
        register(&registry, "cart-1", "req-1", 4999);

        let result = correlator
            .handle(transfer(None, "addr-bob", payload(4999)))
            .await;
        assert!(matches!(result, Correlation::Settled(_)));
    }

    #[tokio::test]
    async fn test_unmatched_events_resolve_nothing() {
        let (registry, _ledger, correlator) = setup(RecordingLedger::new());
        register(&registry, "cart-1", "req-1", 4999);

        let result = correlator
            .handle(transfer(Some("req-unknown"), "addr-stranger", payload(4999)))
            .await;
        assert_eq!(
            result,
            Correlation::Unmatched {
                event_id: "evt-1".into()
            }
        );
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_amount_mismatch_fails_and_removes() {
        let (registry, _ledger, correlator) = setup(RecordingLedger::new());
        register(&registry, "cart-1", "req-1", 4999);
        let expectation = registry.find_by_request_id("req-1").unwrap();

        let result = correlator
            .handle(transfer(Some("req-1"), "addr-bob", payload(4998)))
            .await;

        assert_eq!(
            result,
            Correlation::Mismatch {
                cart_id: "cart-1".into(),
                request_id: "req-1".into(),
                reason: FailureReason::AmountMismatch {
                    expected: 4999,
                    received: 4998,
                },
            }
        );
        assert!(registry.is_empty());
        assert!(registry.confirmed("cart-1").is_none());
        assert_eq!(
            expectation.outcome(),
            Some(Outcome::Failed(FailureReason::AmountMismatch {
                expected: 4999,
                received: 4998
            }))
        );

        // Redelivery of the same event finds nothing to match.
        let again = correlator
            .handle(transfer(Some("req-1"), "addr-bob", payload(4998)))
            .await;
        assert!(matches!(again, Correlation::Unmatched { .. }));
    }

    #[tokio::test]
    async fn test_wrong_coin_fails_the_request() {
        let (registry, _ledger, correlator) = setup(RecordingLedger::new());
        register(&registry, "cart-1", "req-1", 4999);

        let mut body = payload(4999);
        body["coinId"] = json!("WORTHLESS");
        let result = correlator
            .handle(transfer(Some("req-1"), "addr-bob", body))
            .await;

        assert_eq!(
            result,
            Correlation::Mismatch {
                cart_id: "cart-1".into(),
                request_id: "req-1".into(),
                reason: FailureReason::CoinMismatch {
                    expected: "UCT".into(),
                    received: "WORTHLESS".into(),
                },
            }
        );
        assert!(registry.confirmed("cart-1").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_matching_coin_is_accepted() {
        let (registry, _ledger, correlator) = setup(RecordingLedger::new());
        register(&registry, "cart-1", "req-1", 4999);

        let mut body = payload(4999);
        body["coinId"] = json!("UCT");
        let result = correlator
            .handle(transfer(Some("req-1"), "addr-bob", body))
            .await;
        assert!(matches!(result, Correlation::Settled(_)));
    }

    #[tokio::test]
    async fn test_redelivered_event_settles_nothing_else() {
        let (registry, _ledger, correlator) = setup(RecordingLedger::new());
        register(&registry, "cart-1", "req-1", 4999);
        register(&registry, "cart-2", "req-2", 4999);

        let first = correlator
            .handle(transfer(Some("req-1"), "addr-bob", payload(4999)))
            .await;
        assert!(matches!(first, Correlation::Settled(ref c) if c.cart_id == "cart-1"));

        let again = correlator
            .handle(transfer(Some("req-1"), "addr-bob", payload(4999)))
            .await;
        assert_eq!(
            again,
            Correlation::Duplicate {
                event_id: "evt-1".into()
            }
        );
        assert!(registry.confirmed("cart-2").is_none());
        assert!(registry.find_by_request_id("req-2").is_some());
    }

    #[tokio::test]
    async fn test_stale_reference_does_not_fall_back_to_sender() {
        let (registry, _ledger, correlator) = setup(RecordingLedger::new());
        register(&registry, "cart-2", "req-2", 4999);

        let result = correlator
            .handle(transfer(Some("req-gone"), "addr-bob", payload(4999)))
            .await;
        assert!(matches!(result, Correlation::Unmatched { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_finalization_failure_does_not_block_confirmation() {
        let (registry, ledger, correlator) = setup(RecordingLedger::failing());
        register(&registry, "cart-1", "req-1", 4999);

        let mut body = payload(4999);
        body["scheme"] = json!("proxy");
        let result = correlator
            .handle(transfer(Some("req-1"), "addr-bob", json!(body.to_string())))
            .await;

        assert!(matches!(result, Correlation::Settled(_)));
        assert_eq!(ledger.finalize_calls(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_leaves_expectation_pending() {
        let (registry, _ledger, correlator) = setup(RecordingLedger::new());
        register(&registry, "cart-1", "req-1", 4999);

        let result = correlator
            .handle(transfer(Some("req-1"), "addr-bob", json!({"amount": "lots"})))
            .await;
        assert!(matches!(result, Correlation::Malformed { .. }));
        assert_eq!(registry.len(), 1);
    }
}
