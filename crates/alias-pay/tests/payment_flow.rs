use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alias_pay::memory::{InMemoryCarts, LoopbackRelay, RecordingLedger, StaticDirectory};
use alias_pay::{
    AliasDirectory, Cart, CartLine, ConfirmStatus, ConfirmedPayment, ExpectationParams,
    FailureReason, OrderStatus, Outcome, PaymentConfig, PaymentError, PaymentRequestRegistry,
    PaymentService, RelayEvent, ServiceDeps, SettlementNotification, StockLevel,
};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;

struct Harness {
    service: Arc<PaymentService>,
    relay: Arc<LoopbackRelay>,
    carts: Arc<InMemoryCarts>,
}

fn cart(id: &str, unit_price: u64) -> Cart {
    Cart {
        id: id.into(),
        lines: vec![CartLine {
            item_id: "sku-1".into(),
            quantity: 1,
            unit_price,
        }],
        locked: false,
    }
}

async fn harness_with(directory: Arc<dyn AliasDirectory>) -> Harness {
    let relay = Arc::new(LoopbackRelay::new());
    let carts = Arc::new(InMemoryCarts::new());
    carts.put_cart(cart("cart-1", 4999));
    carts.set_stock(
        "sku-1",
        StockLevel {
            available: true,
            quantity: None,
        },
    );

    let service = Arc::new(PaymentService::new(
        ServiceDeps {
            directory,
            relay: relay.clone(),
            ledger: Arc::new(RecordingLedger::new()),
            carts: carts.clone(),
            catalog: carts.clone(),
            confirmations: None,
        },
        PaymentConfig::default(),
    ));
    service.initialize().await.unwrap();
    Harness {
        service,
        relay,
        carts,
    }
}

async fn harness() -> Harness {
    harness_with(Arc::new(StaticDirectory::new().with_alias("bob", "addr-bob"))).await
}

fn transfer(in_reply_to: &str, amount: u64) -> RelayEvent {
    transfer_in(in_reply_to, amount, "UCT")
}

fn transfer_in(in_reply_to: &str, amount: u64, coin_id: &str) -> RelayEvent {
    RelayEvent::TokenTransfer(SettlementNotification {
        id: format!("evt-{in_reply_to}"),
        sender: "addr-bob".into(),
        in_reply_to: Some(in_reply_to.into()),
        payload: json!({
            "amount": amount.to_string(),
            "coinId": coin_id,
            "sourceToken": "{\"id\":\"tok-1\"}",
            "transferTx": {"hash": "0xabc"},
            "transactionId": "tx-1"
        }),
    })
}

#[tokio::test]
async fn test_settlement_marks_order_paid_and_is_stable() {
    let h = harness().await;
    let receipt = h.service.checkout("cart-1", "@bob").await.unwrap();
    assert!(h.carts.cart("cart-1").unwrap().locked);

    assert!(h.relay.deliver(transfer(&receipt.request_id, 4999)).await);

    let first = h.service.confirm("cart-1", 5).await.unwrap();
    let ConfirmStatus::Confirmed(confirmed) = &first else {
        panic!("expected confirmation, got {first:?}");
    };
    assert_eq!(confirmed.request_id, receipt.request_id);
    assert_eq!(confirmed.settlement_ref, "tx-1");

    let second = h.service.confirm("cart-1", 0).await.unwrap();
    assert_eq!(first, second);

    let order = h.service.order(&receipt.order_id).unwrap();
    assert_eq!(order.status, OrderStatus::Paid);
    assert!(order.paid_at.is_some());
    assert!(h.carts.cart("cart-1").unwrap().locked);
    assert_eq!(h.service.pending_payments(), 0);

    let err = h.service.checkout("cart-1", "@bob").await.unwrap_err();
    assert_eq!(err.code(), "already_paid");
}

#[tokio::test]
async fn test_amount_mismatch_is_rejected() {
    let h = harness().await;
    let receipt = h.service.checkout("cart-1", "bob").await.unwrap();

    h.relay.deliver(transfer(&receipt.request_id, 4998)).await;

    match h.service.confirm("cart-1", 5).await {
        Err(PaymentError::AmountMismatch {
            expected,
            received,
            request_id,
            ..
        }) => {
            assert_eq!(expected, 4999);
            assert_eq!(received, 4998);
            assert_eq!(request_id, receipt.request_id);
        }
        other => panic!("expected amount mismatch, got {other:?}"),
    }
    assert_eq!(h.service.pending_payments(), 0);
    assert_eq!(
        h.service.order(&receipt.order_id).unwrap().status,
        OrderStatus::Cancelled
    );
    assert!(!h.carts.cart("cart-1").unwrap().locked);
}

/// Let the correlation loop catch up until the order leaves `awaiting_payment`.
async fn wait_for_order_change(h: &Harness, order_id: &str) -> OrderStatus {
    for _ in 0..200 {
        let status = h.service.order(order_id).unwrap().status;
        if status != OrderStatus::AwaitingPayment {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("order {order_id} never left awaiting_payment");
}

#[tokio::test]
async fn test_mismatch_handled_before_confirm_is_still_reported() {
    let h = harness().await;
    let receipt = h.service.checkout("cart-1", "bob").await.unwrap();

    h.relay.deliver(transfer(&receipt.request_id, 4998)).await;
    assert_eq!(
        wait_for_order_change(&h, &receipt.order_id).await,
        OrderStatus::Cancelled
    );
    assert!(!h.carts.cart("cart-1").unwrap().locked);

    for wait in [0, 5] {
        match h.service.confirm("cart-1", wait).await {
            Err(PaymentError::AmountMismatch {
                expected,
                received,
                request_id,
                ..
            }) => {
                assert_eq!((expected, received), (4999, 4998));
                assert_eq!(request_id, receipt.request_id);
            }
            other => panic!("expected amount mismatch, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_wrong_coin_does_not_confirm() {
    let h = harness().await;
    let receipt = h.service.checkout("cart-1", "bob").await.unwrap();

    h.relay
        .deliver(transfer_in(&receipt.request_id, 4999, "WORTHLESS"))
        .await;
    assert_eq!(
        wait_for_order_change(&h, &receipt.order_id).await,
        OrderStatus::Cancelled
    );

    let err = h.service.confirm("cart-1", 5).await.unwrap_err();
    match err {
        PaymentError::CoinMismatch {
            expected, received, ..
        } => {
            assert_eq!(expected, "UCT");
            assert_eq!(received, "WORTHLESS");
        }
        other => panic!("expected coin mismatch, got {other:?}"),
    }
    assert!(!h.carts.cart("cart-1").unwrap().locked);
}

#[tokio::test]
async fn test_redelivered_settlement_confirms_one_cart_only() {
    let h = harness().await;
    h.carts.put_cart(cart("cart-2", 4999));
    let first = h.service.checkout("cart-1", "bob").await.unwrap();
    let second = h.service.checkout("cart-2", "bob").await.unwrap();

    h.relay.deliver(transfer(&first.request_id, 4999)).await;
    h.relay.deliver(transfer(&first.request_id, 4999)).await;

    let status = h.service.confirm("cart-1", 5).await.unwrap();
    assert!(matches!(status, ConfirmStatus::Confirmed(ref c) if c.request_id == first.request_id));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        h.service.confirm("cart-2", 0).await.unwrap(),
        ConfirmStatus::Pending {
            cart_id: "cart-2".into(),
            request_id: second.request_id.clone(),
        }
    );
    assert_eq!(
        h.service.order(&second.order_id).unwrap().status,
        OrderStatus::AwaitingPayment
    );
    assert_eq!(h.service.pending_payments(), 1);
}

#[tokio::test]
async fn test_non_settlement_events_leave_request_pending() {
    let h = harness().await;
    let receipt = h.service.checkout("cart-1", "bob").await.unwrap();

    h.relay.deliver(RelayEvent::Other).await;
    h.relay
        .deliver(RelayEvent::TokenTransfer(SettlementNotification {
            id: "evt-stray".into(),
            sender: "addr-stranger".into(),
            in_reply_to: Some("someone-elses-request".into()),
            payload: json!({"amount": 4999}),
        }))
        .await;
    tokio::task::yield_now().await;

    let status = h.service.confirm("cart-1", 0).await.unwrap();
    assert_eq!(
        status,
        ConfirmStatus::Pending {
            cart_id: "cart-1".into(),
            request_id: receipt.request_id,
        }
    );
}

/// Blocks lookups until released so a checkout can be held mid-flight.
struct GatedDirectory {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl AliasDirectory for GatedDirectory {
    async fn lookup(&self, _name: &str) -> Result<Option<String>, PaymentError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(Some("addr-bob".into()))
    }
}

#[tokio::test]
async fn test_concurrent_checkout_fails_fast_then_reports_reference() {
    let gate = Arc::new(GatedDirectory {
        entered: Notify::new(),
        release: Notify::new(),
    });
    let h = harness_with(gate.clone()).await;

    let first = tokio::spawn({
        let service = h.service.clone();
        async move { service.checkout("cart-1", "bob").await }
    });
    gate.entered.notified().await;

    let err = h.service.checkout("cart-1", "bob").await.unwrap_err();
    assert!(matches!(err, PaymentError::CheckoutInProgress { ref cart_id } if cart_id == "cart-1"));

    gate.release.notify_one();
    let receipt = first.await.unwrap().unwrap();

    match h.service.checkout("cart-1", "bob").await {
        Err(PaymentError::AwaitingPayment { request_id, .. }) => {
            assert_eq!(request_id, receipt.request_id)
        }
        other => panic!("expected awaiting payment, got {other:?}"),
    }
    assert_eq!(h.relay.issued().len(), 1);
}

#[tokio::test]
async fn test_checkout_in_flight_during_shutdown_is_rejected() {
    let gate = Arc::new(GatedDirectory {
        entered: Notify::new(),
        release: Notify::new(),
    });
    let h = harness_with(gate.clone()).await;

    let checkout = tokio::spawn({
        let service = h.service.clone();
        async move { service.checkout("cart-1", "bob").await }
    });
    gate.entered.notified().await;

    h.service.shutdown().await;
    gate.release.notify_one();

    match checkout.await.unwrap() {
        Err(PaymentError::Shutdown { request_id, .. }) => {
            assert_eq!(h.relay.issued()[0].0, request_id)
        }
        other => panic!("expected shutdown rejection, got {other:?}"),
    }
    assert_eq!(h.service.pending_payments(), 0);
}

struct NeverFound {
    calls: AtomicU32,
}

#[async_trait]
impl AliasDirectory for NeverFound {
    async fn lookup(&self, _name: &str) -> Result<Option<String>, PaymentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }
}

#[tokio::test(start_paused = true)]
async fn test_resolution_retries_three_times() {
    let directory = Arc::new(NeverFound {
        calls: AtomicU32::new(0),
    });
    let h = harness_with(directory.clone()).await;

    let start = tokio::time::Instant::now();
    let err = h.service.checkout("cart-1", "@nobody").await.unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, PaymentError::ResolutionFailed { attempts: 3, .. }));
    assert_eq!(directory.calls.load(Ordering::SeqCst), 3);
    assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));
    assert!(h.relay.issued().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_unlocks_cart_and_allows_retry() {
    let h = harness().await;
    let receipt = h.service.checkout("cart-1", "bob").await.unwrap();

    let start = tokio::time::Instant::now();
    let err = h.service.confirm("cart-1", 500).await.unwrap_err();
    assert!(start.elapsed() >= Duration::from_secs(120));
    match &err {
        PaymentError::Timeout {
            request_id,
            waited_secs,
            ..
        } => {
            assert_eq!(request_id, &receipt.request_id);
            assert_eq!(*waited_secs, 120);
        }
        other => panic!("expected timeout, got {other:?}"),
    }

    assert_eq!(
        h.service.order(&receipt.order_id).unwrap().status,
        OrderStatus::PaymentTimeout
    );
    assert!(!h.carts.cart("cart-1").unwrap().locked);

    // A later query still reports the timeout.
    let again = h.service.confirm("cart-1", 0).await.unwrap_err();
    assert_eq!(again.code(), "timeout");

    let retry = h.service.checkout("cart-1", "bob").await.unwrap();
    assert_ne!(retry.request_id, receipt.request_id);
    assert_eq!(
        h.service.order_for_cart("cart-1").unwrap().id,
        retry.order_id
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_rejects_waiters_and_restart_rearms() {
    let h = harness().await;
    let receipt = h.service.checkout("cart-1", "bob").await.unwrap();

    let waiter = tokio::spawn({
        let service = h.service.clone();
        async move { service.confirm("cart-1", 60).await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;

    h.service.shutdown().await;
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, PaymentError::Shutdown { ref request_id, .. } if *request_id == receipt.request_id));
    assert!(matches!(
        h.service.confirm("cart-1", 0).await,
        Err(PaymentError::NotInitialized)
    ));

    h.service.initialize().await.unwrap();
    assert!(matches!(
        h.service.confirm("cart-1", 0).await.unwrap(),
        ConfirmStatus::Pending { .. }
    ));

    let deliver = tokio::spawn({
        let relay = h.relay.clone();
        let request_id = receipt.request_id.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            relay.deliver(transfer(&request_id, 4999)).await
        }
    });
    let status = h.service.confirm("cart-1", 30).await.unwrap();
    assert!(matches!(status, ConfirmStatus::Confirmed(_)));
    assert!(deliver.await.unwrap());
}

#[tokio::test]
async fn test_cancel_fails_waiter_and_unlocks() {
    let h = harness().await;
    let receipt = h.service.checkout("cart-1", "bob").await.unwrap();

    let order = h.service.cancel_order(&receipt.order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert!(!h.carts.cart("cart-1").unwrap().locked);
    assert_eq!(h.service.pending_payments(), 0);

    let err = h.service.confirm("cart-1", 5).await.unwrap_err();
    assert!(matches!(err, PaymentError::Cancelled { ref request_id, .. } if *request_id == receipt.request_id));
    assert!(h.service.cancel_order(&receipt.order_id).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeout_and_match_race_resolves_once() {
    let registry = Arc::new(PaymentRequestRegistry::new());

    for i in 0..200 {
        let cart_id = format!("cart-{i}");
        let request_id = format!("req-{i}");
        let expectation = registry.register(ExpectationParams {
            request_id: request_id.clone(),
            cart_id: cart_id.clone(),
            alias: "bob".into(),
            address: "addr-bob".into(),
            amount: 4999,
            coin_id: "UCT".into(),
        });

        let settle = tokio::spawn({
            let registry = registry.clone();
            let expectation = expectation.clone();
            let settled = Outcome::Settled(ConfirmedPayment {
                cart_id: cart_id.clone(),
                request_id: request_id.clone(),
                settlement_ref: "tx".into(),
                amount: 4999,
                confirmed_at: chrono::Utc::now(),
            });
            async move { registry.resolve(&expectation, settled) }
        });
        let expire = tokio::spawn({
            let registry = registry.clone();
            let expectation = expectation.clone();
            async move {
                registry.resolve(
                    &expectation,
                    Outcome::Failed(FailureReason::Timeout { waited_secs: 1 }),
                )
            }
        });

        let settled_won = settle.await.unwrap();
        let expired_won = expire.await.unwrap();
        assert!(settled_won ^ expired_won, "iteration {i}: exactly one winner");

        let outcome = expectation.outcome().unwrap();
        assert_eq!(matches!(outcome, Outcome::Settled(_)), settled_won);
        assert_eq!(registry.confirmed(&cart_id).is_some(), settled_won);
        assert!(registry.find_by_request_id(&request_id).is_none());
    }
}
