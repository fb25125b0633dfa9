//! In-process implementations of the collaborator traits.
//!
//! Useful for tests and local development; none of them persist anything.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::error::PaymentError;
use crate::ports::{
    AliasDirectory, Cart, CartStore, Catalog, FinalizeRequest, Ledger, PaymentRequestMessage,
    Relay, StockLevel,
};
use crate::settlement::RelayEvent;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fixed alias table.
#[derive(Default)]
pub struct StaticDirectory {
    entries: DashMap<String, String>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alias(self, alias: &str, address: &str) -> Self {
        self.insert(alias, address);
        self
    }

    pub fn insert(&self, alias: &str, address: &str) {
        self.entries.insert(alias.to_string(), address.to_string());
    }
}

#[async_trait]
impl AliasDirectory for StaticDirectory {
    async fn lookup(&self, name: &str) -> Result<Option<String>, PaymentError> {
        Ok(self.entries.get(name).map(|a| a.value().clone()))
    }
}

/// Relay that keeps issued requests in memory and delivers events pushed
/// through [`LoopbackRelay::deliver`].
#[derive(Default)]
pub struct LoopbackRelay {
    issued: Mutex<Vec<(String, PaymentRequestMessage)>>,
    subscriber: Mutex<Option<mpsc::Sender<RelayEvent>>>,
    fail_issue: AtomicBool,
}

impl LoopbackRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `issue_request` calls fail.
    pub fn set_failing(&self, failing: bool) {
        self.fail_issue.store(failing, Ordering::SeqCst);
    }

    /// Requests issued so far, oldest first.
    pub fn issued(&self) -> Vec<(String, PaymentRequestMessage)> {
        lock(&self.issued).clone()
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.subscriber).is_some()
    }

    /// Push an event to the current subscriber. Returns `false` if nobody
    /// is subscribed.
    pub async fn deliver(&self, event: RelayEvent) -> bool {
        let sender = lock(&self.subscriber).clone();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Non-blocking [`deliver`](Self::deliver).
    pub fn try_deliver(&self, event: RelayEvent) -> Result<(), mpsc::error::TrySendError<RelayEvent>> {
        match lock(&self.subscriber).as_ref() {
            Some(tx) => tx.try_send(event),
            None => Err(mpsc::error::TrySendError::Closed(event)),
        }
    }
}

#[async_trait]
impl Relay for LoopbackRelay {
    async fn issue_request(&self, request: &PaymentRequestMessage) -> Result<String, PaymentError> {
        if self.fail_issue.load(Ordering::SeqCst) {
            return Err(PaymentError::Relay("relay unavailable".into()));
        }
        let request_id = uuid::Uuid::new_v4().to_string();
        lock(&self.issued).push((request_id.clone(), request.clone()));
        Ok(request_id)
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<RelayEvent>, PaymentError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        *lock(&self.subscriber) = Some(tx);
        Ok(rx)
    }

    async fn unsubscribe(&self) {
        lock(&self.subscriber).take();
    }
}

/// Ledger that records what it was asked to do.
#[derive(Default)]
pub struct RecordingLedger {
    persisted: Mutex<Vec<Value>>,
    finalize_calls: AtomicUsize,
    failing: bool,
}

impl RecordingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// A ledger whose every call fails.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn persisted(&self) -> Vec<Value> {
        lock(&self.persisted).clone()
    }

    pub fn finalize_calls(&self) -> usize {
        self.finalize_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Ledger for RecordingLedger {
    async fn finalize(&self, request: &FinalizeRequest) -> Result<Value, PaymentError> {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(PaymentError::Finalization("ledger offline".into()));
        }
        lock(&self.persisted).push(request.source_token.clone());
        Ok(request.source_token.clone())
    }

    async fn persist_token(&self, token: &Value) -> Result<(), PaymentError> {
        if self.failing {
            return Err(PaymentError::Finalization("token storage offline".into()));
        }
        lock(&self.persisted).push(token.clone());
        Ok(())
    }
}

/// Carts and stock levels in one map pair.
#[derive(Default)]
pub struct InMemoryCarts {
    carts: DashMap<String, Cart>,
    stock: DashMap<String, StockLevel>,
}

impl InMemoryCarts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_cart(&self, cart: Cart) {
        self.carts.insert(cart.id.clone(), cart);
    }

    pub fn set_stock(&self, item_id: &str, level: StockLevel) {
        self.stock.insert(item_id.to_string(), level);
    }

    pub fn remove_item(&self, item_id: &str) {
        self.stock.remove(item_id);
    }

    pub fn cart(&self, cart_id: &str) -> Option<Cart> {
        self.carts.get(cart_id).map(|c| c.value().clone())
    }
}

#[async_trait]
impl CartStore for InMemoryCarts {
    async fn get_cart(&self, cart_id: &str) -> Result<Option<Cart>, PaymentError> {
        Ok(self.cart(cart_id))
    }

    async fn set_locked(&self, cart_id: &str, locked: bool) -> Result<(), PaymentError> {
        match self.carts.get_mut(cart_id) {
            Some(mut cart) => {
                cart.locked = locked;
                Ok(())
            }
            None => Err(PaymentError::Upstream(format!("cart {cart_id} not found"))),
        }
    }
}

#[async_trait]
impl Catalog for InMemoryCarts {
    async fn stock(&self, item_id: &str) -> Result<Option<StockLevel>, PaymentError> {
        Ok(self.stock.get(item_id).map(|s| *s.value()))
    }
}
