//! Order lifecycle.
//!
//! ```text
//! pending ──► awaiting_payment ──► paid
//!    │               ├──────────► cancelled
//!    └──► cancelled  └──────────► payment_timeout
//! ```
//!
//! `paid`, `cancelled` and `payment_timeout` are terminal. [`OrderBook::force_status`]
//! bypasses the guards.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::PaymentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    AwaitingPayment,
    Paid,
    Cancelled,
    PaymentTimeout,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::AwaitingPayment => "awaiting_payment",
            OrderStatus::Paid => "paid",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::PaymentTimeout => "payment_timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Paid | OrderStatus::Cancelled | OrderStatus::PaymentTimeout
        )
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, AwaitingPayment)
                | (Pending, Cancelled)
                | (AwaitingPayment, Paid)
                | (AwaitingPayment, Cancelled)
                | (AwaitingPayment, PaymentTimeout)
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "awaiting_payment" => Ok(OrderStatus::AwaitingPayment),
            "paid" => Ok(OrderStatus::Paid),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "payment_timeout" => Ok(OrderStatus::PaymentTimeout),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub cart_id: String,
    pub status: OrderStatus,
    pub total: u64,
    pub coin_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterparty_alias: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
}

/// In-memory order table.
#[derive(Default)]
pub struct OrderBook {
    orders: DashMap<String, Order>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a `pending` order for `cart_id`.
    pub fn create(&self, cart_id: &str, total: u64, coin_id: &str) -> Order {
        let now = Utc::now();
        let order = Order {
            id: uuid::Uuid::new_v4().to_string(),
            cart_id: cart_id.to_string(),
            status: OrderStatus::Pending,
            total,
            coin_id: coin_id.to_string(),
            request_id: None,
            counterparty_alias: None,
            created_at: now,
            updated_at: now,
            paid_at: None,
        };
        self.orders.insert(order.id.clone(), order.clone());
        tracing::debug!(order_id = %order.id, cart_id = %cart_id, total, "order created");
        order
    }

    pub fn get(&self, order_id: &str) -> Option<Order> {
        self.orders.get(order_id).map(|o| o.value().clone())
    }

    /// Most recently created order for `cart_id`.
    pub fn latest_for_cart(&self, cart_id: &str) -> Option<Order> {
        self.orders
            .iter()
            .filter(|o| o.cart_id == cart_id)
            .max_by_key(|o| o.created_at)
            .map(|o| o.value().clone())
    }

    pub fn find_by_request_id(&self, request_id: &str) -> Option<Order> {
        self.orders
            .iter()
            .find(|o| o.request_id.as_deref() == Some(request_id))
            .map(|o| o.value().clone())
    }

    /// An order for `cart_id` that blocks a new checkout (`paid` or
    /// `awaiting_payment`).
    pub fn blocking_for_cart(&self, cart_id: &str) -> Option<Order> {
        self.orders
            .iter()
            .filter(|o| {
                o.cart_id == cart_id
                    && matches!(o.status, OrderStatus::Paid | OrderStatus::AwaitingPayment)
            })
            .max_by_key(|o| o.created_at)
            .map(|o| o.value().clone())
    }

    /// Guarded transition.
    pub fn transition(&self, order_id: &str, next: OrderStatus) -> Result<Order, PaymentError> {
        self.update(order_id, |order| {
            if !order.status.can_transition_to(next) {
                return Err(PaymentError::InvalidTransition {
                    order_id: order.id.clone(),
                    from: order.status,
                    to: next,
                });
            }
            apply_status(order, next);
            Ok(())
        })
    }

    /// `pending` -> `awaiting_payment`, recording the payment request.
    pub fn mark_awaiting_payment(
        &self,
        order_id: &str,
        request_id: &str,
        alias: &str,
    ) -> Result<Order, PaymentError> {
        self.update(order_id, |order| {
            if !order.status.can_transition_to(OrderStatus::AwaitingPayment) {
                return Err(PaymentError::InvalidTransition {
                    order_id: order.id.clone(),
                    from: order.status,
                    to: OrderStatus::AwaitingPayment,
                });
            }
            order.request_id = Some(request_id.to_string());
            order.counterparty_alias = Some(alias.to_string());
            apply_status(order, OrderStatus::AwaitingPayment);
            Ok(())
        })
    }

    /// Set any status, ignoring the transition guards.
    pub fn force_status(&self, order_id: &str, status: OrderStatus) -> Result<Order, PaymentError> {
        self.update(order_id, |order| {
            tracing::warn!(
                order_id = %order.id,
                from = %order.status,
                to = %status,
                "forcing order status"
            );
            apply_status(order, status);
            Ok(())
        })
    }

    /// Remove terminal orders whose last update is older than `retention`.
    pub fn prune_terminal(&self, retention: Duration, now: DateTime<Utc>) -> usize {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let cutoff = now - retention;
        let before = self.orders.len();
        self.orders
            .retain(|_, o| !(o.status.is_terminal() && o.updated_at < cutoff));
        before.saturating_sub(self.orders.len())
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    fn update(
        &self,
        order_id: &str,
        f: impl FnOnce(&mut Order) -> Result<(), PaymentError>,
    ) -> Result<Order, PaymentError> {
        let mut entry = self
            .orders
            .get_mut(order_id)
            .ok_or_else(|| PaymentError::OrderNotFound(order_id.to_string()))?;
        f(entry.value_mut())?;
        Ok(entry.value().clone())
    }
}

fn apply_status(order: &mut Order, status: OrderStatus) {
    let now = Utc::now();
    order.status = status;
    order.updated_at = now;
    if status == OrderStatus::Paid {
        order.paid_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let book = OrderBook::new();
        let order = book.create("cart-1", 4999, "UCT");
        assert_eq!(order.status, OrderStatus::Pending);

        let order = book
            .mark_awaiting_payment(&order.id, "req-1", "bob")
            .unwrap();
        assert_eq!(order.status, OrderStatus::AwaitingPayment);
        assert_eq!(order.request_id.as_deref(), Some("req-1"));
        assert!(order.updated_at >= order.created_at);
        assert_eq!(book.find_by_request_id("req-1").unwrap().id, order.id);

        let order = book.transition(&order.id, OrderStatus::Paid).unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
        assert!(order.paid_at.is_some());
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let book = OrderBook::new();
        let order = book.create("cart-1", 1, "UCT");
        book.mark_awaiting_payment(&order.id, "req-1", "bob").unwrap();
        book.transition(&order.id, OrderStatus::PaymentTimeout)
            .unwrap();

        let err = book.transition(&order.id, OrderStatus::Paid).unwrap_err();
        assert!(matches!(
            err,
            PaymentError::InvalidTransition {
                from: OrderStatus::PaymentTimeout,
                to: OrderStatus::Paid,
                ..
            }
        ));
        assert!(book
            .transition(&order.id, OrderStatus::AwaitingPayment)
            .is_err());
    }

    #[test]
    fn test_pending_cannot_jump_to_paid() {
        let book = OrderBook::new();
        let order = book.create("cart-1", 1, "UCT");
        assert!(book.transition(&order.id, OrderStatus::Paid).is_err());
        assert!(book.transition(&order.id, OrderStatus::Cancelled).is_ok());
    }

    #[test]
    fn test_force_status_bypasses_guards() {
        let book = OrderBook::new();
        let order = book.create("cart-1", 1, "UCT");
        book.transition(&order.id, OrderStatus::Cancelled).unwrap();

        let order = book.force_status(&order.id, OrderStatus::Paid).unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
        assert!(order.paid_at.is_some());
    }

    #[test]
    fn test_unknown_order() {
        let book = OrderBook::new();
        assert!(matches!(
            book.transition("nope", OrderStatus::Paid),
            Err(PaymentError::OrderNotFound(_))
        ));
    }

    #[test]
    fn test_prune_uses_updated_at_and_skips_live_orders() {
        let book = OrderBook::new();
        let live = book.create("cart-live", 1, "UCT");
        book.mark_awaiting_payment(&live.id, "req-live", "bob").unwrap();
        let done = book.create("cart-done", 1, "UCT");
        book.transition(&done.id, OrderStatus::Cancelled).unwrap();

        let retention = Duration::from_secs(24 * 60 * 60);
        assert_eq!(book.prune_terminal(retention, Utc::now()), 0);

        let later = Utc::now() + chrono::Duration::hours(25);
        assert_eq!(book.prune_terminal(retention, later), 1);
        assert!(book.get(&done.id).is_none());
        assert!(book.get(&live.id).is_some());
    }

    #[test]
    fn test_blocking_for_cart_ignores_terminal_failures() {
        let book = OrderBook::new();
        let first = book.create("cart-1", 1, "UCT");
        book.mark_awaiting_payment(&first.id, "req-1", "bob").unwrap();
        assert_eq!(book.blocking_for_cart("cart-1").unwrap().id, first.id);

        book.transition(&first.id, OrderStatus::PaymentTimeout)
            .unwrap();
        assert!(book.blocking_for_cart("cart-1").is_none());
        assert_eq!(book.latest_for_cart("cart-1").unwrap().id, first.id);
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::AwaitingPayment,
            OrderStatus::Paid,
            OrderStatus::Cancelled,
            OrderStatus::PaymentTimeout,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
    }
}
