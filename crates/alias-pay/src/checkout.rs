//! Checkout sequencing.
//!
//! A checkout runs under a per-cart advisory lock and performs its side
//! effects in a fixed order: re-validate the cart, resolve the counterparty,
//! issue the payment request, register the expectation, create the order,
//! lock the cart. The payment request is issued before the order exists so a
//! relay failure leaves nothing behind.

use std::sync::Arc;

use dashmap::DashSet;

use crate::error::{PaymentError, ValidationReason};
use crate::identity::IdentityResolver;
use crate::orders::{OrderBook, OrderStatus};
use crate::payment::{CheckoutReceipt, ExpectationParams};
use crate::ports::{Cart, CartStore, Catalog, PaymentRequestMessage, Relay};
use crate::registry::PaymentRequestRegistry;

/// Set of carts currently inside a checkout.
#[derive(Default)]
pub struct CheckoutLock {
    carts: DashSet<String>,
}

impl CheckoutLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `cart_id`, or `None` if another checkout holds it.
    pub fn try_acquire(&self, cart_id: &str) -> Option<CheckoutGuard<'_>> {
        if self.carts.insert(cart_id.to_string()) {
            Some(CheckoutGuard {
                lock: self,
                cart_id: cart_id.to_string(),
            })
        } else {
            None
        }
    }

    pub fn is_locked(&self, cart_id: &str) -> bool {
        self.carts.contains(cart_id)
    }
}

/// Releases the cart on drop.
pub struct CheckoutGuard<'a> {
    lock: &'a CheckoutLock,
    cart_id: String,
}

impl Drop for CheckoutGuard<'_> {
    fn drop(&mut self) {
        self.lock.carts.remove(&self.cart_id);
    }
}

pub struct CheckoutCoordinator {
    lock: CheckoutLock,
    registry: Arc<PaymentRequestRegistry>,
    orders: Arc<OrderBook>,
    resolver: IdentityResolver,
    relay: Arc<dyn Relay>,
    carts: Arc<dyn CartStore>,
    catalog: Arc<dyn Catalog>,
    coin_id: String,
}

impl CheckoutCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<PaymentRequestRegistry>,
        orders: Arc<OrderBook>,
        resolver: IdentityResolver,
        relay: Arc<dyn Relay>,
        carts: Arc<dyn CartStore>,
        catalog: Arc<dyn Catalog>,
        coin_id: impl Into<String>,
    ) -> Self {
        Self {
            lock: CheckoutLock::new(),
            registry,
            orders,
            resolver,
            relay,
            carts,
            catalog,
            coin_id: coin_id.into(),
        }
    }

    pub fn lock(&self) -> &CheckoutLock {
        &self.lock
    }

    pub async fn checkout(
        &self,
        cart_id: &str,
        alias: &str,
    ) -> Result<CheckoutReceipt, PaymentError> {
        let Some(_guard) = self.lock.try_acquire(cart_id) else {
            tracing::info!(cart_id = %cart_id, "checkout already running for cart");
            return Err(PaymentError::CheckoutInProgress {
                cart_id: cart_id.to_string(),
            });
        };

        self.reject_if_settled_or_waiting(cart_id)?;

        let cart = self
            .carts
            .get_cart(cart_id)
            .await?
            .ok_or_else(|| invalid(cart_id, ValidationReason::CartNotFound))?;
        if cart.lines.is_empty() {
            return Err(invalid(cart_id, ValidationReason::EmptyCart));
        }
        self.validate_stock(&cart).await?;

        let amount = cart
            .total()
            .filter(|total| *total > 0)
            .ok_or_else(|| invalid(cart_id, ValidationReason::InvalidAmount))?;

        let identity = self.resolver.resolve(alias).await.ok_or_else(|| {
            PaymentError::ResolutionFailed {
                cart_id: Some(cart_id.to_string()),
                alias: alias.to_string(),
                attempts: self.resolver.max_attempts(),
            }
        })?;

        let request_id = self
            .relay
            .issue_request(&PaymentRequestMessage {
                recipient_address: identity.address.clone(),
                amount,
                coin_id: self.coin_id.clone(),
                message: format!("Payment for cart {cart_id}"),
            })
            .await?;

        self.registry.register(ExpectationParams {
            request_id: request_id.clone(),
            cart_id: cart_id.to_string(),
            alias: identity.alias.clone(),
            address: identity.address,
            amount,
            coin_id: self.coin_id.clone(),
        });

        let order = self.orders.create(cart_id, amount, &self.coin_id);
        self.orders
            .mark_awaiting_payment(&order.id, &request_id, &identity.alias)?;

        if let Err(e) = self.carts.set_locked(cart_id, true).await {
            tracing::warn!(cart_id = %cart_id, error = %e, "failed to lock cart after checkout");
        }

        tracing::info!(
            cart_id = %cart_id,
            order_id = %order.id,
            request_id = %request_id,
            alias = %identity.alias,
            amount,
            "payment requested"
        );

        Ok(CheckoutReceipt {
            order_id: order.id,
            request_id,
            amount,
            counterparty_alias: identity.alias,
            coin_id: self.coin_id.clone(),
        })
    }

    fn reject_if_settled_or_waiting(&self, cart_id: &str) -> Result<(), PaymentError> {
        if let Some(order) = self.orders.blocking_for_cart(cart_id) {
            let request_id = order.request_id.clone().unwrap_or_default();
            return Err(match order.status {
                OrderStatus::AwaitingPayment => PaymentError::AwaitingPayment {
                    cart_id: cart_id.to_string(),
                    order_id: order.id,
                    request_id,
                },
                _ => invalid(cart_id, ValidationReason::AlreadyPaid { request_id }),
            });
        }
        if let Some(confirmed) = self.registry.confirmed(cart_id) {
            return Err(invalid(
                cart_id,
                ValidationReason::AlreadyPaid {
                    request_id: confirmed.request_id,
                },
            ));
        }
        Ok(())
    }

    async fn validate_stock(&self, cart: &Cart) -> Result<(), PaymentError> {
        for line in &cart.lines {
            let level = match self.catalog.stock(&line.item_id).await? {
                Some(level) if level.available => level,
                _ => {
                    return Err(invalid(
                        &cart.id,
                        ValidationReason::ItemUnavailable {
                            item_id: line.item_id.clone(),
                        },
                    ))
                }
            };
            if let Some(available) = level.quantity {
                if available < line.quantity {
                    return Err(invalid(
                        &cart.id,
                        ValidationReason::InsufficientStock {
                            item_id: line.item_id.clone(),
                            requested: line.quantity,
                            available,
                        },
                    ));
                }
            }
        }
        Ok(())
    }
}

fn invalid(cart_id: &str, reason: ValidationReason) -> PaymentError {
    PaymentError::Validation {
        cart_id: cart_id.to_string(),
        reason,
    }
}
