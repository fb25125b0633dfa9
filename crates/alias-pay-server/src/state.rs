use std::sync::Arc;

use alias_pay::PaymentService;

use crate::upstream::EventIngress;

/// Shared application state for the HTTP service.
pub struct AppState {
    pub service: Arc<PaymentService>,
    /// Where verified `/relay/events` bodies are pushed.
    pub events: Arc<dyn EventIngress>,
    /// HMAC secret for `X-Relay-Signature` (None = insecure dev mode).
    pub relay_secret: Option<Vec<u8>>,
    /// Bearer token for /metrics.
    pub metrics_token: Option<String>,
    /// Bearer token for /admin routes. Admin routes are refused when unset.
    pub admin_token: Option<String>,
    /// Serve /metrics without a token when no token is configured.
    pub public_metrics: bool,
}
