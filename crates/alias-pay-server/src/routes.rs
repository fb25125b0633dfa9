use actix_web::{get, post, put, web, HttpRequest, HttpResponse};
use alias_pay::{ConfirmStatus, OrderStatus, PaymentError, RelayEvent};
use serde::Deserialize;

use crate::auth;
use crate::error::ApiError;
use crate::metrics;
use crate::state::AppState;
use crate::upstream::IngestError;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutBody {
    pub cart_id: String,
    pub alias: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmBody {
    pub cart_id: String,
    #[serde(default)]
    pub wait_seconds: u64,
}

#[derive(Deserialize)]
pub struct StatusBody {
    pub status: String,
}

fn authorization(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
}

/// Bearer check for admin routes. Refuses everything when no token is set.
fn require_admin(req: &HttpRequest, state: &AppState) -> Result<(), HttpResponse> {
    let Some(token) = state.admin_token.as_deref() else {
        return Err(HttpResponse::Forbidden().json(serde_json::json!({
            "error": "forbidden",
            "message": "Set ADMIN_TOKEN to enable admin routes"
        })));
    };
    if auth::bearer_matches(authorization(req), token) {
        Ok(())
    } else {
        Err(HttpResponse::Unauthorized().json(serde_json::json!({
            "error": "unauthorized",
            "message": "Valid Bearer token required"
        })))
    }
}

#[get("/health")]
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let pending = state.service.pending_payments();
    if state.service.is_running() {
        HttpResponse::Ok().json(serde_json::json!({
            "status": "ok",
            "service": "alias-pay",
            "pendingPayments": pending,
        }))
    } else {
        HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "status": "stopped",
            "service": "alias-pay",
            "pendingPayments": pending,
        }))
    }
}

#[get("/metrics")]
pub async fn metrics_endpoint(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    match state.metrics_token.as_deref() {
        Some(token) => {
            if !auth::bearer_matches(authorization(&req), token) {
                return HttpResponse::Unauthorized().json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "Valid Bearer token required for /metrics"
                }));
            }
        }
        None if state.public_metrics => {}
        None => {
            return HttpResponse::Forbidden().json(serde_json::json!({
                "error": "forbidden",
                "message": "Set METRICS_TOKEN or ALIAS_PAY_PUBLIC_METRICS=true to access /metrics"
            }));
        }
    }
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::metrics_output())
}

#[post("/checkout")]
pub async fn checkout(
    state: web::Data<AppState>,
    body: web::Json<CheckoutBody>,
) -> Result<HttpResponse, ApiError> {
    match state.service.checkout(&body.cart_id, &body.alias).await {
        Ok(receipt) => {
            metrics::CHECKOUT_REQUESTS.with_label_values(&["ok"]).inc();
            Ok(HttpResponse::Ok().json(receipt))
        }
        Err(e) => {
            metrics::CHECKOUT_REQUESTS
                .with_label_values(&[e.code()])
                .inc();
            tracing::info!(cart_id = %body.cart_id, code = e.code(), error = %e, "checkout refused");
            Err(e.into())
        }
    }
}

#[post("/confirm")]
pub async fn confirm(
    state: web::Data<AppState>,
    body: web::Json<ConfirmBody>,
) -> Result<HttpResponse, ApiError> {
    let start = std::time::Instant::now();
    let result = state.service.confirm(&body.cart_id, body.wait_seconds).await;

    let (label, response) = match result {
        Ok(ConfirmStatus::Pending {
            cart_id,
            request_id,
        }) => (
            "pending",
            HttpResponse::Ok().json(serde_json::json!({
                "status": "pending",
                "cartId": cart_id,
                "requestId": request_id,
            })),
        ),
        Ok(ConfirmStatus::Confirmed(confirmed)) => (
            "confirmed",
            HttpResponse::Ok().json(serde_json::json!({
                "status": "confirmed",
                "cartId": confirmed.cart_id,
                "requestId": confirmed.request_id,
                "settlementRef": confirmed.settlement_ref,
                "amount": confirmed.amount,
                "confirmedAt": confirmed.confirmed_at,
            })),
        ),
        Err(PaymentError::Timeout {
            cart_id,
            request_id,
            waited_secs,
        }) => (
            "timeout",
            HttpResponse::Ok().json(serde_json::json!({
                "status": "timeout",
                "cartId": cart_id,
                "requestId": request_id,
                "waitedSecs": waited_secs,
            })),
        ),
        Err(e) => {
            metrics::CONFIRM_REQUESTS
                .with_label_values(&[e.code()])
                .inc();
            return Err(e.into());
        }
    };

    metrics::CONFIRM_REQUESTS.with_label_values(&[label]).inc();
    metrics::CONFIRM_LATENCY
        .with_label_values(&[label])
        .observe(start.elapsed().as_secs_f64());
    Ok(response)
}

#[get("/orders/{order_id}")]
pub async fn get_order(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let order = state.service.order(&path)?;
    Ok(HttpResponse::Ok().json(order))
}

#[put("/admin/orders/{order_id}/status")]
pub async fn force_order_status(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<StatusBody>,
) -> Result<HttpResponse, ApiError> {
    if let Err(resp) = require_admin(&req, &state) {
        return Ok(resp);
    }
    let status: OrderStatus = match body.status.parse() {
        Ok(s) => s,
        Err(message) => {
            return Ok(HttpResponse::BadRequest().json(serde_json::json!({
                "error": "invalid_status",
                "message": message,
            })))
        }
    };
    let order = state.service.force_order_status(&path, status)?;
    Ok(HttpResponse::Ok().json(order))
}

#[post("/admin/orders/{order_id}/cancel")]
pub async fn cancel_order(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    if let Err(resp) = require_admin(&req, &state) {
        return Ok(resp);
    }
    let order = state.service.cancel_order(&path).await?;
    Ok(HttpResponse::Ok().json(order))
}

#[post("/relay/events")]
pub async fn relay_events(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Bytes,
) -> HttpResponse {
    if let Some(secret) = state.relay_secret.as_deref() {
        let signature = req
            .headers()
            .get(auth::SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        if let Err(reason) = auth::verify(secret, &body, signature) {
            tracing::warn!(reason = reason.label(), "relay event signature rejected");
            metrics::HMAC_FAILURES
                .with_label_values(&[reason.label()])
                .inc();
            return HttpResponse::Unauthorized().json(serde_json::json!({
                "error": "authentication failed"
            }));
        }
    }

    let event: RelayEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            metrics::RELAY_EVENTS.with_label_values(&["invalid"]).inc();
            return HttpResponse::BadRequest().json(serde_json::json!({
                "error": "invalid_event",
                "message": e.to_string(),
            }));
        }
    };

    match state.events.ingest(event) {
        Ok(()) => {
            metrics::RELAY_EVENTS.with_label_values(&["accepted"]).inc();
            HttpResponse::Accepted().json(serde_json::json!({ "accepted": true }))
        }
        Err(e) => {
            let label = match e {
                IngestError::Closed => "closed",
                IngestError::Busy => "busy",
            };
            metrics::RELAY_EVENTS.with_label_values(&[label]).inc();
            tracing::warn!(reason = label, "relay event not accepted");
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "error": "unavailable",
                "message": format!("event subscription is {label}"),
            }))
        }
    }
}

/// Register every route on an actix `ServiceConfig`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(metrics_endpoint)
        .service(checkout)
        .service(confirm)
        .service(get_order)
        .service(force_order_status)
        .service(cancel_order)
        .service(relay_events);
}
