use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use alias_pay::PaymentError;

/// HTTP face of [`PaymentError`].
#[derive(Debug)]
pub struct ApiError(pub PaymentError);

impl From<PaymentError> for ApiError {
    fn from(e: PaymentError) -> Self {
        ApiError(e)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for ApiError {}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            PaymentError::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
            PaymentError::Validation { reason, .. } => match reason.code() {
                "cart_not_found" => StatusCode::NOT_FOUND,
                "already_paid" => StatusCode::CONFLICT,
                _ => StatusCode::UNPROCESSABLE_ENTITY,
            },
            PaymentError::CheckoutInProgress { .. }
            | PaymentError::AwaitingPayment { .. }
            | PaymentError::AmountMismatch { .. }
            | PaymentError::CoinMismatch { .. }
            | PaymentError::Cancelled { .. }
            | PaymentError::InvalidTransition { .. } => StatusCode::CONFLICT,
            PaymentError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            PaymentError::Shutdown { .. } => StatusCode::SERVICE_UNAVAILABLE,
            PaymentError::NoPaymentRequest { .. } | PaymentError::OrderNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            PaymentError::ResolutionFailed { .. }
            | PaymentError::Relay(_)
            | PaymentError::Upstream(_)
            | PaymentError::Finalization(_) => StatusCode::BAD_GATEWAY,
            PaymentError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            PaymentError::Persistence(_) | PaymentError::SerdeError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let message = if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            match &self.0 {
                PaymentError::ResolutionFailed { .. } => self.0.to_string(),
                other => {
                    tracing::error!(error = %other, "request failed");
                    "upstream or internal failure".to_string()
                }
            }
        } else {
            self.0.to_string()
        };

        HttpResponse::build(status).json(serde_json::json!({
            "error": self.0.code(),
            "message": message,
            "cartId": self.0.cart_id(),
            "requestId": self.0.request_id(),
        }))
    }
}
