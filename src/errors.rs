use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned by every failing endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Request identifier for support and debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

/// Reasons a coupon is refused at checkout. The messages are shown to shoppers as-is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
pub enum CouponError {
    #[error("Invalid coupon code.")]
    InvalidCode,

    #[error("Coupon is not active.")]
    Inactive,

    #[error("Coupon is not valid at this time.")]
    OutsideWindow,

    #[error("Order must be at least {0} to use this coupon.")]
    BelowMinimum(Decimal),

    #[error("Coupon is valid only for your first order.")]
    FirstOrderOnly,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Cart is empty")]
    EmptyCart,

    #[error("{0}")]
    InvalidCoupon(#[from] CouponError),

    #[error("Unsupported payment gateway: {0}")]
    UnsupportedGateway(String),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("Payment not found: {0}")]
    PaymentNotFound(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ServiceError::ExternalServiceError(format!("gateway request timed out: {}", err))
        } else {
            ServiceError::ExternalServiceError(err.to_string())
        }
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) | Self::PaymentNotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_)
            | Self::EmptyCart
            | Self::InvalidCoupon(_)
            | Self::UnsupportedGateway(_)
            | Self::InvalidSignature(_)
            | Self::InvalidOperation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::InsufficientStock(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            Self::DatabaseError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::SerializationError(_) | Self::InternalError(_) | Self::Other(_) => {
                "Internal server error".to_string()
            }
            Self::ExternalServiceError(_) => "Payment gateway unavailable".to_string(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "request failed");
        }

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            details: None,
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn service_error_response_includes_request_id() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("req-123"), async {
                ServiceError::PaymentNotFound("txn_1".into()).into_response()
            })
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.request_id.as_deref(), Some("req-123"));
        assert_eq!(payload.message, "Payment not found: txn_1");
    }

    #[test]
    fn service_error_status_code_mapping() {
        assert_eq!(ServiceError::EmptyCart.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ServiceError::InvalidCoupon(CouponError::Inactive).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::UnsupportedGateway("bitcoin".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::InsufficientStock("SKU-1".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ServiceError::PaymentNotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::ExternalServiceError("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ServiceError::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn coupon_messages_are_user_facing() {
        assert_eq!(
            ServiceError::from(CouponError::BelowMinimum(dec!(50.00))).response_message(),
            "Order must be at least 50.00 to use this coupon."
        );
        assert_eq!(
            ServiceError::from(CouponError::InvalidCode).response_message(),
            "Invalid coupon code."
        );
    }

    #[test]
    fn internal_details_are_hidden() {
        assert_eq!(
            ServiceError::InternalError("secret path".into()).response_message(),
            "Internal server error"
        );
        assert_eq!(
            ServiceError::ExternalServiceError("paypal 500: stack".into()).response_message(),
            "Payment gateway unavailable"
        );
    }
}
