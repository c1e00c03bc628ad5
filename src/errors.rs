use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;

fn scoped_request_id() -> Option<String> {
    crate::request_id::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Standard error body returned by every endpoint.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "Unprocessable Entity",
    "message": "Insufficient stock for product 550e8400-e29b-41d4-a716-446655440000: requested 5, available 2",
    "details": {"available": "2", "requested": "5"},
    "request_id": "9f6b2c1e-8f04-4f4e-9a4e-1d2b3c4d5e6f",
    "timestamp": "2025-11-02T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    #[schema(example = "Not Found")]
    pub error: String,
    /// What went wrong, in one sentence
    pub message: String,
    /// Structured numeric context for rejections (stock levels, balances, limits)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Correlates the failure with the request logs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// ISO 8601 timestamp when the error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: Uuid,
        requested: Decimal,
        available: Decimal,
    },

    #[error("Credit limit exceeded for party {party_id}: balance {current_balance} + requested {requested} = {projected_balance} exceeds limit {credit_limit}")]
    CreditLimitExceeded {
        party_id: Uuid,
        current_balance: Decimal,
        credit_limit: Decimal,
        requested: Decimal,
        projected_balance: Decimal,
    },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Compensation incomplete after '{source_error}': {failures:?}; manual reconciliation required")]
    PartialCompensationFailure {
        // Named `source_error` rather than `source` because thiserror treats a
        // field literally named `source` as the Error::source() cause, which a
        // String cannot be. Serialized and reported as "source" everywhere.
        #[serde(rename = "source")]
        source_error: String,
        failures: Vec<String>,
    },

    #[error("Migration error: {0}")]
    MigrationError(String),

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

impl ServiceError {
    /// Maps every variant to its HTTP status. Handlers never pick status
    /// codes themselves.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_)
            | Self::InvalidInput(_)
            | Self::BadRequest(_)
            | Self::InvalidStateTransition { .. } => StatusCode::BAD_REQUEST,
            Self::EventError(_)
            | Self::InternalError(_)
            | Self::MigrationError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Conflict(_) | Self::ConcurrentModification(_) => StatusCode::CONFLICT,
            Self::InsufficientStock { .. } | Self::CreditLimitExceeded { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            // Compensation gaps surface as server failures even when the
            // trigger was a client error.
            Self::PartialCompensationFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The body text for HTTP responses. Server-side failures collapse to a
    /// generic line; client rejections keep their detail.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::EventError(_)
            | Self::InternalError(_)
            | Self::MigrationError(_)
            | Self::Other(_) => "Internal server error".to_string(),
            Self::ConcurrentModification(id) => {
                format!("Concurrent modification for ID {}", id)
            }
            // Rejections carry their numeric context by contract.
            _ => self.to_string(),
        }
    }

    /// Structured numeric context for the response body, where the variant has any.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::InsufficientStock {
                product_id,
                requested,
                available,
            } => Some(json!({
                "product_id": product_id,
                "requested": requested,
                "available": available,
            })),
            Self::CreditLimitExceeded {
                party_id,
                current_balance,
                credit_limit,
                requested,
                projected_balance,
            } => Some(json!({
                "party_id": party_id,
                "current_balance": current_balance,
                "credit_limit": credit_limit,
                "requested": requested,
                "projected_balance": projected_balance,
            })),
            Self::InvalidStateTransition { from, to } => Some(json!({
                "from": from,
                "to": to,
            })),
            Self::PartialCompensationFailure {
                source_error,
                failures,
            } => Some(json!({
                "source": source_error,
                "failures": failures,
            })),
            _ => None,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            details: self.details(),
            request_id: scoped_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::to_bytes, http::StatusCode};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn error_bodies_carry_the_scoped_request_id() {
        let response = crate::request_id::scope_request_id(
            crate::request_id::RequestId::new("err-77"),
            async { ServiceError::NotFound("missing".into()).into_response() },
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.request_id.as_deref(), Some("err-77"));
    }

    #[test]
    fn variants_map_to_their_status_codes() {
        assert_eq!(
            ServiceError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::ValidationError("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::InsufficientStock {
                product_id: Uuid::nil(),
                requested: dec!(5),
                available: dec!(2),
            }
            .status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ServiceError::CreditLimitExceeded {
                party_id: Uuid::nil(),
                current_balance: dec!(80),
                credit_limit: dec!(100),
                requested: dec!(30),
                projected_balance: dec!(110),
            }
            .status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ServiceError::InvalidStateTransition {
                from: "delivered".into(),
                to: "pending".into(),
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn partial_compensation_failure_is_always_a_server_error() {
        let err = ServiceError::PartialCompensationFailure {
            source_error: "insufficient stock".into(),
            failures: vec!["restore product abc: database error".into()],
        };
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        let details = err.details().unwrap();
        assert_eq!(details["source"], "insufficient stock");
    }

    #[test]
    fn internal_failures_collapse_to_a_generic_message() {
        assert_eq!(
            ServiceError::InternalError("connection pool state dump".into()).response_message(),
            "Internal server error"
        );
        assert_eq!(
            ServiceError::EventError("channel closed".into()).response_message(),
            "Internal server error"
        );

        // Rejections keep their numbers.
        let err = ServiceError::InsufficientStock {
            product_id: Uuid::nil(),
            requested: dec!(5),
            available: dec!(2),
        };
        assert!(err.response_message().contains("requested 5"));
        assert!(err.response_message().contains("available 2"));
    }

    #[test]
    fn credit_limit_details_carry_full_numeric_context() {
        let err = ServiceError::CreditLimitExceeded {
            party_id: Uuid::nil(),
            current_balance: dec!(80),
            credit_limit: dec!(100),
            requested: dec!(30),
            projected_balance: dec!(110),
        };
        let details = err.details().unwrap();
        assert_eq!(details["current_balance"], serde_json::json!("80"));
        assert_eq!(details["projected_balance"], serde_json::json!("110"));
    }
}
