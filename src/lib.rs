//! Tradebook API Library
//!
//! Core functionality for the Tradebook backend: customer and supplier
//! balances, inventory stock, sales orders, purchase invoices, returns,
//! recurring expenses and stock ledger reporting.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod metrics;
pub mod migrator;
pub mod openapi;
pub mod request_id;
pub mod services;

use axum::{extract::State, response::Json, routing::get, Router};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use utoipa::ToSchema;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: Arc<events::EventSender>,
    pub services: handlers::AppServices,
}

/// Uniform JSON envelope returned by every endpoint.
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize, ToSchema)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::request_id::current_request_id()
                .map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
    pub total_pages: u64,
}

impl<T> PaginatedResponse<T> {
    pub fn new(items: Vec<T>, total: u64, pagination: handlers::Pagination) -> Self {
        let per_page = pagination.per_page.max(1);
        Self {
            items,
            total,
            page: pagination.page.max(1),
            per_page,
            total_pages: total.div_ceil(per_page),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn validation_errors(errors: Vec<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some("Validation failed".to_string()),
            errors: Some(errors),
            meta: Some(ResponseMeta::capture()),
        }
    }
}

#[cfg(test)]
mod envelope_tests {
    use super::*;
    use chrono::DateTime;

    async fn scoped<F, T>(id: &str, build: F) -> ApiResponse<T>
    where
        F: FnOnce() -> ApiResponse<T>,
    {
        crate::request_id::scope_request_id(crate::request_id::RequestId::new(id), async {
            build()
        })
        .await
    }

    #[tokio::test]
    async fn success_envelope_carries_the_scoped_request_id() {
        let envelope = scoped("req-a1", || ApiResponse::success("ok")).await;

        let meta = envelope.meta.expect("envelope meta missing");
        assert_eq!(meta.request_id.as_deref(), Some("req-a1"));
        DateTime::parse_from_rfc3339(&meta.timestamp).expect("rfc3339 timestamp");
    }

    #[tokio::test]
    async fn error_envelope_carries_the_scoped_request_id() {
        let envelope = scoped("req-b2", || ApiResponse::<()>::error("oops".into())).await;

        let meta = envelope.meta.expect("envelope meta missing");
        assert_eq!(meta.request_id.as_deref(), Some("req-b2"));
        assert!(!meta.timestamp.is_empty());
    }

    #[tokio::test]
    async fn validation_envelope_carries_the_scoped_request_id() {
        let envelope = scoped("req-c3", || {
            ApiResponse::<()>::validation_errors(vec!["missing".into()])
        })
        .await;

        let meta = envelope.meta.expect("envelope meta missing");
        assert_eq!(meta.request_id.as_deref(), Some("req-c3"));
        DateTime::parse_from_rfc3339(&meta.timestamp).expect("rfc3339 timestamp");
    }

    #[test]
    fn pagination_maths_rounds_up() {
        let pagination = crate::handlers::Pagination {
            page: 2,
            per_page: 20,
        };
        let response = PaginatedResponse::new(vec![1, 2, 3], 41, pagination);
        assert_eq!(response.total_pages, 3);
        assert_eq!(response.page, 2);
        assert_eq!(response.per_page, 20);
    }
}

/// Handler result: an enveloped JSON body or a mapped service error.
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

/// Everything under `/api/v1`.
pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(api_status))
        .nest("/customers", handlers::customers::customer_routes())
        .nest("/suppliers", handlers::suppliers::supplier_routes())
        .nest("/products", handlers::products::product_routes())
        .nest("/inventory", handlers::inventory::inventory_routes())
        .nest("/sales-orders", handlers::sales_orders::sales_order_routes())
        .nest(
            "/purchase-invoices",
            handlers::purchase_invoices::purchase_invoice_routes(),
        )
        .nest("/returns", handlers::returns::return_routes())
        .nest("/expenses", handlers::expenses::expense_routes())
        .nest("/reports", handlers::reports::report_routes())
}

async fn api_status(State(state): State<AppState>) -> ApiResult<Value> {
    let body = json!({
        "status": "ok",
        "service": "tradebook-api",
        "version": env!("CARGO_PKG_VERSION"),
        "git": option_env!("GIT_HASH").unwrap_or("unknown"),
        "build_time": option_env!("BUILD_TIME").unwrap_or("unknown"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "environment": state.config.environment,
    });

    Ok(Json(ApiResponse::success(body)))
}

pub async fn health_check(State(state): State<AppState>) -> ApiResult<Value> {
    let database = match db::check_connection(&state.db).await {
        Ok(()) => "healthy",
        Err(_) => "unhealthy",
    };

    let body = json!({
        "status": database,
        "checks": { "database": database },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    Ok(Json(ApiResponse::success(body)))
}

/// Logs one line when a request arrives and one when it finishes, with
/// status and latency.
pub async fn request_logging_middleware(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let started = std::time::Instant::now();

    tracing::info!(method = %method, uri = %uri, "Request received");

    let response = next.run(request).await;

    tracing::info!(
        method = %method,
        uri = %uri,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "Request finished"
    );

    response
}

pub mod prelude {
    pub use crate::db::*;
    pub use crate::errors::*;
    pub use crate::events::*;
    pub use crate::request_id::*;
    pub use crate::{ApiResponse, ApiResult, AppState, PaginatedResponse};
}
