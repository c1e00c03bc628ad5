use super::{actor_from_headers, AppState, Pagination};
use crate::entities::purchase_invoice::InvoiceStatus;
use crate::errors::ServiceError;
use crate::services::purchase_invoices::{
    CreatePurchaseInvoiceRequest, InvoiceFilters, InvoicePaymentRequest,
    InvoiceTransitionRequest, UpdatePurchaseInvoiceRequest,
};
use crate::PaginatedResponse;
use axum::{
    extract::{Json, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ListInvoicesQuery {
    #[serde(default = "super::default_page")]
    pub page: u64,
    #[serde(default = "super::default_per_page")]
    pub per_page: u64,
    pub supplier_id: Option<Uuid>,
    pub status: Option<InvoiceStatus>,
}

async fn create_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreatePurchaseInvoiceRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let actor = actor_from_headers(&headers);
    let invoice = state
        .services
        .purchase_invoices
        .create_invoice(request, &actor)
        .await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

async fn get_invoice(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let invoice = state.services.purchase_invoices.get_invoice(id).await?;
    Ok(Json(invoice))
}

async fn list_invoices(
    State(state): State<AppState>,
    Query(query): Query<ListInvoicesQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let pagination = Pagination {
        page: query.page,
        per_page: query.per_page,
    }
    .clamped(state.config.api_max_page_size as u64);
    let filters = InvoiceFilters {
        supplier_id: query.supplier_id,
        status: query.status,
    };
    let (items, total) = state
        .services
        .purchase_invoices
        .list_invoices(filters, pagination.page, pagination.per_page)
        .await?;
    Ok(Json(PaginatedResponse::new(items, total, pagination)))
}

async fn update_invoice(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<UpdatePurchaseInvoiceRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let actor = actor_from_headers(&headers);
    let invoice = state
        .services
        .purchase_invoices
        .update_invoice(id, request, &actor)
        .await?;
    Ok(Json(invoice))
}

async fn record_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<InvoicePaymentRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let invoice = state
        .services
        .purchase_invoices
        .record_payment(id, request)
        .await?;
    Ok(Json(invoice))
}

async fn transition_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<InvoiceTransitionRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let invoice = state
        .services
        .purchase_invoices
        .transition_status(id, request.status)
        .await?;
    Ok(Json(invoice))
}

async fn cancel_invoice(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ServiceError> {
    let actor = actor_from_headers(&headers);
    let invoice = state
        .services
        .purchase_invoices
        .cancel_invoice(id, &actor)
        .await?;
    Ok(Json(invoice))
}

async fn delete_invoice(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ServiceError> {
    let actor = actor_from_headers(&headers);
    state
        .services
        .purchase_invoices
        .delete_invoice(id, &actor)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn purchase_invoice_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_invoice).get(list_invoices))
        .route(
            "/:id",
            get(get_invoice).put(update_invoice).delete(delete_invoice),
        )
        .route("/:id/payments", post(record_payment))
        .route("/:id/status", put(transition_status))
        .route("/:id/cancel", post(cancel_invoice))
}
