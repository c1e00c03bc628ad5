use super::{actor_from_headers, AppState, Pagination};
use crate::entities::sales_order::OrderStatus;
use crate::errors::ServiceError;
use crate::services::sales_orders::{
    CreateSalesOrderRequest, OrderFilters, RecordPaymentRequest, TransitionRequest,
    UpdateSalesOrderRequest,
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
pub struct ListOrdersQuery {
    #[serde(default = "super::default_page")]
    pub page: u64,
    #[serde(default = "super::default_per_page")]
    pub per_page: u64,
    pub customer_id: Option<Uuid>,
    pub status: Option<OrderStatus>,
}

async fn create_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateSalesOrderRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let actor = actor_from_headers(&headers);
    let order = state
        .services
        .sales_orders
        .create_order(request, &actor)
        .await?;
    Ok((StatusCode::CREATED, Json(order)))
}

async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.services.sales_orders.get_order(id).await?;
    Ok(Json(order))
}

async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<ListOrdersQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let pagination = Pagination {
        page: query.page,
        per_page: query.per_page,
    }
    .clamped(state.config.api_max_page_size as u64);
    let filters = OrderFilters {
        customer_id: query.customer_id,
        status: query.status,
    };
    let (items, total) = state
        .services
        .sales_orders
        .list_orders(filters, pagination.page, pagination.per_page)
        .await?;
    Ok(Json(PaginatedResponse::new(items, total, pagination)))
}

async fn update_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<UpdateSalesOrderRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let actor = actor_from_headers(&headers);
    let order = state
        .services
        .sales_orders
        .update_order(id, request, &actor)
        .await?;
    Ok(Json(order))
}

async fn record_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<RecordPaymentRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state
        .services
        .sales_orders
        .record_payment(id, request)
        .await?;
    Ok(Json(order))
}

async fn transition_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<TransitionRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state
        .services
        .sales_orders
        .transition_status(id, request.status)
        .await?;
    Ok(Json(order))
}

async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ServiceError> {
    let actor = actor_from_headers(&headers);
    let order = state.services.sales_orders.cancel_order(id, &actor).await?;
    Ok(Json(order))
}

async fn delete_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ServiceError> {
    let actor = actor_from_headers(&headers);
    state.services.sales_orders.delete_order(id, &actor).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn sales_order_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_order).get(list_orders))
        .route("/:id", get(get_order).put(update_order).delete(delete_order))
        .route("/:id/payments", post(record_payment))
        .route("/:id/status", put(transition_status))
        .route("/:id/cancel", post(cancel_order))
}
