use super::{actor_from_headers, AppState, Pagination};
use crate::errors::ServiceError;
use crate::services::returns::{
    CreatePurchaseReturnRequest, CreateSaleReturnRequest, PurchaseReturnFilters,
    SaleReturnFilters,
};
use crate::PaginatedResponse;
use axum::{
    extract::{Json, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ListSaleReturnsQuery {
    #[serde(default = "super::default_page")]
    pub page: u64,
    #[serde(default = "super::default_per_page")]
    pub per_page: u64,
    pub customer_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ListPurchaseReturnsQuery {
    #[serde(default = "super::default_page")]
    pub page: u64,
    #[serde(default = "super::default_per_page")]
    pub per_page: u64,
    pub supplier_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
}

async fn create_sale_return(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateSaleReturnRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let actor = actor_from_headers(&headers);
    let created = state
        .services
        .returns
        .create_sale_return(request, &actor)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_sale_return(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let sale_return = state.services.returns.get_sale_return(id).await?;
    Ok(Json(sale_return))
}

async fn list_sale_returns(
    State(state): State<AppState>,
    Query(query): Query<ListSaleReturnsQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let pagination = Pagination {
        page: query.page,
        per_page: query.per_page,
    }
    .clamped(state.config.api_max_page_size as u64);
    let filters = SaleReturnFilters {
        customer_id: query.customer_id,
        order_id: query.order_id,
    };
    let (items, total) = state
        .services
        .returns
        .list_sale_returns(filters, pagination.page, pagination.per_page)
        .await?;
    Ok(Json(PaginatedResponse::new(items, total, pagination)))
}

async fn delete_sale_return(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ServiceError> {
    let actor = actor_from_headers(&headers);
    state.services.returns.delete_sale_return(id, &actor).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_purchase_return(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreatePurchaseReturnRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let actor = actor_from_headers(&headers);
    let created = state
        .services
        .returns
        .create_purchase_return(request, &actor)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_purchase_return(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let purchase_return = state.services.returns.get_purchase_return(id).await?;
    Ok(Json(purchase_return))
}

async fn list_purchase_returns(
    State(state): State<AppState>,
    Query(query): Query<ListPurchaseReturnsQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let pagination = Pagination {
        page: query.page,
        per_page: query.per_page,
    }
    .clamped(state.config.api_max_page_size as u64);
    let filters = PurchaseReturnFilters {
        supplier_id: query.supplier_id,
        invoice_id: query.invoice_id,
    };
    let (items, total) = state
        .services
        .returns
        .list_purchase_returns(filters, pagination.page, pagination.per_page)
        .await?;
    Ok(Json(PaginatedResponse::new(items, total, pagination)))
}

async fn delete_purchase_return(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ServiceError> {
    let actor = actor_from_headers(&headers);
    state
        .services
        .returns
        .delete_purchase_return(id, &actor)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn return_routes() -> Router<AppState> {
    Router::new()
        .route("/sales", post(create_sale_return).get(list_sale_returns))
        .route(
            "/sales/:id",
            get(get_sale_return).delete(delete_sale_return),
        )
        .route(
            "/purchases",
            post(create_purchase_return).get(list_purchase_returns),
        )
        .route(
            "/purchases/:id",
            get(get_purchase_return).delete(delete_purchase_return),
        )
}
