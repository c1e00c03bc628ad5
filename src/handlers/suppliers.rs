use super::{AppState, Pagination};
use crate::entities::customer::PartyStatus;
use crate::errors::ServiceError;
use crate::services::parties::{CreateSupplierRequest, PartyFilters, UpdateSupplierRequest};
use crate::PaginatedResponse;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ListSuppliersQuery {
    #[serde(default = "super::default_page")]
    pub page: u64,
    #[serde(default = "super::default_per_page")]
    pub per_page: u64,
    pub status: Option<PartyStatus>,
    pub search: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreditCheckQuery {
    pub amount: Decimal,
}

async fn create_supplier(
    State(state): State<AppState>,
    Json(request): Json<CreateSupplierRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let supplier = state.services.parties.create_supplier(request).await?;
    Ok((StatusCode::CREATED, Json(supplier)))
}

async fn get_supplier(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let supplier = state.services.parties.get_supplier(id).await?;
    Ok(Json(supplier))
}

async fn list_suppliers(
    State(state): State<AppState>,
    Query(query): Query<ListSuppliersQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let pagination = Pagination {
        page: query.page,
        per_page: query.per_page,
    }
    .clamped(state.config.api_max_page_size as u64);
    let filters = PartyFilters {
        status: query.status,
        search: query.search,
    };
    let (items, total) = state
        .services
        .parties
        .list_suppliers(&filters, pagination.page, pagination.per_page)
        .await?;
    Ok(Json(PaginatedResponse::new(items, total, pagination)))
}

async fn update_supplier(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateSupplierRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let supplier = state.services.parties.update_supplier(id, request).await?;
    Ok(Json(supplier))
}

async fn get_supplier_balance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let balances = state.services.parties.supplier_balances(id).await?;
    Ok(Json(balances))
}

async fn check_supplier_credit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<CreditCheckQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let check = state
        .services
        .parties
        .check_supplier_credit(id, query.amount)
        .await?;
    Ok(Json(check))
}

async fn recalculate_supplier_balance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let result = state.services.parties.recalculate_supplier(id).await?;
    Ok(Json(result))
}

pub fn supplier_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_supplier).get(list_suppliers))
        .route("/:id", get(get_supplier).put(update_supplier))
        .route("/:id/balance", get(get_supplier_balance))
        .route("/:id/credit-check", get(check_supplier_credit))
        .route("/:id/recalculate", post(recalculate_supplier_balance))
}
