use super::{AppState, Pagination};
use crate::entities::customer::PartyStatus;
use crate::errors::ServiceError;
use crate::services::parties::{CreateCustomerRequest, PartyFilters, UpdateCustomerRequest};
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
pub struct ListCustomersQuery {
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

async fn create_customer(
    State(state): State<AppState>,
    Json(request): Json<CreateCustomerRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let customer = state.services.parties.create_customer(request).await?;
    Ok((StatusCode::CREATED, Json(customer)))
}

async fn get_customer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let customer = state.services.parties.get_customer(id).await?;
    Ok(Json(customer))
}

async fn list_customers(
    State(state): State<AppState>,
    Query(query): Query<ListCustomersQuery>,
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
        .list_customers(&filters, pagination.page, pagination.per_page)
        .await?;
    Ok(Json(PaginatedResponse::new(items, total, pagination)))
}

async fn update_customer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateCustomerRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let customer = state.services.parties.update_customer(id, request).await?;
    Ok(Json(customer))
}

async fn get_customer_balance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let balances = state.services.parties.customer_balances(id).await?;
    Ok(Json(balances))
}

async fn check_customer_credit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<CreditCheckQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let check = state
        .services
        .parties
        .check_customer_credit(id, query.amount)
        .await?;
    Ok(Json(check))
}

async fn recalculate_customer_balance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let result = state.services.parties.recalculate_customer(id).await?;
    Ok(Json(result))
}

pub fn customer_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_customer).get(list_customers))
        .route("/:id", get(get_customer).put(update_customer))
        .route("/:id/balance", get(get_customer_balance))
        .route("/:id/credit-check", get(check_customer_credit))
        .route("/:id/recalculate", post(recalculate_customer_balance))
}
