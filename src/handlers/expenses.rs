use super::{actor_from_headers, AppState, Pagination};
use crate::errors::ServiceError;
use crate::services::expenses::{
    CreateExpenseRequest, ExpenseFilters, RecordExpensePaymentRequest, UpdateExpenseRequest,
};
use crate::PaginatedResponse;
use axum::{
    extract::{Json, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ListExpensesQuery {
    #[serde(default = "super::default_page")]
    pub page: u64,
    #[serde(default = "super::default_per_page")]
    pub per_page: u64,
    pub active: Option<bool>,
    pub supplier_id: Option<Uuid>,
    pub due_before: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct ListPaymentsQuery {
    #[serde(default = "super::default_page")]
    pub page: u64,
    #[serde(default = "super::default_per_page")]
    pub per_page: u64,
}

async fn create_expense(
    State(state): State<AppState>,
    Json(request): Json<CreateExpenseRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let expense = state.services.expenses.create_expense(request).await?;
    Ok((StatusCode::CREATED, Json(expense)))
}

async fn get_expense(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let expense = state.services.expenses.get_expense(id).await?;
    Ok(Json(expense))
}

async fn list_expenses(
    State(state): State<AppState>,
    Query(query): Query<ListExpensesQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let pagination = Pagination {
        page: query.page,
        per_page: query.per_page,
    }
    .clamped(state.config.api_max_page_size as u64);
    let filters = ExpenseFilters {
        active: query.active,
        supplier_id: query.supplier_id,
        due_before: query.due_before,
    };
    let (items, total) = state
        .services
        .expenses
        .list_expenses(filters, pagination.page, pagination.per_page)
        .await?;
    Ok(Json(PaginatedResponse::new(items, total, pagination)))
}

async fn update_expense(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateExpenseRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let expense = state.services.expenses.update_expense(id, request).await?;
    Ok(Json(expense))
}

async fn deactivate_expense(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let expense = state.services.expenses.deactivate_expense(id).await?;
    Ok(Json(expense))
}

async fn record_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<RecordExpensePaymentRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let actor = actor_from_headers(&headers);
    let payment = state
        .services
        .expenses
        .record_payment(id, request, &actor)
        .await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

async fn list_payments(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListPaymentsQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let pagination = Pagination {
        page: query.page,
        per_page: query.per_page,
    }
    .clamped(state.config.api_max_page_size as u64);
    let (items, total) = state
        .services
        .expenses
        .list_payments(id, pagination.page, pagination.per_page)
        .await?;
    Ok(Json(PaginatedResponse::new(items, total, pagination)))
}

pub fn expense_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_expense).get(list_expenses))
        .route("/:id", get(get_expense).put(update_expense))
        .route("/:id/deactivate", post(deactivate_expense))
        .route("/:id/payments", post(record_payment).get(list_payments))
}
