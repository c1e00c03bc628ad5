use super::{actor_from_headers, AppState, Pagination};
use crate::entities::stock_movement::MovementType;
use crate::errors::ServiceError;
use crate::services::stock::StockUpdateInput;
use crate::PaginatedResponse;
use axum::{
    extract::{Json, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize)]
pub struct StockListQuery {
    #[serde(default = "super::default_page")]
    pub page: u64,
    #[serde(default = "super::default_per_page")]
    pub per_page: u64,
}

#[derive(Debug, Deserialize)]
pub struct LowStockQuery {
    pub threshold: Option<Decimal>,
}

/// Manual stock correction. `quantity` is the absolute amount moved; the
/// movement type decides the direction.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct AdjustStockRequest {
    pub product_id: Uuid,
    pub movement_type: MovementType,
    pub quantity: Decimal,
    /// Unit cost for stock-in adjustments; shifts the weighted average.
    pub unit_cost: Option<Decimal>,
    #[validate(length(min = 1, message = "Reason cannot be empty"))]
    pub reason: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DamageRequest {
    pub product_id: Uuid,
    pub quantity: Decimal,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ReservationRequest {
    pub product_id: Uuid,
    pub quantity: Decimal,
}

async fn list_stock(
    State(state): State<AppState>,
    Query(query): Query<StockListQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let pagination = Pagination {
        page: query.page,
        per_page: query.per_page,
    }
    .clamped(state.config.api_max_page_size as u64);
    let (items, total) = state
        .services
        .stock
        .list_stock(pagination.page, pagination.per_page)
        .await?;
    Ok(Json(PaginatedResponse::new(items, total, pagination)))
}

async fn get_stock(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let record = state
        .services
        .stock
        .get_stock(product_id)
        .await?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("No stock record for product {}", product_id))
        })?;
    Ok(Json(record))
}

async fn list_low_stock(
    State(state): State<AppState>,
    Query(query): Query<LowStockQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let threshold = query.threshold.unwrap_or(dec!(10));
    let records = state.services.stock.list_low_stock(threshold).await?;
    Ok(Json(records))
}

async fn adjust_stock(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AdjustStockRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    request
        .validate()
        .map_err(|e| ServiceError::ValidationError(e.to_string()))?;
    let result = state
        .services
        .stock
        .update_stock(StockUpdateInput {
            product_id: request.product_id,
            movement_type: request.movement_type,
            quantity: request.quantity,
            unit_cost: request.unit_cost,
            reason: request.reason,
            reference_type: None,
            reference_id: None,
            performed_by: actor_from_headers(&headers),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(result)))
}

async fn record_damage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DamageRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let result = state
        .services
        .stock
        .record_damage(
            request.product_id,
            request.quantity,
            request.reason,
            actor_from_headers(&headers),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(result)))
}

async fn reserve_stock(
    State(state): State<AppState>,
    Json(request): Json<ReservationRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let record = state
        .services
        .stock
        .reserve_stock(request.product_id, request.quantity)
        .await?;
    Ok(Json(record))
}

async fn release_stock(
    State(state): State<AppState>,
    Json(request): Json<ReservationRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let record = state
        .services
        .stock
        .release_stock(request.product_id, request.quantity)
        .await?;
    Ok(Json(record))
}

async fn list_movements(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    Query(query): Query<StockListQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let pagination = Pagination {
        page: query.page,
        per_page: query.per_page,
    }
    .clamped(state.config.api_max_page_size as u64);
    let (items, total) = state
        .services
        .stock
        .list_movements(product_id, pagination.page, pagination.per_page)
        .await?;
    Ok(Json(PaginatedResponse::new(items, total, pagination)))
}

pub fn inventory_routes() -> Router<AppState> {
    Router::new()
        .route("/stock", get(list_stock))
        .route("/stock/:product_id", get(get_stock))
        .route("/stock/:product_id/movements", get(list_movements))
        .route("/low-stock", get(list_low_stock))
        .route("/adjustments", post(adjust_stock))
        .route("/damage", post(record_damage))
        .route("/reserve", post(reserve_stock))
        .route("/release", post(release_stock))
}
