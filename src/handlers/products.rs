use super::{AppState, Pagination};
use crate::entities::product::ProductStatus;
use crate::errors::ServiceError;
use crate::services::products::{CreateProductRequest, ProductFilters, UpdateProductRequest};
use crate::PaginatedResponse;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ListProductsQuery {
    #[serde(default = "super::default_page")]
    pub page: u64,
    #[serde(default = "super::default_per_page")]
    pub per_page: u64,
    pub status: Option<ProductStatus>,
    pub category: Option<String>,
    pub search: Option<String>,
}

async fn create_product(
    State(state): State<AppState>,
    Json(request): Json<CreateProductRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let product = state.services.products.create_product(request).await?;
    Ok((StatusCode::CREATED, Json(product)))
}

async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let product = state.services.products.get_product(id).await?;
    Ok(Json(product))
}

async fn list_products(
    State(state): State<AppState>,
    Query(query): Query<ListProductsQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let pagination = Pagination {
        page: query.page,
        per_page: query.per_page,
    }
    .clamped(state.config.api_max_page_size as u64);
    let filters = ProductFilters {
        status: query.status,
        category: query.category,
        search: query.search,
    };
    let (items, total) = state
        .services
        .products
        .list_products(&filters, pagination.page, pagination.per_page)
        .await?;
    Ok(Json(PaginatedResponse::new(items, total, pagination)))
}

async fn update_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateProductRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let product = state.services.products.update_product(id, request).await?;
    Ok(Json(product))
}

pub fn product_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_product).get(list_products))
        .route("/:id", get(get_product).put(update_product))
}
