use crate::{
    db::DbPool,
    entities::product::{self, ProductStatus},
    errors::ServiceError,
};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use prometheus::IntCounter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

lazy_static! {
    static ref PRODUCTS_CREATED: IntCounter = IntCounter::new(
        "products_created_total",
        "Total number of products created"
    )
    .expect("metric can be created");
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateProductRequest {
    #[validate(length(min = 1, message = "Sku cannot be empty"))]
    pub sku: String,
    #[validate(length(min = 1, message = "Name cannot be empty"))]
    pub name: String,
    pub category: Option<String>,
    pub unit_price: Decimal,
    pub unit_cost: Decimal,
}

/// Patch-style update. The sku is fixed at creation; it is the product's
/// external identity and documents snapshot against it.
#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct UpdateProductRequest {
    #[validate(length(min = 1, message = "Name cannot be empty"))]
    pub name: Option<String>,
    pub category: Option<String>,
    pub unit_price: Option<Decimal>,
    pub unit_cost: Option<Decimal>,
    pub status: Option<ProductStatus>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct ProductFilters {
    pub status: Option<ProductStatus>,
    pub category: Option<String>,
    /// Substring match on name or sku.
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProductResponse {
    pub id: Uuid,
    pub sku: String,
    pub name: String,
    pub category: Option<String>,
    pub unit_price: Decimal,
    pub unit_cost: Decimal,
    pub current_stock: Decimal,
    pub status: ProductStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<product::Model> for ProductResponse {
    fn from(model: product::Model) -> Self {
        Self {
            id: model.id,
            sku: model.sku,
            name: model.name,
            category: model.category,
            unit_price: model.unit_price,
            unit_cost: model.unit_cost,
            current_stock: model.current_stock,
            status: model.status,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

fn require_non_negative(label: &str, amount: Decimal) -> Result<(), ServiceError> {
    if amount < Decimal::ZERO {
        return Err(ServiceError::ValidationError(format!(
            "{} cannot be negative",
            label
        )));
    }
    Ok(())
}

/// Catalog service. Stock figures on the product row are a cache owned by the
/// stock service; creation starts them at zero and movements maintain them.
#[derive(Clone)]
pub struct ProductService {
    db_pool: Arc<DbPool>,
}

impl ProductService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    #[instrument(skip(self, request), fields(sku = %request.sku))]
    pub async fn create_product(
        &self,
        request: CreateProductRequest,
    ) -> Result<ProductResponse, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;
        require_non_negative("Unit price", request.unit_price)?;
        require_non_negative("Unit cost", request.unit_cost)?;

        let sku = request.sku.trim().to_string();
        let existing = product::Entity::find()
            .filter(product::Column::Sku.eq(sku.clone()))
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)?;
        if existing.is_some() {
            return Err(ServiceError::Conflict(format!(
                "Product with sku {} already exists",
                sku
            )));
        }

        let now = Utc::now();
        let model = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            sku: Set(sku),
            name: Set(request.name.trim().to_string()),
            category: Set(request.category),
            unit_price: Set(request.unit_price),
            unit_cost: Set(request.unit_cost),
            current_stock: Set(Decimal::ZERO),
            status: Set(ProductStatus::Active),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db_pool)
        .await
        .map_err(ServiceError::DatabaseError)?;

        PRODUCTS_CREATED.inc();
        info!(product_id = %model.id, sku = %model.sku, "Product created");
        Ok(model.into())
    }

    pub async fn get_product(&self, id: Uuid) -> Result<ProductResponse, ServiceError> {
        let model = product::Entity::find_by_id(id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", id)))?;
        Ok(model.into())
    }

    pub async fn list_products(
        &self,
        filters: &ProductFilters,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<ProductResponse>, u64), ServiceError> {
        let mut query = product::Entity::find().order_by_asc(product::Column::Name);
        if let Some(status) = filters.status {
            query = query.filter(product::Column::Status.eq(status));
        }
        if let Some(category) = &filters.category {
            query = query.filter(product::Column::Category.eq(category.clone()));
        }
        if let Some(search) = &filters.search {
            query = query.filter(
                Condition::any()
                    .add(product::Column::Name.contains(search))
                    .add(product::Column::Sku.contains(search)),
            );
        }

        let paginator = query.paginate(&*self.db_pool, per_page);
        let total = paginator
            .num_items()
            .await
            .map_err(ServiceError::DatabaseError)?;
        let products = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::DatabaseError)?;

        Ok((products.into_iter().map(Into::into).collect(), total))
    }

    #[instrument(skip(self, request), fields(product_id = %id))]
    pub async fn update_product(
        &self,
        id: Uuid,
        request: UpdateProductRequest,
    ) -> Result<ProductResponse, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;
        if let Some(unit_price) = request.unit_price {
            require_non_negative("Unit price", unit_price)?;
        }
        if let Some(unit_cost) = request.unit_cost {
            require_non_negative("Unit cost", unit_cost)?;
        }

        let model = product::Entity::find_by_id(id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", id)))?;

        let mut active: product::ActiveModel = model.into();
        if let Some(name) = request.name {
            active.name = Set(name.trim().to_string());
        }
        if let Some(category) = request.category {
            active.category = Set(Some(category));
        }
        if let Some(unit_price) = request.unit_price {
            active.unit_price = Set(unit_price);
        }
        if let Some(unit_cost) = request.unit_cost {
            active.unit_cost = Set(unit_cost);
        }
        if let Some(status) = request.status {
            active.status = Set(status);
        }
        active.updated_at = Set(Utc::now());

        let updated = active
            .update(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)?;
        info!(product_id = %id, "Product updated");
        Ok(updated.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn negative_prices_are_rejected() {
        assert!(require_non_negative("Unit price", dec!(0)).is_ok());
        let err = require_non_negative("Unit cost", dec!(-0.01)).unwrap_err();
        assert!(matches!(err, ServiceError::ValidationError(_)));
    }
}
