use crate::{
    db::DbPool,
    entities::{
        customer::{self, PartyStatus},
        supplier,
    },
    errors::ServiceError,
    services::balance::{
        BalanceRecalculation, CreditCheck, PartyBalanceService, PartyBalances, PartyRef,
    },
};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use prometheus::IntCounter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

lazy_static! {
    static ref CUSTOMERS_CREATED: IntCounter = IntCounter::new(
        "customers_created_total",
        "Total number of customers created"
    )
    .expect("metric can be created");
    static ref SUPPLIERS_CREATED: IntCounter = IntCounter::new(
        "suppliers_created_total",
        "Total number of suppliers created"
    )
    .expect("metric can be created");
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateCustomerRequest {
    #[validate(length(min = 1, message = "Name cannot be empty"))]
    pub name: String,
    #[validate(email(message = "Invalid email address"))]
    pub email: Option<String>,
    pub phone: Option<String>,
    pub credit_limit: Option<Decimal>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct UpdateCustomerRequest {
    #[validate(length(min = 1, message = "Name cannot be empty"))]
    pub name: Option<String>,
    #[validate(email(message = "Invalid email address"))]
    pub email: Option<String>,
    pub phone: Option<String>,
    pub credit_limit: Option<Decimal>,
    pub status: Option<PartyStatus>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateSupplierRequest {
    #[validate(length(min = 1, message = "Name cannot be empty"))]
    pub name: String,
    pub company_name: Option<String>,
    #[validate(email(message = "Invalid email address"))]
    pub email: Option<String>,
    pub phone: Option<String>,
    pub credit_limit: Option<Decimal>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct UpdateSupplierRequest {
    #[validate(length(min = 1, message = "Name cannot be empty"))]
    pub name: Option<String>,
    pub company_name: Option<String>,
    #[validate(email(message = "Invalid email address"))]
    pub email: Option<String>,
    pub phone: Option<String>,
    pub credit_limit: Option<Decimal>,
    pub status: Option<PartyStatus>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct PartyFilters {
    pub status: Option<PartyStatus>,
    /// Substring match on the party name.
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CustomerResponse {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub pending_balance: Decimal,
    pub current_balance: Decimal,
    pub advance_balance: Decimal,
    pub credit_limit: Decimal,
    /// Credit headroom left before the posted balance hits the limit.
    pub available_credit: Decimal,
    pub status: PartyStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<customer::Model> for CustomerResponse {
    fn from(model: customer::Model) -> Self {
        Self {
            id: model.id,
            name: model.name,
            email: model.email,
            phone: model.phone,
            pending_balance: model.pending_balance,
            current_balance: model.current_balance,
            advance_balance: model.advance_balance,
            credit_limit: model.credit_limit,
            available_credit: model.credit_limit - model.current_balance,
            status: model.status,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SupplierResponse {
    pub id: Uuid,
    pub name: String,
    pub company_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub pending_balance: Decimal,
    pub current_balance: Decimal,
    pub advance_balance: Decimal,
    pub credit_limit: Decimal,
    pub available_credit: Decimal,
    pub status: PartyStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<supplier::Model> for SupplierResponse {
    fn from(model: supplier::Model) -> Self {
        Self {
            id: model.id,
            name: model.name,
            company_name: model.company_name,
            email: model.email,
            phone: model.phone,
            pending_balance: model.pending_balance,
            current_balance: model.current_balance,
            advance_balance: model.advance_balance,
            credit_limit: model.credit_limit,
            available_credit: model.credit_limit - model.current_balance,
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

/// Master data for the two party sides. Balance figures on the rows are owned
/// by the balance service; this service only ever reads them.
#[derive(Clone)]
pub struct PartyService {
    db_pool: Arc<DbPool>,
    balance: PartyBalanceService,
}

impl PartyService {
    pub fn new(db_pool: Arc<DbPool>, balance: PartyBalanceService) -> Self {
        Self { db_pool, balance }
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_customer(
        &self,
        request: CreateCustomerRequest,
    ) -> Result<CustomerResponse, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;
        let credit_limit = request.credit_limit.unwrap_or(Decimal::ZERO);
        require_non_negative("Credit limit", credit_limit)?;

        let now = Utc::now();
        let model = customer::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(request.name.trim().to_string()),
            email: Set(request.email),
            phone: Set(request.phone),
            pending_balance: Set(Decimal::ZERO),
            current_balance: Set(Decimal::ZERO),
            advance_balance: Set(Decimal::ZERO),
            credit_limit: Set(credit_limit),
            status: Set(PartyStatus::Active),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db_pool)
        .await
        .map_err(ServiceError::DatabaseError)?;

        CUSTOMERS_CREATED.inc();
        info!(customer_id = %model.id, "Customer created");
        Ok(model.into())
    }

    pub async fn get_customer(&self, id: Uuid) -> Result<CustomerResponse, ServiceError> {
        let model = customer::Entity::find_by_id(id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("Customer {} not found", id)))?;
        Ok(model.into())
    }

    pub async fn list_customers(
        &self,
        filters: &PartyFilters,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<CustomerResponse>, u64), ServiceError> {
        let mut query = customer::Entity::find().order_by_asc(customer::Column::Name);
        if let Some(status) = filters.status {
            query = query.filter(customer::Column::Status.eq(status));
        }
        if let Some(search) = &filters.search {
            query = query.filter(customer::Column::Name.contains(search));
        }

        let paginator = query.paginate(&*self.db_pool, per_page);
        let total = paginator
            .num_items()
            .await
            .map_err(ServiceError::DatabaseError)?;
        let customers = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::DatabaseError)?;

        Ok((customers.into_iter().map(Into::into).collect(), total))
    }

    #[instrument(skip(self, request), fields(customer_id = %id))]
    pub async fn update_customer(
        &self,
        id: Uuid,
        request: UpdateCustomerRequest,
    ) -> Result<CustomerResponse, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;
        if let Some(credit_limit) = request.credit_limit {
            require_non_negative("Credit limit", credit_limit)?;
        }

        let model = customer::Entity::find_by_id(id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("Customer {} not found", id)))?;

        let mut active: customer::ActiveModel = model.into();
        if let Some(name) = request.name {
            active.name = Set(name.trim().to_string());
        }
        if let Some(email) = request.email {
            active.email = Set(Some(email));
        }
        if let Some(phone) = request.phone {
            active.phone = Set(Some(phone));
        }
        if let Some(credit_limit) = request.credit_limit {
            active.credit_limit = Set(credit_limit);
        }
        if let Some(status) = request.status {
            active.status = Set(status);
        }
        active.updated_at = Set(Utc::now());

        let updated = active
            .update(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)?;
        info!(customer_id = %id, "Customer updated");
        Ok(updated.into())
    }

    pub async fn customer_balances(&self, id: Uuid) -> Result<PartyBalances, ServiceError> {
        self.balance
            .get_balances(&*self.db_pool, PartyRef::customer(id))
            .await
    }

    /// Previews whether a charge of `amount` would pass the credit gate.
    /// Never mutates anything; document creation repeats the check inside its
    /// own flow.
    pub async fn check_customer_credit(
        &self,
        id: Uuid,
        amount: Decimal,
    ) -> Result<CreditCheck, ServiceError> {
        require_non_negative("Amount", amount)?;
        self.balance
            .can_accept_charge(&*self.db_pool, PartyRef::customer(id), amount)
            .await
    }

    pub async fn recalculate_customer(
        &self,
        id: Uuid,
    ) -> Result<BalanceRecalculation, ServiceError> {
        self.balance
            .recalculate_balance(&self.db_pool, PartyRef::customer(id))
            .await
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_supplier(
        &self,
        request: CreateSupplierRequest,
    ) -> Result<SupplierResponse, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;
        let credit_limit = request.credit_limit.unwrap_or(Decimal::ZERO);
        require_non_negative("Credit limit", credit_limit)?;

        let now = Utc::now();
        let model = supplier::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(request.name.trim().to_string()),
            company_name: Set(request.company_name),
            email: Set(request.email),
            phone: Set(request.phone),
            pending_balance: Set(Decimal::ZERO),
            current_balance: Set(Decimal::ZERO),
            advance_balance: Set(Decimal::ZERO),
            credit_limit: Set(credit_limit),
            status: Set(PartyStatus::Active),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db_pool)
        .await
        .map_err(ServiceError::DatabaseError)?;

        SUPPLIERS_CREATED.inc();
        info!(supplier_id = %model.id, "Supplier created");
        Ok(model.into())
    }

    pub async fn get_supplier(&self, id: Uuid) -> Result<SupplierResponse, ServiceError> {
        let model = supplier::Entity::find_by_id(id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("Supplier {} not found", id)))?;
        Ok(model.into())
    }

    pub async fn list_suppliers(
        &self,
        filters: &PartyFilters,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<SupplierResponse>, u64), ServiceError> {
        let mut query = supplier::Entity::find().order_by_asc(supplier::Column::Name);
        if let Some(status) = filters.status {
            query = query.filter(supplier::Column::Status.eq(status));
        }
        if let Some(search) = &filters.search {
            query = query.filter(supplier::Column::Name.contains(search));
        }

        let paginator = query.paginate(&*self.db_pool, per_page);
        let total = paginator
            .num_items()
            .await
            .map_err(ServiceError::DatabaseError)?;
        let suppliers = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::DatabaseError)?;

        Ok((suppliers.into_iter().map(Into::into).collect(), total))
    }

    #[instrument(skip(self, request), fields(supplier_id = %id))]
    pub async fn update_supplier(
        &self,
        id: Uuid,
        request: UpdateSupplierRequest,
    ) -> Result<SupplierResponse, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;
        if let Some(credit_limit) = request.credit_limit {
            require_non_negative("Credit limit", credit_limit)?;
        }

        let model = supplier::Entity::find_by_id(id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("Supplier {} not found", id)))?;

        let mut active: supplier::ActiveModel = model.into();
        if let Some(name) = request.name {
            active.name = Set(name.trim().to_string());
        }
        if let Some(company_name) = request.company_name {
            active.company_name = Set(Some(company_name));
        }
        if let Some(email) = request.email {
            active.email = Set(Some(email));
        }
        if let Some(phone) = request.phone {
            active.phone = Set(Some(phone));
        }
        if let Some(credit_limit) = request.credit_limit {
            active.credit_limit = Set(credit_limit);
        }
        if let Some(status) = request.status {
            active.status = Set(status);
        }
        active.updated_at = Set(Utc::now());

        let updated = active
            .update(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)?;
        info!(supplier_id = %id, "Supplier updated");
        Ok(updated.into())
    }

    pub async fn supplier_balances(&self, id: Uuid) -> Result<PartyBalances, ServiceError> {
        self.balance
            .get_balances(&*self.db_pool, PartyRef::supplier(id))
            .await
    }

    pub async fn check_supplier_credit(
        &self,
        id: Uuid,
        amount: Decimal,
    ) -> Result<CreditCheck, ServiceError> {
        require_non_negative("Amount", amount)?;
        self.balance
            .can_accept_charge(&*self.db_pool, PartyRef::supplier(id), amount)
            .await
    }

    pub async fn recalculate_supplier(
        &self,
        id: Uuid,
    ) -> Result<BalanceRecalculation, ServiceError> {
        self.balance
            .recalculate_balance(&self.db_pool, PartyRef::supplier(id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn negative_credit_limit_is_rejected() {
        let err = require_non_negative("Credit limit", dec!(-1)).unwrap_err();
        assert!(matches!(err, ServiceError::ValidationError(_)));
        assert!(require_non_negative("Credit limit", dec!(0)).is_ok());
    }

    #[test]
    fn available_credit_reflects_posted_balance() {
        let model = customer::Model {
            id: Uuid::new_v4(),
            name: "Acme Stores".to_string(),
            email: None,
            phone: None,
            pending_balance: dec!(120),
            current_balance: dec!(300),
            advance_balance: dec!(0),
            credit_limit: dec!(1000),
            status: PartyStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let response = CustomerResponse::from(model);
        assert_eq!(response.available_credit, dec!(700));
    }
}
