use crate::{
    db::DbPool,
    entities::{
        expense_payment,
        recurring_expense::{self, ExpenseFrequency},
        sales_order::PaymentMethod,
        supplier,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        accounting::AccountingService,
        balance::{BalanceBucket, PartyBalanceService, PartyRef},
    },
};
use chrono::{DateTime, NaiveDate, Utc};
use lazy_static::lazy_static;
use prometheus::IntCounter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

lazy_static! {
    static ref EXPENSES_CREATED: IntCounter = IntCounter::new(
        "recurring_expenses_created_total",
        "Total number of recurring expenses created"
    )
    .expect("metric can be created");
    static ref EXPENSE_PAYMENTS_RECORDED: IntCounter = IntCounter::new(
        "expense_payments_recorded_total",
        "Total number of expense payments recorded"
    )
    .expect("metric can be created");
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateExpenseRequest {
    #[validate(length(min = 1, message = "Expense name cannot be empty"))]
    pub name: String,
    pub category: Option<String>,
    pub amount: Decimal,
    pub frequency: ExpenseFrequency,
    /// Links the expense to a supplier; payments then flow through the
    /// supplier's balance as a charge immediately settled.
    pub supplier_id: Option<Uuid>,
    pub next_due_date: NaiveDate,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateExpenseRequest {
    pub name: Option<String>,
    pub category: Option<String>,
    pub amount: Option<Decimal>,
    pub frequency: Option<ExpenseFrequency>,
    pub next_due_date: Option<NaiveDate>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RecordExpensePaymentRequest {
    /// Defaults to the expense's recurring amount.
    pub amount: Option<Decimal>,
    pub payment_method: PaymentMethod,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ExpenseFilters {
    pub active: Option<bool>,
    pub supplier_id: Option<Uuid>,
    /// Only expenses due on or before this date.
    pub due_before: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ExpenseResponse {
    pub id: Uuid,
    pub name: String,
    pub category: Option<String>,
    pub amount: Decimal,
    pub frequency: ExpenseFrequency,
    pub supplier_id: Option<Uuid>,
    pub next_due_date: NaiveDate,
    pub is_active: bool,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ExpensePaymentResponse {
    pub id: Uuid,
    pub expense_id: Uuid,
    pub amount: Decimal,
    pub payment_method: PaymentMethod,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub notes: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    /// Due date the expense carries after this payment.
    pub next_due_date: NaiveDate,
}

fn validate_period(
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<(), ServiceError> {
    if let (Some(start), Some(end)) = (start, end) {
        if start > end {
            return Err(ServiceError::ValidationError(
                "Period start cannot be after period end".to_string(),
            ));
        }
    }
    Ok(())
}

fn expense_response(model: recurring_expense::Model) -> ExpenseResponse {
    ExpenseResponse {
        id: model.id,
        name: model.name,
        category: model.category,
        amount: model.amount,
        frequency: model.frequency,
        supplier_id: model.supplier_id,
        next_due_date: model.next_due_date,
        is_active: model.is_active,
        notes: model.notes,
        created_at: model.created_at,
        updated_at: model.updated_at,
    }
}

fn payment_response(
    model: expense_payment::Model,
    next_due_date: NaiveDate,
) -> ExpensePaymentResponse {
    ExpensePaymentResponse {
        id: model.id,
        expense_id: model.expense_id,
        amount: model.amount,
        payment_method: model.payment_method,
        period_start: model.period_start,
        period_end: model.period_end,
        notes: model.notes,
        created_by: model.created_by,
        created_at: model.created_at,
        next_due_date,
    }
}

/// Manages recurring expenses and their payments. Paying an expense advances
/// its due date by one period; a supplier-linked expense additionally charges
/// and immediately settles the supplier's pending balance so both flows are
/// on the record while the net stays zero.
#[derive(Clone)]
pub struct ExpenseService {
    db_pool: Arc<DbPool>,
    balance: PartyBalanceService,
    accounting: AccountingService,
    event_sender: Option<Arc<EventSender>>,
}

impl ExpenseService {
    pub fn new(
        db_pool: Arc<DbPool>,
        balance: PartyBalanceService,
        accounting: AccountingService,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db_pool,
            balance,
            accounting,
            event_sender,
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "Failed to send expense event");
            }
        }
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_expense(
        &self,
        request: CreateExpenseRequest,
    ) -> Result<ExpenseResponse, ServiceError> {
        request.validate()?;
        if request.amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Expense amount must be positive".to_string(),
            ));
        }

        let db = &*self.db_pool;
        if let Some(supplier_id) = request.supplier_id {
            supplier::Entity::find_by_id(supplier_id)
                .one(db)
                .await
                .map_err(ServiceError::DatabaseError)?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Supplier {} not found", supplier_id))
                })?;
        }

        let now = Utc::now();
        let model = recurring_expense::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(request.name),
            category: Set(request.category),
            amount: Set(request.amount),
            frequency: Set(request.frequency),
            supplier_id: Set(request.supplier_id),
            next_due_date: Set(request.next_due_date),
            is_active: Set(true),
            notes: Set(request.notes),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await
        .map_err(ServiceError::DatabaseError)?;

        EXPENSES_CREATED.inc();
        info!(
            expense_id = %model.id,
            name = %model.name,
            amount = %model.amount,
            frequency = %model.frequency,
            "Recurring expense created"
        );
        Ok(expense_response(model))
    }

    pub async fn get_expense(&self, id: Uuid) -> Result<ExpenseResponse, ServiceError> {
        let model = self.require_expense(id).await?;
        Ok(expense_response(model))
    }

    pub async fn list_expenses(
        &self,
        filters: ExpenseFilters,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<ExpenseResponse>, u64), ServiceError> {
        let db = &*self.db_pool;
        let mut query = recurring_expense::Entity::find()
            .order_by_asc(recurring_expense::Column::NextDueDate);
        if let Some(active) = filters.active {
            query = query.filter(recurring_expense::Column::IsActive.eq(active));
        }
        if let Some(supplier_id) = filters.supplier_id {
            query = query.filter(recurring_expense::Column::SupplierId.eq(supplier_id));
        }
        if let Some(due_before) = filters.due_before {
            query = query.filter(recurring_expense::Column::NextDueDate.lte(due_before));
        }

        let paginator = query.paginate(db, per_page);
        let total = paginator
            .num_items()
            .await
            .map_err(ServiceError::DatabaseError)?;
        let expenses = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::DatabaseError)?;

        Ok((expenses.into_iter().map(expense_response).collect(), total))
    }

    #[instrument(skip(self, request), fields(expense_id = %id))]
    pub async fn update_expense(
        &self,
        id: Uuid,
        request: UpdateExpenseRequest,
    ) -> Result<ExpenseResponse, ServiceError> {
        let db = &*self.db_pool;
        let model = self.require_expense(id).await?;

        if let Some(name) = &request.name {
            if name.is_empty() {
                return Err(ServiceError::ValidationError(
                    "Expense name cannot be empty".to_string(),
                ));
            }
        }
        if let Some(amount) = request.amount {
            if amount <= Decimal::ZERO {
                return Err(ServiceError::ValidationError(
                    "Expense amount must be positive".to_string(),
                ));
            }
        }

        let mut active: recurring_expense::ActiveModel = model.into();
        if let Some(name) = request.name {
            active.name = Set(name);
        }
        if let Some(category) = request.category {
            active.category = Set(Some(category));
        }
        if let Some(amount) = request.amount {
            active.amount = Set(amount);
        }
        if let Some(frequency) = request.frequency {
            active.frequency = Set(frequency);
        }
        if let Some(next_due_date) = request.next_due_date {
            active.next_due_date = Set(next_due_date);
        }
        if let Some(notes) = request.notes {
            active.notes = Set(Some(notes));
        }
        active.updated_at = Set(Utc::now());

        let updated = active.update(db).await.map_err(ServiceError::DatabaseError)?;
        info!(expense_id = %updated.id, "Recurring expense updated");
        Ok(expense_response(updated))
    }

    /// Turns the expense off; further payments are rejected until it is
    /// reactivated by an update with a fresh due date.
    #[instrument(skip(self), fields(expense_id = %id))]
    pub async fn deactivate_expense(&self, id: Uuid) -> Result<ExpenseResponse, ServiceError> {
        let db = &*self.db_pool;
        let model = self.require_expense(id).await?;
        if !model.is_active {
            return Ok(expense_response(model));
        }

        let mut active: recurring_expense::ActiveModel = model.into();
        active.is_active = Set(false);
        active.updated_at = Set(Utc::now());
        let updated = active.update(db).await.map_err(ServiceError::DatabaseError)?;

        info!(expense_id = %updated.id, name = %updated.name, "Recurring expense deactivated");
        Ok(expense_response(updated))
    }

    /// Records a payment: the payment row and the due-date advance commit
    /// together, and a supplier-linked expense runs the charge and its
    /// settlement against the supplier in the same transaction.
    #[instrument(skip(self, request), fields(expense_id = %id))]
    pub async fn record_payment(
        &self,
        id: Uuid,
        request: RecordExpensePaymentRequest,
        actor: &str,
    ) -> Result<ExpensePaymentResponse, ServiceError> {
        validate_period(request.period_start, request.period_end)?;

        let expense = self.require_expense(id).await?;
        if !expense.is_active {
            return Err(ServiceError::ValidationError(format!(
                "Expense {} is inactive",
                expense.name
            )));
        }
        let amount = request.amount.unwrap_or(expense.amount);
        if amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Payment amount must be positive".to_string(),
            ));
        }

        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;

        let payment = expense_payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            expense_id: Set(expense.id),
            amount: Set(amount),
            payment_method: Set(request.payment_method),
            period_start: Set(request.period_start),
            period_end: Set(request.period_end),
            notes: Set(request.notes.clone()),
            created_by: Set(actor.to_string()),
            created_at: Set(Utc::now()),
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::DatabaseError)?;

        let next_due = expense.frequency.advance(expense.next_due_date);
        let mut active: recurring_expense::ActiveModel = expense.clone().into();
        active.next_due_date = Set(next_due);
        active.updated_at = Set(Utc::now());
        active
            .update(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;

        // The charge and its settlement cancel out, leaving the supplier's
        // figures untouched while both moves hit the audit log.
        if let Some(supplier_id) = expense.supplier_id {
            let party = PartyRef::supplier(supplier_id);
            self.balance.record_charge(&txn, party, amount).await?;
            self.balance
                .record_payment(&txn, party, amount, amount, BalanceBucket::Pending)
                .await?;
        }

        txn.commit().await.map_err(ServiceError::DatabaseError)?;

        EXPENSE_PAYMENTS_RECORDED.inc();
        if let Err(e) = self
            .accounting
            .record_expense_payment(payment.id, &expense.name, amount, request.payment_method)
            .await
        {
            error!(payment_id = %payment.id, error = %e, "Failed to write accounting entries for expense payment");
        }
        self.emit(Event::ExpensePaymentRecorded {
            expense_id: expense.id,
            payment_id: payment.id,
            amount,
        })
        .await;
        info!(
            expense_id = %expense.id,
            payment_id = %payment.id,
            amount = %amount,
            next_due_date = %next_due,
            "Expense payment recorded"
        );

        Ok(payment_response(payment, next_due))
    }

    pub async fn list_payments(
        &self,
        expense_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<ExpensePaymentResponse>, u64), ServiceError> {
        let db = &*self.db_pool;
        let expense = self.require_expense(expense_id).await?;

        let paginator = expense_payment::Entity::find()
            .filter(expense_payment::Column::ExpenseId.eq(expense_id))
            .order_by_desc(expense_payment::Column::CreatedAt)
            .paginate(db, per_page);
        let total = paginator
            .num_items()
            .await
            .map_err(ServiceError::DatabaseError)?;
        let payments = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::DatabaseError)?;

        let responses = payments
            .into_iter()
            .map(|payment| payment_response(payment, expense.next_due_date))
            .collect();
        Ok((responses, total))
    }

    async fn require_expense(
        &self,
        id: Uuid,
    ) -> Result<recurring_expense::Model, ServiceError> {
        let db = &*self.db_pool;
        recurring_expense::Entity::find_by_id(id)
            .one(db)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("Expense {} not found", id)))
    }
}
