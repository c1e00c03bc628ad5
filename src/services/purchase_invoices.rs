use crate::{
    db::DbPool,
    entities::{
        customer::PartyStatus,
        product,
        purchase_invoice::{self, InvoiceStatus},
        purchase_invoice_item, purchase_return,
        sales_order::{PaymentMethod, PaymentStatus},
        stock_movement::MovementType,
        supplier,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        accounting::AccountingService,
        balance::{BalanceBucket, PartyBalanceService, PartyRef, PaymentSplit},
        compensation::{resolve_unwind, CompensationStack},
        document_number,
        stock::{InventoryStockService, StockUpdateInput},
    },
};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use prometheus::IntCounter;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

lazy_static! {
    static ref INVOICES_CREATED: IntCounter = IntCounter::new(
        "purchase_invoices_created_total",
        "Total number of purchase invoices created"
    )
    .expect("metric can be created");
    static ref INVOICES_CANCELLED: IntCounter = IntCounter::new(
        "purchase_invoices_cancelled_total",
        "Total number of purchase invoices cancelled"
    )
    .expect("metric can be created");
    static ref INVOICE_PAYMENTS_RECORDED: IntCounter = IntCounter::new(
        "purchase_invoice_payments_recorded_total",
        "Total number of payments recorded against purchase invoices"
    )
    .expect("metric can be created");
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InvoiceItemRequest {
    pub product_id: Uuid,
    pub quantity: Decimal,
    /// Overrides the catalog cost when set; this is the cost that feeds the
    /// weighted average.
    pub unit_cost: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreatePurchaseInvoiceRequest {
    pub supplier_id: Uuid,
    #[validate(length(min = 1, message = "Invoice must contain at least one item"))]
    pub items: Vec<InvoiceItemRequest>,
    pub payment_method: PaymentMethod,
    pub amount_paid: Option<Decimal>,
    /// Supplier invoices state their own discount and tax, taken as given.
    pub discount_total: Option<Decimal>,
    pub tax_total: Option<Decimal>,
    /// `draft` or `pending`; omitted means pending, or confirmed when fully paid.
    pub status: Option<InvoiceStatus>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct UpdatePurchaseInvoiceRequest {
    #[validate(length(min = 1, message = "Invoice must contain at least one item"))]
    pub items: Vec<InvoiceItemRequest>,
    pub discount_total: Option<Decimal>,
    pub tax_total: Option<Decimal>,
    pub notes: Option<String>,
    pub expected_version: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InvoicePaymentRequest {
    pub amount: Decimal,
    pub payment_method: Option<PaymentMethod>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InvoiceTransitionRequest {
    pub status: InvoiceStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct InvoiceFilters {
    pub supplier_id: Option<Uuid>,
    pub status: Option<InvoiceStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InvoiceItemResponse {
    pub id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub line_total: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PurchaseInvoiceResponse {
    pub id: Uuid,
    pub invoice_number: String,
    pub supplier_id: Uuid,
    pub status: InvoiceStatus,
    pub subtotal: Decimal,
    pub discount_total: Decimal,
    pub tax_total: Decimal,
    pub total_amount: Decimal,
    pub amount_paid: Decimal,
    pub remaining_balance: Decimal,
    pub payment_status: PaymentStatus,
    pub payment_method: PaymentMethod,
    pub notes: Option<String>,
    pub created_by: String,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub items: Vec<InvoiceItemResponse>,
}

#[derive(Debug, Clone)]
struct CostedLine {
    product_id: Uuid,
    product_name: String,
    quantity: Decimal,
    unit_cost: Decimal,
    line_total: Decimal,
}

#[derive(Debug, Clone, Copy)]
struct InvoiceTotals {
    subtotal: Decimal,
    discount_total: Decimal,
    tax_total: Decimal,
    total: Decimal,
}

fn allowed_transitions(from: InvoiceStatus) -> &'static [InvoiceStatus] {
    use InvoiceStatus::*;
    match from {
        Draft => &[Pending, Confirmed, Cancelled],
        Pending => &[Confirmed, Cancelled],
        Confirmed => &[Cancelled],
        Cancelled => &[],
    }
}

pub(crate) fn check_invoice_transition(
    from: InvoiceStatus,
    to: InvoiceStatus,
) -> Result<(), ServiceError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(ServiceError::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

fn cost_line(
    product: &product::Model,
    item: &InvoiceItemRequest,
) -> Result<CostedLine, ServiceError> {
    if item.quantity <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(format!(
            "Quantity for product {} must be positive",
            product.name
        )));
    }
    let unit_cost = item.unit_cost.unwrap_or(product.unit_cost);
    if unit_cost < Decimal::ZERO {
        return Err(ServiceError::ValidationError(format!(
            "Unit cost for product {} cannot be negative",
            product.name
        )));
    }
    Ok(CostedLine {
        product_id: product.id,
        product_name: product.name.clone(),
        quantity: item.quantity,
        unit_cost,
        line_total: (item.quantity * unit_cost).round_dp(4),
    })
}

fn invoice_totals(
    lines: &[CostedLine],
    discount_total: Decimal,
    tax_total: Decimal,
) -> Result<InvoiceTotals, ServiceError> {
    if discount_total < Decimal::ZERO || tax_total < Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "Discount and tax totals cannot be negative".to_string(),
        ));
    }
    let subtotal: Decimal = lines.iter().map(|l| l.line_total).sum();
    if discount_total > subtotal {
        return Err(ServiceError::ValidationError(format!(
            "Discount total {} exceeds the invoice subtotal {}",
            discount_total, subtotal
        )));
    }
    Ok(InvoiceTotals {
        subtotal,
        discount_total,
        tax_total,
        total: subtotal - discount_total + tax_total,
    })
}

fn ensure_unique_products(items: &[InvoiceItemRequest]) -> Result<(), ServiceError> {
    let mut seen = std::collections::HashSet::new();
    for item in items {
        if !seen.insert(item.product_id) {
            return Err(ServiceError::ValidationError(format!(
                "Product {} appears more than once; merge it into a single line",
                item.product_id
            )));
        }
    }
    Ok(())
}

fn model_to_response(
    invoice: purchase_invoice::Model,
    items: Vec<purchase_invoice_item::Model>,
) -> PurchaseInvoiceResponse {
    PurchaseInvoiceResponse {
        id: invoice.id,
        invoice_number: invoice.invoice_number,
        supplier_id: invoice.supplier_id,
        status: invoice.status,
        subtotal: invoice.subtotal,
        discount_total: invoice.discount_total,
        tax_total: invoice.tax_total,
        total_amount: invoice.total_amount,
        amount_paid: invoice.amount_paid,
        remaining_balance: invoice.remaining_balance,
        payment_status: invoice.payment_status,
        payment_method: invoice.payment_method,
        notes: invoice.notes,
        created_by: invoice.created_by,
        version: invoice.version,
        created_at: invoice.created_at,
        updated_at: invoice.updated_at,
        items: items
            .into_iter()
            .map(|item| InvoiceItemResponse {
                id: item.id,
                product_id: item.product_id,
                product_name: item.product_name,
                quantity: item.quantity,
                unit_cost: item.unit_cost,
                line_total: item.line_total,
            })
            .collect(),
    }
}

/// Mirror of the sales flow on the supplier side: goods come in at cost,
/// feeding the weighted average, and the balance moves run against the
/// supplier's payable buckets.
#[derive(Clone)]
pub struct PurchaseInvoiceService {
    db_pool: Arc<DbPool>,
    balance: PartyBalanceService,
    stock: InventoryStockService,
    accounting: AccountingService,
    event_sender: Option<Arc<EventSender>>,
}

impl PurchaseInvoiceService {
    pub fn new(
        db_pool: Arc<DbPool>,
        balance: PartyBalanceService,
        stock: InventoryStockService,
        accounting: AccountingService,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db_pool,
            balance,
            stock,
            accounting,
            event_sender,
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "Failed to send purchase invoice event");
            }
        }
    }

    #[instrument(skip(self, request), fields(supplier_id = %request.supplier_id))]
    pub async fn create_invoice(
        &self,
        request: CreatePurchaseInvoiceRequest,
        actor: &str,
    ) -> Result<PurchaseInvoiceResponse, ServiceError> {
        request.validate()?;
        ensure_unique_products(&request.items)?;

        let amount_paid = request.amount_paid.unwrap_or(Decimal::ZERO);
        if amount_paid < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Paid amount cannot be negative".to_string(),
            ));
        }
        let initial_status = match request.status {
            None => None,
            Some(InvoiceStatus::Draft) => {
                if amount_paid > Decimal::ZERO {
                    return Err(ServiceError::ValidationError(
                        "Draft invoices cannot take payment".to_string(),
                    ));
                }
                Some(InvoiceStatus::Draft)
            }
            Some(InvoiceStatus::Pending) => Some(InvoiceStatus::Pending),
            Some(other) => {
                return Err(ServiceError::ValidationError(format!(
                    "Invoices cannot be created as {}",
                    other
                )));
            }
        };

        let db = &*self.db_pool;
        let supplier = supplier::Entity::find_by_id(request.supplier_id)
            .one(db)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Supplier {} not found", request.supplier_id))
            })?;
        if supplier.status == PartyStatus::Inactive {
            return Err(ServiceError::ValidationError(format!(
                "Supplier {} is inactive",
                supplier.name
            )));
        }

        let products = self.load_products(&request.items).await?;
        let mut lines = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let product = products.get(&item.product_id).ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", item.product_id))
            })?;
            lines.push(cost_line(product, item)?);
        }
        let totals = invoice_totals(
            &lines,
            request.discount_total.unwrap_or(Decimal::ZERO),
            request.tax_total.unwrap_or(Decimal::ZERO),
        )?;
        let unpaid = (totals.total - amount_paid).max(Decimal::ZERO);

        if unpaid > Decimal::ZERO {
            let check = self
                .balance
                .can_accept_charge(db, PartyRef::supplier(supplier.id), unpaid)
                .await?;
            if !check.allowed {
                return Err(check.into_error());
            }
        }

        let invoice_id = Uuid::new_v4();
        let mut compensation = CompensationStack::new();
        for line in &lines {
            let moved = self
                .stock
                .update_stock(StockUpdateInput {
                    product_id: line.product_id,
                    movement_type: MovementType::In,
                    quantity: line.quantity,
                    unit_cost: Some(line.unit_cost),
                    reason: "purchase".to_string(),
                    reference_type: Some("purchase_invoice".to_string()),
                    reference_id: Some(invoice_id),
                    performed_by: actor.to_string(),
                })
                .await;
            match moved {
                Ok(_) => compensation.push(
                    format!("remove received stock for product {}", line.product_id),
                    StockUpdateInput {
                        product_id: line.product_id,
                        movement_type: MovementType::Out,
                        quantity: line.quantity,
                        unit_cost: None,
                        reason: "compensation".to_string(),
                        reference_type: Some("purchase_invoice".to_string()),
                        reference_id: Some(invoice_id),
                        performed_by: actor.to_string(),
                    },
                ),
                Err(err) => {
                    let failures = compensation.unwind(&self.stock).await;
                    return Err(resolve_unwind(err, failures));
                }
            }
        }

        let persisted = self
            .persist_new_invoice(
                invoice_id,
                &supplier,
                &request,
                lines,
                totals,
                amount_paid,
                initial_status,
                actor,
            )
            .await;
        let (invoice, items) = match persisted {
            Ok(pair) => pair,
            Err(err) => {
                let failures = compensation.unwind(&self.stock).await;
                return Err(resolve_unwind(err, failures));
            }
        };

        INVOICES_CREATED.inc();
        if let Err(e) = self
            .accounting
            .record_purchase(
                invoice.id,
                &invoice.invoice_number,
                invoice.total_amount,
                invoice.amount_paid,
                invoice.payment_method,
            )
            .await
        {
            error!(invoice_id = %invoice.id, error = %e, "Failed to write accounting entries for purchase");
        }
        self.emit(Event::PurchaseInvoiceCreated(invoice.id)).await;
        info!(
            invoice_id = %invoice.id,
            invoice_number = %invoice.invoice_number,
            total = %invoice.total_amount,
            status = %invoice.status,
            "Purchase invoice created"
        );

        Ok(model_to_response(invoice, items))
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_new_invoice(
        &self,
        invoice_id: Uuid,
        supplier: &supplier::Model,
        request: &CreatePurchaseInvoiceRequest,
        lines: Vec<CostedLine>,
        totals: InvoiceTotals,
        amount_paid: Decimal,
        initial_status: Option<InvoiceStatus>,
        actor: &str,
    ) -> Result<(purchase_invoice::Model, Vec<purchase_invoice_item::Model>), ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;
        let party = PartyRef::supplier(supplier.id);

        self.balance.record_charge(&txn, party, totals.total).await?;
        let split = if amount_paid > Decimal::ZERO {
            self.balance
                .record_payment(&txn, party, amount_paid, totals.total, BalanceBucket::Pending)
                .await?
        } else {
            PaymentSplit {
                applied_to_balance: Decimal::ZERO,
                credited_to_advance: Decimal::ZERO,
            }
        };

        let unpaid = (totals.total - amount_paid).max(Decimal::ZERO);
        let status = if amount_paid > Decimal::ZERO && unpaid == Decimal::ZERO {
            InvoiceStatus::Confirmed
        } else {
            initial_status.unwrap_or(if unpaid == Decimal::ZERO {
                InvoiceStatus::Confirmed
            } else {
                InvoiceStatus::Pending
            })
        };

        let now = Utc::now();
        let invoice = purchase_invoice::ActiveModel {
            id: Set(invoice_id),
            invoice_number: Set(document_number("PI")),
            supplier_id: Set(supplier.id),
            status: Set(status),
            subtotal: Set(totals.subtotal),
            discount_total: Set(totals.discount_total),
            tax_total: Set(totals.tax_total),
            total_amount: Set(totals.total),
            amount_paid: Set(amount_paid),
            balance_applied: Set(split.applied_to_balance),
            advance_credited: Set(split.credited_to_advance),
            remaining_balance: Set(unpaid),
            payment_status: Set(PaymentStatus::for_amounts(amount_paid, totals.total)),
            payment_method: Set(request.payment_method),
            notes: Set(request.notes.clone()),
            created_by: Set(actor.to_string()),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::DatabaseError)?;

        let mut items = Vec::with_capacity(lines.len());
        for line in lines {
            let item = purchase_invoice_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                invoice_id: Set(invoice_id),
                product_id: Set(line.product_id),
                product_name: Set(line.product_name),
                quantity: Set(line.quantity),
                unit_cost: Set(line.unit_cost),
                line_total: Set(line.line_total),
            }
            .insert(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
            items.push(item);
        }

        txn.commit().await.map_err(ServiceError::DatabaseError)?;
        Ok((invoice, items))
    }

    pub async fn get_invoice(&self, id: Uuid) -> Result<PurchaseInvoiceResponse, ServiceError> {
        let invoice = self.require_invoice(id).await?;
        let items = self.invoice_items(id).await?;
        Ok(model_to_response(invoice, items))
    }

    pub async fn list_invoices(
        &self,
        filters: InvoiceFilters,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<PurchaseInvoiceResponse>, u64), ServiceError> {
        let db = &*self.db_pool;
        let mut query =
            purchase_invoice::Entity::find().order_by_desc(purchase_invoice::Column::CreatedAt);
        if let Some(supplier_id) = filters.supplier_id {
            query = query.filter(purchase_invoice::Column::SupplierId.eq(supplier_id));
        }
        if let Some(status) = filters.status {
            query = query.filter(purchase_invoice::Column::Status.eq(status));
        }

        let paginator = query.paginate(db, per_page);
        let total = paginator
            .num_items()
            .await
            .map_err(ServiceError::DatabaseError)?;
        let invoices = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::DatabaseError)?;

        let ids: Vec<Uuid> = invoices.iter().map(|i| i.id).collect();
        let mut items_by_invoice: HashMap<Uuid, Vec<purchase_invoice_item::Model>> = HashMap::new();
        if !ids.is_empty() {
            let items = purchase_invoice_item::Entity::find()
                .filter(purchase_invoice_item::Column::InvoiceId.is_in(ids))
                .all(db)
                .await
                .map_err(ServiceError::DatabaseError)?;
            for item in items {
                items_by_invoice
                    .entry(item.invoice_id)
                    .or_default()
                    .push(item);
            }
        }

        let responses = invoices
            .into_iter()
            .map(|invoice| {
                let items = items_by_invoice.remove(&invoice.id).unwrap_or_default();
                model_to_response(invoice, items)
            })
            .collect();
        Ok((responses, total))
    }

    /// Replaces the invoice's lines. Stock moves by the per-product delta, in
    /// for increases and out for decreases, the reverse of the sales side.
    #[instrument(skip(self, request), fields(invoice_id = %id))]
    pub async fn update_invoice(
        &self,
        id: Uuid,
        request: UpdatePurchaseInvoiceRequest,
        actor: &str,
    ) -> Result<PurchaseInvoiceResponse, ServiceError> {
        request.validate()?;
        ensure_unique_products(&request.items)?;

        let db = &*self.db_pool;
        let invoice = self.require_invoice(id).await?;
        if invoice.status.is_terminal() {
            return Err(ServiceError::ValidationError(format!(
                "Purchase invoice {} is {} and can no longer be edited",
                invoice.invoice_number, invoice.status
            )));
        }
        if let Some(expected) = request.expected_version {
            if expected != invoice.version {
                return Err(ServiceError::ConcurrentModification(id));
            }
        }
        let return_count = purchase_return::Entity::find()
            .filter(purchase_return::Column::InvoiceId.eq(id))
            .count(db)
            .await
            .map_err(ServiceError::DatabaseError)?;
        if return_count > 0 {
            return Err(ServiceError::Conflict(format!(
                "Purchase invoice {} has returns recorded against it and cannot be edited",
                invoice.invoice_number
            )));
        }

        let old_items = self.invoice_items(id).await?;
        let products = self.load_products(&request.items).await?;
        let mut lines = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let product = products.get(&item.product_id).ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", item.product_id))
            })?;
            lines.push(cost_line(product, item)?);
        }
        let totals = invoice_totals(
            &lines,
            request.discount_total.unwrap_or(invoice.discount_total),
            request.tax_total.unwrap_or(invoice.tax_total),
        )?;

        let unpaid_old = invoice.unpaid_amount();
        let unpaid_new = (totals.total - invoice.amount_paid).max(Decimal::ZERO);
        if unpaid_new > unpaid_old {
            let check = self
                .balance
                .can_accept_charge(
                    db,
                    PartyRef::supplier(invoice.supplier_id),
                    unpaid_new - unpaid_old,
                )
                .await?;
            if !check.allowed {
                return Err(check.into_error());
            }
        }

        let mut old_qty: HashMap<Uuid, Decimal> = HashMap::new();
        for item in &old_items {
            *old_qty.entry(item.product_id).or_default() += item.quantity;
        }
        let mut new_qty: HashMap<Uuid, Decimal> = HashMap::new();
        let mut new_cost: HashMap<Uuid, Decimal> = HashMap::new();
        for line in &lines {
            *new_qty.entry(line.product_id).or_default() += line.quantity;
            new_cost.insert(line.product_id, line.unit_cost);
        }

        let mut compensation = CompensationStack::new();
        for (product_id, diff) in super::quantity_deltas(&old_qty, &new_qty) {
            // Buying more brings stock in at the new cost; buying less takes
            // the difference back out.
            let (movement_type, quantity, unit_cost, inverse_type) = if diff > Decimal::ZERO {
                (
                    MovementType::In,
                    diff,
                    new_cost.get(&product_id).copied(),
                    MovementType::Out,
                )
            } else {
                (MovementType::Out, -diff, None, MovementType::In)
            };
            let moved = self
                .stock
                .update_stock(StockUpdateInput {
                    product_id,
                    movement_type,
                    quantity,
                    unit_cost,
                    reason: "invoice_update".to_string(),
                    reference_type: Some("purchase_invoice".to_string()),
                    reference_id: Some(id),
                    performed_by: actor.to_string(),
                })
                .await;
            match moved {
                Ok(_) => compensation.push(
                    format!("undo stock delta for product {}", product_id),
                    StockUpdateInput {
                        product_id,
                        movement_type: inverse_type,
                        quantity,
                        unit_cost: None,
                        reason: "compensation".to_string(),
                        reference_type: Some("purchase_invoice".to_string()),
                        reference_id: Some(id),
                        performed_by: actor.to_string(),
                    },
                ),
                Err(err) => {
                    let failures = compensation.unwind(&self.stock).await;
                    return Err(resolve_unwind(err, failures));
                }
            }
        }

        let persisted = self
            .persist_invoice_update(&invoice, lines, totals, request.notes.clone())
            .await;
        let response = match persisted {
            Ok(response) => response,
            Err(err) => {
                let failures = compensation.unwind(&self.stock).await;
                return Err(resolve_unwind(err, failures));
            }
        };

        if totals.total != invoice.total_amount {
            if let Err(e) = self
                .accounting
                .record_purchase_adjustment(
                    invoice.id,
                    &invoice.invoice_number,
                    totals.total - invoice.total_amount,
                )
                .await
            {
                error!(invoice_id = %invoice.id, error = %e, "Failed to write accounting adjustment");
            }
        }
        self.emit(Event::PurchaseInvoiceUpdated(invoice.id)).await;
        info!(
            invoice_id = %invoice.id,
            invoice_number = %invoice.invoice_number,
            total = %totals.total,
            "Purchase invoice updated"
        );
        Ok(response)
    }

    async fn persist_invoice_update(
        &self,
        invoice: &purchase_invoice::Model,
        lines: Vec<CostedLine>,
        totals: InvoiceTotals,
        notes: Option<String>,
    ) -> Result<PurchaseInvoiceResponse, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;
        let party = PartyRef::supplier(invoice.supplier_id);
        let bucket = if invoice.status.is_posted() {
            BalanceBucket::Posted
        } else {
            BalanceBucket::Pending
        };

        let applied_new = invoice.balance_applied.min(totals.total);
        let excess = invoice.balance_applied - applied_new;
        let bucket_delta =
            (totals.total - applied_new) - (invoice.total_amount - invoice.balance_applied);
        self.balance
            .apply_charge_delta(&txn, party, bucket_delta, bucket)
            .await?;
        if excess > Decimal::ZERO {
            self.balance
                .record_payment(&txn, party, excess, Decimal::ZERO, bucket)
                .await?;
        }

        purchase_invoice_item::Entity::delete_many()
            .filter(purchase_invoice_item::Column::InvoiceId.eq(invoice.id))
            .exec(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
        let mut items = Vec::with_capacity(lines.len());
        for line in lines {
            let item = purchase_invoice_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                invoice_id: Set(invoice.id),
                product_id: Set(line.product_id),
                product_name: Set(line.product_name),
                quantity: Set(line.quantity),
                unit_cost: Set(line.unit_cost),
                line_total: Set(line.line_total),
            }
            .insert(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
            items.push(item);
        }

        let unpaid_new = (totals.total - invoice.amount_paid).max(Decimal::ZERO);
        let update = purchase_invoice::Entity::update_many()
            .col_expr(
                purchase_invoice::Column::Subtotal,
                Expr::value(totals.subtotal),
            )
            .col_expr(
                purchase_invoice::Column::DiscountTotal,
                Expr::value(totals.discount_total),
            )
            .col_expr(
                purchase_invoice::Column::TaxTotal,
                Expr::value(totals.tax_total),
            )
            .col_expr(
                purchase_invoice::Column::TotalAmount,
                Expr::value(totals.total),
            )
            .col_expr(
                purchase_invoice::Column::BalanceApplied,
                Expr::value(applied_new),
            )
            .col_expr(
                purchase_invoice::Column::AdvanceCredited,
                Expr::value(invoice.advance_credited + excess),
            )
            .col_expr(
                purchase_invoice::Column::RemainingBalance,
                Expr::value(unpaid_new),
            )
            .col_expr(
                purchase_invoice::Column::PaymentStatus,
                Expr::value(PaymentStatus::for_amounts(
                    invoice.amount_paid,
                    totals.total,
                )),
            )
            .col_expr(
                purchase_invoice::Column::Notes,
                Expr::value(notes.or_else(|| invoice.notes.clone())),
            )
            .col_expr(
                purchase_invoice::Column::Version,
                Expr::value(invoice.version + 1),
            )
            .col_expr(
                purchase_invoice::Column::UpdatedAt,
                Expr::value(Utc::now()),
            )
            .filter(purchase_invoice::Column::Id.eq(invoice.id))
            .filter(purchase_invoice::Column::Version.eq(invoice.version))
            .exec(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
        if update.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(invoice.id));
        }

        txn.commit().await.map_err(ServiceError::DatabaseError)?;

        let refreshed = self.require_invoice(invoice.id).await?;
        Ok(model_to_response(refreshed, items))
    }

    #[instrument(skip(self), fields(invoice_id = %id, to = %to))]
    pub async fn transition_status(
        &self,
        id: Uuid,
        to: InvoiceStatus,
    ) -> Result<PurchaseInvoiceResponse, ServiceError> {
        let db = &*self.db_pool;
        let invoice = self.require_invoice(id).await?;
        if to == InvoiceStatus::Cancelled {
            return Err(ServiceError::InvalidStateTransition {
                from: invoice.status.to_string(),
                to: to.to_string(),
            });
        }
        check_invoice_transition(invoice.status, to)?;

        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;
        if to == InvoiceStatus::Confirmed && !invoice.status.is_posted() {
            self.balance
                .confirm_charge(
                    &txn,
                    PartyRef::supplier(invoice.supplier_id),
                    invoice.unpaid_amount(),
                )
                .await?;
        }
        let update = purchase_invoice::Entity::update_many()
            .col_expr(purchase_invoice::Column::Status, Expr::value(to))
            .col_expr(
                purchase_invoice::Column::Version,
                Expr::value(invoice.version + 1),
            )
            .col_expr(
                purchase_invoice::Column::UpdatedAt,
                Expr::value(Utc::now()),
            )
            .filter(purchase_invoice::Column::Id.eq(id))
            .filter(purchase_invoice::Column::Version.eq(invoice.version))
            .exec(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
        if update.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(id));
        }
        txn.commit().await.map_err(ServiceError::DatabaseError)?;

        if to == InvoiceStatus::Confirmed {
            self.emit(Event::PurchaseInvoiceConfirmed(id)).await;
        } else {
            self.emit(Event::PurchaseInvoiceUpdated(id)).await;
        }
        info!(invoice_id = %id, from = %invoice.status, to = %to, "Purchase invoice transitioned");
        self.get_invoice(id).await
    }

    #[instrument(skip(self, request), fields(invoice_id = %id, amount = %request.amount))]
    pub async fn record_payment(
        &self,
        id: Uuid,
        request: InvoicePaymentRequest,
    ) -> Result<PurchaseInvoiceResponse, ServiceError> {
        if request.amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Payment amount must be positive".to_string(),
            ));
        }
        let db = &*self.db_pool;
        let invoice = self.require_invoice(id).await?;
        if invoice.status == InvoiceStatus::Cancelled {
            return Err(ServiceError::ValidationError(format!(
                "Purchase invoice {} is cancelled and cannot take payment",
                invoice.invoice_number
            )));
        }

        let bucket = if invoice.status.is_posted() {
            BalanceBucket::Posted
        } else {
            BalanceBucket::Pending
        };
        let outstanding = invoice.total_amount - invoice.balance_applied;

        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;
        let split = self
            .balance
            .record_payment(
                &txn,
                PartyRef::supplier(invoice.supplier_id),
                request.amount,
                outstanding,
                bucket,
            )
            .await?;

        let amount_paid = invoice.amount_paid + request.amount;
        let unpaid = (invoice.total_amount - amount_paid).max(Decimal::ZERO);
        let status = if unpaid == Decimal::ZERO
            && matches!(invoice.status, InvoiceStatus::Draft | InvoiceStatus::Pending)
        {
            InvoiceStatus::Confirmed
        } else {
            invoice.status
        };

        let update = purchase_invoice::Entity::update_many()
            .col_expr(
                purchase_invoice::Column::AmountPaid,
                Expr::value(amount_paid),
            )
            .col_expr(
                purchase_invoice::Column::BalanceApplied,
                Expr::value(invoice.balance_applied + split.applied_to_balance),
            )
            .col_expr(
                purchase_invoice::Column::AdvanceCredited,
                Expr::value(invoice.advance_credited + split.credited_to_advance),
            )
            .col_expr(
                purchase_invoice::Column::RemainingBalance,
                Expr::value(unpaid),
            )
            .col_expr(
                purchase_invoice::Column::PaymentStatus,
                Expr::value(PaymentStatus::for_amounts(
                    amount_paid,
                    invoice.total_amount,
                )),
            )
            .col_expr(purchase_invoice::Column::Status, Expr::value(status))
            .col_expr(
                purchase_invoice::Column::Version,
                Expr::value(invoice.version + 1),
            )
            .col_expr(
                purchase_invoice::Column::UpdatedAt,
                Expr::value(Utc::now()),
            )
            .filter(purchase_invoice::Column::Id.eq(id))
            .filter(purchase_invoice::Column::Version.eq(invoice.version))
            .exec(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
        if update.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(id));
        }
        txn.commit().await.map_err(ServiceError::DatabaseError)?;

        INVOICE_PAYMENTS_RECORDED.inc();
        let method = request.payment_method.unwrap_or(invoice.payment_method);
        if let Err(e) = self
            .accounting
            .record_payment_made(invoice.id, &invoice.invoice_number, request.amount, method)
            .await
        {
            error!(invoice_id = %invoice.id, error = %e, "Failed to write accounting entries for payment");
        }
        self.emit(Event::PaymentRecorded {
            document_type: "purchase_invoice".to_string(),
            document_id: invoice.id,
            party_id: invoice.supplier_id,
            amount: request.amount,
        })
        .await;
        info!(
            invoice_id = %invoice.id,
            amount = %request.amount,
            applied = %split.applied_to_balance,
            to_advance = %split.credited_to_advance,
            "Payment recorded on purchase invoice"
        );
        self.get_invoice(id).await
    }

    /// Cancels the invoice: received goods go back out (availability-checked,
    /// so an invoice whose goods were already sold refuses), the balance
    /// contribution is reversed, the row stays with status `cancelled`.
    #[instrument(skip(self), fields(invoice_id = %id))]
    pub async fn cancel_invoice(
        &self,
        id: Uuid,
        actor: &str,
    ) -> Result<PurchaseInvoiceResponse, ServiceError> {
        let invoice = self.require_invoice(id).await?;
        check_invoice_transition(invoice.status, InvoiceStatus::Cancelled)?;
        let items = self.invoice_items(id).await?;

        let mut compensation = CompensationStack::new();
        self.remove_item_stock(&items, id, "invoice_cancelled", actor, &mut compensation)
            .await?;

        if let Err(err) = self.persist_invoice_reversal(&invoice).await {
            let failures = compensation.unwind(&self.stock).await;
            return Err(resolve_unwind(err, failures));
        }

        INVOICES_CANCELLED.inc();
        if let Err(e) = self
            .accounting
            .record_purchase_reversal(
                invoice.id,
                &invoice.invoice_number,
                invoice.total_amount,
                invoice.amount_paid,
                invoice.payment_method,
            )
            .await
        {
            error!(invoice_id = %invoice.id, error = %e, "Failed to write accounting reversal");
        }
        self.emit(Event::PurchaseInvoiceCancelled(id)).await;
        info!(invoice_id = %id, invoice_number = %invoice.invoice_number, "Purchase invoice cancelled");
        self.get_invoice(id).await
    }

    /// Deletes the invoice after the same reversal as cancellation; a
    /// cancelled invoice deletes without further reversal.
    #[instrument(skip(self), fields(invoice_id = %id))]
    pub async fn delete_invoice(&self, id: Uuid, actor: &str) -> Result<(), ServiceError> {
        let db = &*self.db_pool;
        let invoice = self.require_invoice(id).await?;
        let return_count = purchase_return::Entity::find()
            .filter(purchase_return::Column::InvoiceId.eq(id))
            .count(db)
            .await
            .map_err(ServiceError::DatabaseError)?;
        if return_count > 0 {
            return Err(ServiceError::Conflict(format!(
                "Purchase invoice {} has returns recorded against it; delete the returns first",
                invoice.invoice_number
            )));
        }

        let already_reversed = invoice.status == InvoiceStatus::Cancelled;
        let items = self.invoice_items(id).await?;

        let mut compensation = CompensationStack::new();
        if !already_reversed {
            self.remove_item_stock(&items, id, "invoice_deleted", actor, &mut compensation)
                .await?;
        }

        let removal = self.persist_invoice_removal(&invoice, already_reversed).await;
        if let Err(err) = removal {
            let failures = compensation.unwind(&self.stock).await;
            return Err(resolve_unwind(err, failures));
        }

        if !already_reversed {
            if let Err(e) = self
                .accounting
                .record_purchase_reversal(
                    invoice.id,
                    &invoice.invoice_number,
                    invoice.total_amount,
                    invoice.amount_paid,
                    invoice.payment_method,
                )
                .await
            {
                error!(invoice_id = %invoice.id, error = %e, "Failed to write accounting reversal");
            }
        }
        self.emit(Event::PurchaseInvoiceDeleted(id)).await;
        info!(invoice_id = %id, invoice_number = %invoice.invoice_number, "Purchase invoice deleted");
        Ok(())
    }

    async fn remove_item_stock(
        &self,
        items: &[purchase_invoice_item::Model],
        invoice_id: Uuid,
        reason: &str,
        actor: &str,
        compensation: &mut CompensationStack,
    ) -> Result<(), ServiceError> {
        for item in items {
            let moved = self
                .stock
                .update_stock(StockUpdateInput {
                    product_id: item.product_id,
                    movement_type: MovementType::Out,
                    quantity: item.quantity,
                    unit_cost: None,
                    reason: reason.to_string(),
                    reference_type: Some("purchase_invoice".to_string()),
                    reference_id: Some(invoice_id),
                    performed_by: actor.to_string(),
                })
                .await;
            match moved {
                Ok(_) => compensation.push(
                    format!("re-add stock for product {}", item.product_id),
                    StockUpdateInput {
                        product_id: item.product_id,
                        movement_type: MovementType::In,
                        quantity: item.quantity,
                        unit_cost: None,
                        reason: "compensation".to_string(),
                        reference_type: Some("purchase_invoice".to_string()),
                        reference_id: Some(invoice_id),
                        performed_by: actor.to_string(),
                    },
                ),
                Err(err) => {
                    let failures = std::mem::take(compensation).unwind(&self.stock).await;
                    return Err(resolve_unwind(err, failures));
                }
            }
        }
        Ok(())
    }

    async fn persist_invoice_reversal(
        &self,
        invoice: &purchase_invoice::Model,
    ) -> Result<(), ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;
        self.reverse_balance_contribution(&txn, invoice).await?;
        let update = purchase_invoice::Entity::update_many()
            .col_expr(
                purchase_invoice::Column::Status,
                Expr::value(InvoiceStatus::Cancelled),
            )
            .col_expr(
                purchase_invoice::Column::Version,
                Expr::value(invoice.version + 1),
            )
            .col_expr(
                purchase_invoice::Column::UpdatedAt,
                Expr::value(Utc::now()),
            )
            .filter(purchase_invoice::Column::Id.eq(invoice.id))
            .filter(purchase_invoice::Column::Version.eq(invoice.version))
            .exec(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
        if update.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(invoice.id));
        }
        txn.commit().await.map_err(ServiceError::DatabaseError)
    }

    async fn persist_invoice_removal(
        &self,
        invoice: &purchase_invoice::Model,
        already_reversed: bool,
    ) -> Result<(), ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;
        if !already_reversed {
            self.reverse_balance_contribution(&txn, invoice).await?;
        }
        purchase_invoice_item::Entity::delete_many()
            .filter(purchase_invoice_item::Column::InvoiceId.eq(invoice.id))
            .exec(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
        purchase_invoice::Entity::delete_by_id(invoice.id)
            .exec(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
        txn.commit().await.map_err(ServiceError::DatabaseError)
    }

    async fn reverse_balance_contribution(
        &self,
        txn: &sea_orm::DatabaseTransaction,
        invoice: &purchase_invoice::Model,
    ) -> Result<(), ServiceError> {
        let party = PartyRef::supplier(invoice.supplier_id);
        let bucket = if invoice.status.is_posted() {
            BalanceBucket::Posted
        } else {
            BalanceBucket::Pending
        };
        self.balance
            .reverse_charge(txn, party, invoice.unpaid_amount(), bucket)
            .await?;
        let advance_drain = PaymentSplit {
            applied_to_balance: Decimal::ZERO,
            credited_to_advance: invoice.advance_credited,
        };
        self.balance
            .reverse_payment_split(txn, party, &advance_drain, bucket)
            .await
    }

    async fn require_invoice(&self, id: Uuid) -> Result<purchase_invoice::Model, ServiceError> {
        let db = &*self.db_pool;
        purchase_invoice::Entity::find_by_id(id)
            .one(db)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("Purchase invoice {} not found", id)))
    }

    async fn invoice_items(
        &self,
        id: Uuid,
    ) -> Result<Vec<purchase_invoice_item::Model>, ServiceError> {
        let db = &*self.db_pool;
        purchase_invoice_item::Entity::find()
            .filter(purchase_invoice_item::Column::InvoiceId.eq(id))
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)
    }

    async fn load_products(
        &self,
        items: &[InvoiceItemRequest],
    ) -> Result<HashMap<Uuid, product::Model>, ServiceError> {
        let db = &*self.db_pool;
        let ids: Vec<Uuid> = items.iter().map(|i| i.product_id).collect();
        let products = product::Entity::find()
            .filter(product::Column::Id.is_in(ids))
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)?;
        Ok(products.into_iter().map(|p| (p.id, p)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::product::ProductStatus;
    use rust_decimal_macros::dec;

    fn test_product(cost: Decimal) -> product::Model {
        product::Model {
            id: Uuid::new_v4(),
            sku: "SKU-1".to_string(),
            name: "Widget".to_string(),
            category: None,
            unit_price: dec!(10),
            unit_cost: cost,
            current_stock: Decimal::ZERO,
            status: ProductStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn lines_are_priced_at_cost() {
        let product = test_product(dec!(4.5));
        let item = InvoiceItemRequest {
            product_id: product.id,
            quantity: dec!(6),
            unit_cost: None,
        };
        let line = cost_line(&product, &item).unwrap();
        assert_eq!(line.unit_cost, dec!(4.5));
        assert_eq!(line.line_total, dec!(27));
    }

    #[test]
    fn header_discount_cannot_exceed_the_subtotal() {
        let product = test_product(dec!(4));
        let item = InvoiceItemRequest {
            product_id: product.id,
            quantity: dec!(2),
            unit_cost: None,
        };
        let line = cost_line(&product, &item).unwrap();
        let err = invoice_totals(&[line], dec!(9), Decimal::ZERO);
        assert!(matches!(err, Err(ServiceError::ValidationError(_))));
    }

    #[test]
    fn totals_combine_header_discount_and_tax() {
        let product = test_product(dec!(5));
        let item = InvoiceItemRequest {
            product_id: product.id,
            quantity: dec!(10),
            unit_cost: None,
        };
        let line = cost_line(&product, &item).unwrap();
        let totals = invoice_totals(&[line], dec!(5), dec!(4.5)).unwrap();
        assert_eq!(totals.subtotal, dec!(50));
        assert_eq!(totals.total, dec!(49.5));
    }

    #[test]
    fn invoice_transitions_allow_cancel_from_confirmed() {
        use InvoiceStatus::*;
        assert!(check_invoice_transition(Draft, Pending).is_ok());
        assert!(check_invoice_transition(Pending, Confirmed).is_ok());
        assert!(check_invoice_transition(Confirmed, Cancelled).is_ok());
        assert!(check_invoice_transition(Cancelled, Pending).is_err());
        assert!(check_invoice_transition(Confirmed, Pending).is_err());
    }
}
