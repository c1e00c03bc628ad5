use crate::{
    db::DbPool,
    entities::{
        customer::{self, PartyStatus},
        product::{self, ProductStatus},
        sale_return,
        sales_order::{self, OrderStatus, PaymentMethod, PaymentStatus},
        sales_order_item,
        stock_movement::MovementType,
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
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use sea_orm::sea_query::Expr;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

lazy_static! {
    static ref ORDERS_CREATED: IntCounter = IntCounter::new(
        "sales_orders_created_total",
        "Total number of sales orders created"
    )
    .expect("metric can be created");
    static ref ORDERS_CANCELLED: IntCounter = IntCounter::new(
        "sales_orders_cancelled_total",
        "Total number of sales orders cancelled"
    )
    .expect("metric can be created");
    static ref ORDER_PAYMENTS_RECORDED: IntCounter = IntCounter::new(
        "sales_order_payments_recorded_total",
        "Total number of payments recorded against sales orders"
    )
    .expect("metric can be created");
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderItemRequest {
    pub product_id: Uuid,
    pub quantity: Decimal,
    /// Overrides the catalog price when set.
    pub unit_price: Option<Decimal>,
    pub discount_amount: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateSalesOrderRequest {
    pub customer_id: Uuid,
    #[validate(length(min = 1, message = "Order must contain at least one item"))]
    pub items: Vec<OrderItemRequest>,
    pub payment_method: PaymentMethod,
    pub amount_paid: Option<Decimal>,
    /// `draft` or `pending`; omitted means pending, or confirmed when fully paid.
    pub status: Option<OrderStatus>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct UpdateSalesOrderRequest {
    #[validate(length(min = 1, message = "Order must contain at least one item"))]
    pub items: Vec<OrderItemRequest>,
    pub notes: Option<String>,
    /// When set, the update fails with a conflict if the stored version differs.
    pub expected_version: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RecordPaymentRequest {
    pub amount: Decimal,
    /// Settlement method for this payment; defaults to the order's method.
    pub payment_method: Option<PaymentMethod>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TransitionRequest {
    pub status: OrderStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct OrderFilters {
    pub customer_id: Option<Uuid>,
    pub status: Option<OrderStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderItemResponse {
    pub id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub discount_amount: Decimal,
    pub tax_amount: Decimal,
    pub line_total: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SalesOrderResponse {
    pub id: Uuid,
    pub order_number: String,
    pub customer_id: Uuid,
    pub status: OrderStatus,
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
    pub items: Vec<OrderItemResponse>,
}

/// A fully priced order line ready for persistence.
#[derive(Debug, Clone)]
struct PricedLine {
    product_id: Uuid,
    product_name: String,
    quantity: Decimal,
    unit_price: Decimal,
    discount_amount: Decimal,
    tax_amount: Decimal,
    line_total: Decimal,
}

#[derive(Debug, Clone, Copy, Default)]
struct DocumentTotals {
    subtotal: Decimal,
    discount_total: Decimal,
    tax_total: Decimal,
    total: Decimal,
}

fn allowed_transitions(from: OrderStatus) -> &'static [OrderStatus] {
    use OrderStatus::*;
    match from {
        Draft => &[Pending, Confirmed, Cancelled],
        Pending => &[Confirmed, Cancelled],
        Confirmed => &[Shipped, Cancelled],
        Shipped => &[Delivered],
        Delivered => &[],
        Cancelled => &[],
    }
}

pub(crate) fn check_order_transition(
    from: OrderStatus,
    to: OrderStatus,
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

fn ensure_unique_products(items: &[OrderItemRequest]) -> Result<(), ServiceError> {
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

/// Prices one sale line against the catalog: `line = qty * price - discount`,
/// tax applied on the discounted amount, all figures rounded to 4 decimals.
fn price_line(
    product: &product::Model,
    item: &OrderItemRequest,
    tax_rate: Decimal,
) -> Result<PricedLine, ServiceError> {
    if item.quantity <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(format!(
            "Quantity for product {} must be positive",
            product.name
        )));
    }
    if product.status == ProductStatus::Archived {
        return Err(ServiceError::ValidationError(format!(
            "Product {} is archived and cannot be sold",
            product.name
        )));
    }

    let unit_price = item.unit_price.unwrap_or(product.unit_price);
    if unit_price < Decimal::ZERO {
        return Err(ServiceError::ValidationError(format!(
            "Unit price for product {} cannot be negative",
            product.name
        )));
    }
    let discount = item.discount_amount.unwrap_or(Decimal::ZERO);
    if discount < Decimal::ZERO {
        return Err(ServiceError::ValidationError(format!(
            "Discount for product {} cannot be negative",
            product.name
        )));
    }

    let base = (item.quantity * unit_price).round_dp(4);
    if discount > base {
        return Err(ServiceError::ValidationError(format!(
            "Discount {} exceeds the line amount {} for product {}",
            discount, base, product.name
        )));
    }
    let taxable = base - discount;
    let tax = (taxable * tax_rate).round_dp(4);

    Ok(PricedLine {
        product_id: product.id,
        product_name: product.name.clone(),
        quantity: item.quantity,
        unit_price,
        discount_amount: discount,
        tax_amount: tax,
        line_total: taxable + tax,
    })
}

fn sum_totals(lines: &[PricedLine]) -> DocumentTotals {
    let mut totals = DocumentTotals::default();
    for line in lines {
        totals.subtotal += (line.quantity * line.unit_price).round_dp(4);
        totals.discount_total += line.discount_amount;
        totals.tax_total += line.tax_amount;
        totals.total += line.line_total;
    }
    totals
}

fn model_to_response(
    order: sales_order::Model,
    items: Vec<sales_order_item::Model>,
) -> SalesOrderResponse {
    SalesOrderResponse {
        id: order.id,
        order_number: order.order_number,
        customer_id: order.customer_id,
        status: order.status,
        subtotal: order.subtotal,
        discount_total: order.discount_total,
        tax_total: order.tax_total,
        total_amount: order.total_amount,
        amount_paid: order.amount_paid,
        remaining_balance: order.remaining_balance,
        payment_status: order.payment_status,
        payment_method: order.payment_method,
        notes: order.notes,
        created_by: order.created_by,
        version: order.version,
        created_at: order.created_at,
        updated_at: order.updated_at,
        items: items
            .into_iter()
            .map(|item| OrderItemResponse {
                id: item.id,
                product_id: item.product_id,
                product_name: item.product_name,
                quantity: item.quantity,
                unit_price: item.unit_price,
                discount_amount: item.discount_amount,
                tax_amount: item.tax_amount,
                line_total: item.line_total,
            })
            .collect(),
    }
}

/// Orchestrates the sales document flow: stock out first in short transactions
/// with compensating movements queued, then the document transaction carrying
/// the balance moves, then post-commit accounting and events.
#[derive(Clone)]
pub struct SalesOrderService {
    db_pool: Arc<DbPool>,
    balance: PartyBalanceService,
    stock: InventoryStockService,
    accounting: AccountingService,
    event_sender: Option<Arc<EventSender>>,
    default_tax_rate: Decimal,
}

impl SalesOrderService {
    pub fn new(
        db_pool: Arc<DbPool>,
        balance: PartyBalanceService,
        stock: InventoryStockService,
        accounting: AccountingService,
        event_sender: Option<Arc<EventSender>>,
        default_tax_rate: Decimal,
    ) -> Self {
        Self {
            db_pool,
            balance,
            stock,
            accounting,
            event_sender,
            default_tax_rate,
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "Failed to send sales order event");
            }
        }
    }

    #[instrument(skip(self, request), fields(customer_id = %request.customer_id))]
    pub async fn create_order(
        &self,
        request: CreateSalesOrderRequest,
        actor: &str,
    ) -> Result<SalesOrderResponse, ServiceError> {
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
            Some(OrderStatus::Draft) => {
                if amount_paid > Decimal::ZERO {
                    return Err(ServiceError::ValidationError(
                        "Draft orders cannot take payment".to_string(),
                    ));
                }
                Some(OrderStatus::Draft)
            }
            Some(OrderStatus::Pending) => Some(OrderStatus::Pending),
            Some(other) => {
                return Err(ServiceError::ValidationError(format!(
                    "Orders cannot be created as {}",
                    other
                )));
            }
        };

        let db = &*self.db_pool;
        let customer = customer::Entity::find_by_id(request.customer_id)
            .one(db)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Customer {} not found", request.customer_id))
            })?;
        if customer.status == PartyStatus::Inactive {
            return Err(ServiceError::ValidationError(format!(
                "Customer {} is inactive",
                customer.name
            )));
        }

        let products = self.load_products(&request.items).await?;
        let mut lines = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let product = products.get(&item.product_id).ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", item.product_id))
            })?;
            lines.push(price_line(product, item, self.default_tax_rate)?);
        }
        let totals = sum_totals(&lines);
        let unpaid = (totals.total - amount_paid).max(Decimal::ZERO);

        // Credit gate before any stock leaves the building.
        if unpaid > Decimal::ZERO {
            let check = self
                .balance
                .can_accept_charge(db, PartyRef::customer(customer.id), unpaid)
                .await?;
            if !check.allowed {
                return Err(check.into_error());
            }
        }

        let order_id = Uuid::new_v4();
        let mut compensation = CompensationStack::new();
        for line in &lines {
            let moved = self
                .stock
                .update_stock(StockUpdateInput {
                    product_id: line.product_id,
                    movement_type: MovementType::Out,
                    quantity: line.quantity,
                    unit_cost: None,
                    reason: "sale".to_string(),
                    reference_type: Some("sales_order".to_string()),
                    reference_id: Some(order_id),
                    performed_by: actor.to_string(),
                })
                .await;
            match moved {
                Ok(_) => compensation.push(
                    format!("restore stock for product {}", line.product_id),
                    StockUpdateInput {
                        product_id: line.product_id,
                        movement_type: MovementType::In,
                        quantity: line.quantity,
                        unit_cost: None,
                        reason: "compensation".to_string(),
                        reference_type: Some("sales_order".to_string()),
                        reference_id: Some(order_id),
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
            .persist_new_order(
                order_id,
                &customer,
                &request,
                lines,
                totals,
                amount_paid,
                initial_status,
                actor,
            )
            .await;
        let (order, items) = match persisted {
            Ok(pair) => pair,
            Err(err) => {
                let failures = compensation.unwind(&self.stock).await;
                return Err(resolve_unwind(err, failures));
            }
        };

        ORDERS_CREATED.inc();
        if let Err(e) = self
            .accounting
            .record_sale(
                order.id,
                &order.order_number,
                order.total_amount,
                order.amount_paid,
                order.payment_method,
            )
            .await
        {
            error!(order_id = %order.id, error = %e, "Failed to write accounting entries for sale");
        }
        self.emit(Event::SalesOrderCreated(order.id)).await;
        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            total = %order.total_amount,
            status = %order.status,
            "Sales order created"
        );

        Ok(model_to_response(order, items))
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_new_order(
        &self,
        order_id: Uuid,
        customer: &customer::Model,
        request: &CreateSalesOrderRequest,
        lines: Vec<PricedLine>,
        totals: DocumentTotals,
        amount_paid: Decimal,
        initial_status: Option<OrderStatus>,
        actor: &str,
    ) -> Result<(sales_order::Model, Vec<sales_order_item::Model>), ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;
        let party = PartyRef::customer(customer.id);

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
        // A real payment covering the whole total confirms immediately; the
        // unpaid portion is zero, so no pending-to-current move is needed.
        let status = if amount_paid > Decimal::ZERO && unpaid == Decimal::ZERO {
            OrderStatus::Confirmed
        } else {
            initial_status.unwrap_or(if unpaid == Decimal::ZERO {
                OrderStatus::Confirmed
            } else {
                OrderStatus::Pending
            })
        };

        let now = Utc::now();
        let order = sales_order::ActiveModel {
            id: Set(order_id),
            order_number: Set(document_number("SO")),
            customer_id: Set(customer.id),
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
            let item = sales_order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(line.product_id),
                product_name: Set(line.product_name),
                quantity: Set(line.quantity),
                unit_price: Set(line.unit_price),
                discount_amount: Set(line.discount_amount),
                tax_amount: Set(line.tax_amount),
                line_total: Set(line.line_total),
            }
            .insert(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
            items.push(item);
        }

        txn.commit().await.map_err(ServiceError::DatabaseError)?;
        Ok((order, items))
    }

    pub async fn get_order(&self, id: Uuid) -> Result<SalesOrderResponse, ServiceError> {
        let db = &*self.db_pool;
        let order = self.require_order(id).await?;
        let items = sales_order_item::Entity::find()
            .filter(sales_order_item::Column::OrderId.eq(id))
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)?;
        Ok(model_to_response(order, items))
    }

    pub async fn list_orders(
        &self,
        filters: OrderFilters,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<SalesOrderResponse>, u64), ServiceError> {
        let db = &*self.db_pool;
        let mut query = sales_order::Entity::find().order_by_desc(sales_order::Column::CreatedAt);
        if let Some(customer_id) = filters.customer_id {
            query = query.filter(sales_order::Column::CustomerId.eq(customer_id));
        }
        if let Some(status) = filters.status {
            query = query.filter(sales_order::Column::Status.eq(status));
        }

        let paginator = query.paginate(db, per_page);
        let total = paginator
            .num_items()
            .await
            .map_err(ServiceError::DatabaseError)?;
        let orders = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::DatabaseError)?;

        let ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
        let mut items_by_order: HashMap<Uuid, Vec<sales_order_item::Model>> = HashMap::new();
        if !ids.is_empty() {
            let items = sales_order_item::Entity::find()
                .filter(sales_order_item::Column::OrderId.is_in(ids))
                .all(db)
                .await
                .map_err(ServiceError::DatabaseError)?;
            for item in items {
                items_by_order.entry(item.order_id).or_default().push(item);
            }
        }

        let responses = orders
            .into_iter()
            .map(|order| {
                let items = items_by_order.remove(&order.id).unwrap_or_default();
                model_to_response(order, items)
            })
            .collect();
        Ok((responses, total))
    }

    /// Replaces the order's lines: stock moves only by the per-product delta,
    /// the party bucket moves by the total delta, and a previously applied
    /// payment that now exceeds the new total is rebalanced into advance.
    #[instrument(skip(self, request), fields(order_id = %id))]
    pub async fn update_order(
        &self,
        id: Uuid,
        request: UpdateSalesOrderRequest,
        actor: &str,
    ) -> Result<SalesOrderResponse, ServiceError> {
        request.validate()?;
        ensure_unique_products(&request.items)?;

        let db = &*self.db_pool;
        let order = self.require_order(id).await?;
        if order.status.is_terminal() {
            return Err(ServiceError::ValidationError(format!(
                "Sales order {} is {} and can no longer be edited",
                order.order_number, order.status
            )));
        }
        if let Some(expected) = request.expected_version {
            if expected != order.version {
                return Err(ServiceError::ConcurrentModification(id));
            }
        }
        let return_count = sale_return::Entity::find()
            .filter(sale_return::Column::OrderId.eq(id))
            .count(db)
            .await
            .map_err(ServiceError::DatabaseError)?;
        if return_count > 0 {
            return Err(ServiceError::Conflict(format!(
                "Sales order {} has returns recorded against it and cannot be edited",
                order.order_number
            )));
        }

        let old_items = sales_order_item::Entity::find()
            .filter(sales_order_item::Column::OrderId.eq(id))
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)?;

        let products = self.load_products(&request.items).await?;
        let mut lines = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let product = products.get(&item.product_id).ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", item.product_id))
            })?;
            lines.push(price_line(product, item, self.default_tax_rate)?);
        }
        let totals = sum_totals(&lines);

        let unpaid_old = order.unpaid_amount();
        let unpaid_new = (totals.total - order.amount_paid).max(Decimal::ZERO);
        if unpaid_new > unpaid_old {
            let check = self
                .balance
                .can_accept_charge(db, PartyRef::customer(order.customer_id), unpaid_new - unpaid_old)
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
        for line in &lines {
            *new_qty.entry(line.product_id).or_default() += line.quantity;
        }

        let mut compensation = CompensationStack::new();
        for (product_id, diff) in super::quantity_deltas(&old_qty, &new_qty) {
            // More sold means more stock out; less sold puts the difference back.
            let (movement_type, quantity, inverse_type) = if diff > Decimal::ZERO {
                (MovementType::Out, diff, MovementType::In)
            } else {
                (MovementType::In, -diff, MovementType::Out)
            };
            let moved = self
                .stock
                .update_stock(StockUpdateInput {
                    product_id,
                    movement_type,
                    quantity,
                    unit_cost: None,
                    reason: "order_update".to_string(),
                    reference_type: Some("sales_order".to_string()),
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
                        reference_type: Some("sales_order".to_string()),
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
            .persist_order_update(&order, lines, totals, request.notes.clone())
            .await;
        let response = match persisted {
            Ok(response) => response,
            Err(err) => {
                let failures = compensation.unwind(&self.stock).await;
                return Err(resolve_unwind(err, failures));
            }
        };

        if totals.total != order.total_amount {
            if let Err(e) = self
                .accounting
                .record_sale_adjustment(
                    order.id,
                    &order.order_number,
                    totals.total - order.total_amount,
                )
                .await
            {
                error!(order_id = %order.id, error = %e, "Failed to write accounting adjustment");
            }
        }
        self.emit(Event::SalesOrderUpdated(order.id)).await;
        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            total = %totals.total,
            "Sales order updated"
        );
        Ok(response)
    }

    async fn persist_order_update(
        &self,
        order: &sales_order::Model,
        lines: Vec<PricedLine>,
        totals: DocumentTotals,
        notes: Option<String>,
    ) -> Result<SalesOrderResponse, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;
        let party = PartyRef::customer(order.customer_id);
        let bucket = if order.status.is_posted() {
            BalanceBucket::Posted
        } else {
            BalanceBucket::Pending
        };

        // Keep the split capped at the new total. Anything the payment had
        // applied beyond it turns into an advance, exactly as if the smaller
        // document had been paid that way from the start.
        let applied_new = order.balance_applied.min(totals.total);
        let excess = order.balance_applied - applied_new;
        let bucket_delta =
            (totals.total - applied_new) - (order.total_amount - order.balance_applied);
        self.balance
            .apply_charge_delta(&txn, party, bucket_delta, bucket)
            .await?;
        if excess > Decimal::ZERO {
            self.balance
                .record_payment(&txn, party, excess, Decimal::ZERO, bucket)
                .await?;
        }

        sales_order_item::Entity::delete_many()
            .filter(sales_order_item::Column::OrderId.eq(order.id))
            .exec(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
        let mut items = Vec::with_capacity(lines.len());
        for line in lines {
            let item = sales_order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                product_id: Set(line.product_id),
                product_name: Set(line.product_name),
                quantity: Set(line.quantity),
                unit_price: Set(line.unit_price),
                discount_amount: Set(line.discount_amount),
                tax_amount: Set(line.tax_amount),
                line_total: Set(line.line_total),
            }
            .insert(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
            items.push(item);
        }

        let unpaid_new = (totals.total - order.amount_paid).max(Decimal::ZERO);
        let update = sales_order::Entity::update_many()
            .col_expr(sales_order::Column::Subtotal, Expr::value(totals.subtotal))
            .col_expr(
                sales_order::Column::DiscountTotal,
                Expr::value(totals.discount_total),
            )
            .col_expr(sales_order::Column::TaxTotal, Expr::value(totals.tax_total))
            .col_expr(sales_order::Column::TotalAmount, Expr::value(totals.total))
            .col_expr(
                sales_order::Column::BalanceApplied,
                Expr::value(applied_new),
            )
            .col_expr(
                sales_order::Column::AdvanceCredited,
                Expr::value(order.advance_credited + excess),
            )
            .col_expr(
                sales_order::Column::RemainingBalance,
                Expr::value(unpaid_new),
            )
            .col_expr(
                sales_order::Column::PaymentStatus,
                Expr::value(PaymentStatus::for_amounts(order.amount_paid, totals.total)),
            )
            .col_expr(
                sales_order::Column::Notes,
                Expr::value(notes.or_else(|| order.notes.clone())),
            )
            .col_expr(sales_order::Column::Version, Expr::value(order.version + 1))
            .col_expr(sales_order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(sales_order::Column::Id.eq(order.id))
            .filter(sales_order::Column::Version.eq(order.version))
            .exec(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
        if update.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(order.id));
        }

        txn.commit().await.map_err(ServiceError::DatabaseError)?;

        let refreshed = self.require_order(order.id).await?;
        Ok(model_to_response(refreshed, items))
    }

    /// Moves the order along its lifecycle. Entering `confirmed` shifts the
    /// unpaid amount from the customer's pending to current balance.
    /// Cancellation has its own operation and is rejected here.
    #[instrument(skip(self), fields(order_id = %id, to = %to))]
    pub async fn transition_status(
        &self,
        id: Uuid,
        to: OrderStatus,
    ) -> Result<SalesOrderResponse, ServiceError> {
        let db = &*self.db_pool;
        let order = self.require_order(id).await?;
        if to == OrderStatus::Cancelled {
            return Err(ServiceError::InvalidStateTransition {
                from: order.status.to_string(),
                to: to.to_string(),
            });
        }
        check_order_transition(order.status, to)?;

        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;
        if to == OrderStatus::Confirmed && !order.status.is_posted() {
            self.balance
                .confirm_charge(
                    &txn,
                    PartyRef::customer(order.customer_id),
                    order.unpaid_amount(),
                )
                .await?;
        }
        let update = sales_order::Entity::update_many()
            .col_expr(sales_order::Column::Status, Expr::value(to))
            .col_expr(sales_order::Column::Version, Expr::value(order.version + 1))
            .col_expr(sales_order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(sales_order::Column::Id.eq(id))
            .filter(sales_order::Column::Version.eq(order.version))
            .exec(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
        if update.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(id));
        }
        txn.commit().await.map_err(ServiceError::DatabaseError)?;

        if to == OrderStatus::Confirmed {
            self.emit(Event::SalesOrderConfirmed(id)).await;
        } else {
            self.emit(Event::SalesOrderUpdated(id)).await;
        }
        info!(order_id = %id, from = %order.status, to = %to, "Sales order transitioned");
        self.get_order(id).await
    }

    /// Records a payment against the order. The split accumulates on the
    /// document; an order fully paid while draft or pending confirms itself.
    #[instrument(skip(self, request), fields(order_id = %id, amount = %request.amount))]
    pub async fn record_payment(
        &self,
        id: Uuid,
        request: RecordPaymentRequest,
    ) -> Result<SalesOrderResponse, ServiceError> {
        if request.amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Payment amount must be positive".to_string(),
            ));
        }
        let db = &*self.db_pool;
        let order = self.require_order(id).await?;
        if order.status == OrderStatus::Cancelled {
            return Err(ServiceError::ValidationError(format!(
                "Sales order {} is cancelled and cannot take payment",
                order.order_number
            )));
        }

        let bucket = if order.status.is_posted() {
            BalanceBucket::Posted
        } else {
            BalanceBucket::Pending
        };
        let outstanding = order.total_amount - order.balance_applied;

        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;
        let split = self
            .balance
            .record_payment(
                &txn,
                PartyRef::customer(order.customer_id),
                request.amount,
                outstanding,
                bucket,
            )
            .await?;

        let amount_paid = order.amount_paid + request.amount;
        let unpaid = (order.total_amount - amount_paid).max(Decimal::ZERO);
        let status = if unpaid == Decimal::ZERO
            && matches!(order.status, OrderStatus::Draft | OrderStatus::Pending)
        {
            OrderStatus::Confirmed
        } else {
            order.status
        };

        let update = sales_order::Entity::update_many()
            .col_expr(sales_order::Column::AmountPaid, Expr::value(amount_paid))
            .col_expr(
                sales_order::Column::BalanceApplied,
                Expr::value(order.balance_applied + split.applied_to_balance),
            )
            .col_expr(
                sales_order::Column::AdvanceCredited,
                Expr::value(order.advance_credited + split.credited_to_advance),
            )
            .col_expr(sales_order::Column::RemainingBalance, Expr::value(unpaid))
            .col_expr(
                sales_order::Column::PaymentStatus,
                Expr::value(PaymentStatus::for_amounts(amount_paid, order.total_amount)),
            )
            .col_expr(sales_order::Column::Status, Expr::value(status))
            .col_expr(sales_order::Column::Version, Expr::value(order.version + 1))
            .col_expr(sales_order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(sales_order::Column::Id.eq(id))
            .filter(sales_order::Column::Version.eq(order.version))
            .exec(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
        if update.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(id));
        }
        txn.commit().await.map_err(ServiceError::DatabaseError)?;

        ORDER_PAYMENTS_RECORDED.inc();
        let method = request.payment_method.unwrap_or(order.payment_method);
        if let Err(e) = self
            .accounting
            .record_payment_received(order.id, &order.order_number, request.amount, method)
            .await
        {
            error!(order_id = %order.id, error = %e, "Failed to write accounting entries for payment");
        }
        self.emit(Event::PaymentRecorded {
            document_type: "sales_order".to_string(),
            document_id: order.id,
            party_id: order.customer_id,
            amount: request.amount,
        })
        .await;
        info!(
            order_id = %order.id,
            amount = %request.amount,
            applied = %split.applied_to_balance,
            to_advance = %split.credited_to_advance,
            "Payment recorded on sales order"
        );
        self.get_order(id).await
    }

    /// Cancels the order: stock comes back, the balance contribution is
    /// reversed exactly, the row stays with status `cancelled`.
    #[instrument(skip(self), fields(order_id = %id))]
    pub async fn cancel_order(
        &self,
        id: Uuid,
        actor: &str,
    ) -> Result<SalesOrderResponse, ServiceError> {
        let order = self.require_order(id).await?;
        check_order_transition(order.status, OrderStatus::Cancelled)?;
        let items = self.order_items(id).await?;

        let mut compensation = CompensationStack::new();
        if let Err(err) = self
            .restore_item_stock(&items, id, "order_cancelled", actor, &mut compensation)
            .await
        {
            return Err(err);
        }

        if let Err(err) = self.persist_order_reversal(&order).await {
            let failures = compensation.unwind(&self.stock).await;
            return Err(resolve_unwind(err, failures));
        }

        ORDERS_CANCELLED.inc();
        if let Err(e) = self
            .accounting
            .record_sale_reversal(
                order.id,
                &order.order_number,
                order.total_amount,
                order.amount_paid,
                order.payment_method,
            )
            .await
        {
            error!(order_id = %order.id, error = %e, "Failed to write accounting reversal");
        }
        self.emit(Event::SalesOrderCancelled(id)).await;
        info!(order_id = %id, order_number = %order.order_number, "Sales order cancelled");
        self.get_order(id).await
    }

    /// Deletes the order after running the same reversal as cancellation.
    /// Cancelled orders delete without further reversal; shipped and delivered
    /// orders, and orders with returns, refuse.
    #[instrument(skip(self), fields(order_id = %id))]
    pub async fn delete_order(&self, id: Uuid, actor: &str) -> Result<(), ServiceError> {
        let db = &*self.db_pool;
        let order = self.require_order(id).await?;
        if matches!(order.status, OrderStatus::Shipped | OrderStatus::Delivered) {
            return Err(ServiceError::ValidationError(format!(
                "Sales order {} is {} and cannot be deleted",
                order.order_number, order.status
            )));
        }
        let return_count = sale_return::Entity::find()
            .filter(sale_return::Column::OrderId.eq(id))
            .count(db)
            .await
            .map_err(ServiceError::DatabaseError)?;
        if return_count > 0 {
            return Err(ServiceError::Conflict(format!(
                "Sales order {} has returns recorded against it; delete the returns first",
                order.order_number
            )));
        }

        let already_reversed = order.status == OrderStatus::Cancelled;
        let items = self.order_items(id).await?;

        let mut compensation = CompensationStack::new();
        if !already_reversed {
            self.restore_item_stock(&items, id, "order_deleted", actor, &mut compensation)
                .await?;
        }

        let removal = self.persist_order_removal(&order, already_reversed).await;
        if let Err(err) = removal {
            let failures = compensation.unwind(&self.stock).await;
            return Err(resolve_unwind(err, failures));
        }

        if !already_reversed {
            if let Err(e) = self
                .accounting
                .record_sale_reversal(
                    order.id,
                    &order.order_number,
                    order.total_amount,
                    order.amount_paid,
                    order.payment_method,
                )
                .await
            {
                error!(order_id = %order.id, error = %e, "Failed to write accounting reversal");
            }
        }
        self.emit(Event::SalesOrderDeleted(id)).await;
        info!(order_id = %id, order_number = %order.order_number, "Sales order deleted");
        Ok(())
    }

    async fn restore_item_stock(
        &self,
        items: &[sales_order_item::Model],
        order_id: Uuid,
        reason: &str,
        actor: &str,
        compensation: &mut CompensationStack,
    ) -> Result<(), ServiceError> {
        for item in items {
            let moved = self
                .stock
                .update_stock(StockUpdateInput {
                    product_id: item.product_id,
                    movement_type: MovementType::In,
                    quantity: item.quantity,
                    unit_cost: None,
                    reason: reason.to_string(),
                    reference_type: Some("sales_order".to_string()),
                    reference_id: Some(order_id),
                    performed_by: actor.to_string(),
                })
                .await;
            match moved {
                Ok(_) => compensation.push(
                    format!("re-remove stock for product {}", item.product_id),
                    StockUpdateInput {
                        product_id: item.product_id,
                        movement_type: MovementType::Out,
                        quantity: item.quantity,
                        unit_cost: None,
                        reason: "compensation".to_string(),
                        reference_type: Some("sales_order".to_string()),
                        reference_id: Some(order_id),
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

    /// Reverses the order's balance contribution and marks it cancelled: the
    /// unpaid portion leaves the bucket it occupies and any advance credited by
    /// its payments is drained.
    async fn persist_order_reversal(&self, order: &sales_order::Model) -> Result<(), ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;
        self.reverse_balance_contribution(&txn, order).await?;
        let update = sales_order::Entity::update_many()
            .col_expr(
                sales_order::Column::Status,
                Expr::value(OrderStatus::Cancelled),
            )
            .col_expr(sales_order::Column::Version, Expr::value(order.version + 1))
            .col_expr(sales_order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(sales_order::Column::Id.eq(order.id))
            .filter(sales_order::Column::Version.eq(order.version))
            .exec(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
        if update.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(order.id));
        }
        txn.commit().await.map_err(ServiceError::DatabaseError)
    }

    async fn persist_order_removal(
        &self,
        order: &sales_order::Model,
        already_reversed: bool,
    ) -> Result<(), ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;
        if !already_reversed {
            self.reverse_balance_contribution(&txn, order).await?;
        }
        sales_order_item::Entity::delete_many()
            .filter(sales_order_item::Column::OrderId.eq(order.id))
            .exec(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
        sales_order::Entity::delete_by_id(order.id)
            .exec(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
        txn.commit().await.map_err(ServiceError::DatabaseError)
    }

    async fn reverse_balance_contribution(
        &self,
        txn: &sea_orm::DatabaseTransaction,
        order: &sales_order::Model,
    ) -> Result<(), ServiceError> {
        let party = PartyRef::customer(order.customer_id);
        let bucket = if order.status.is_posted() {
            BalanceBucket::Posted
        } else {
            BalanceBucket::Pending
        };
        self.balance
            .reverse_charge(txn, party, order.unpaid_amount(), bucket)
            .await?;
        let advance_drain = PaymentSplit {
            applied_to_balance: Decimal::ZERO,
            credited_to_advance: order.advance_credited,
        };
        self.balance
            .reverse_payment_split(txn, party, &advance_drain, bucket)
            .await
    }

    async fn require_order(&self, id: Uuid) -> Result<sales_order::Model, ServiceError> {
        let db = &*self.db_pool;
        sales_order::Entity::find_by_id(id)
            .one(db)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("Sales order {} not found", id)))
    }

    async fn order_items(
        &self,
        id: Uuid,
    ) -> Result<Vec<sales_order_item::Model>, ServiceError> {
        let db = &*self.db_pool;
        sales_order_item::Entity::find()
            .filter(sales_order_item::Column::OrderId.eq(id))
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)
    }

    async fn load_products(
        &self,
        items: &[OrderItemRequest],
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
    use rust_decimal_macros::dec;

    fn test_product(price: Decimal) -> product::Model {
        product::Model {
            id: Uuid::new_v4(),
            sku: "SKU-1".to_string(),
            name: "Widget".to_string(),
            category: None,
            unit_price: price,
            unit_cost: dec!(3),
            current_stock: dec!(10),
            status: ProductStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn item_for(product: &product::Model, quantity: Decimal) -> OrderItemRequest {
        OrderItemRequest {
            product_id: product.id,
            quantity,
            unit_price: None,
            discount_amount: None,
        }
    }

    #[test]
    fn line_pricing_applies_tax_on_the_discounted_amount() {
        let product = test_product(dec!(10));
        let item = OrderItemRequest {
            product_id: product.id,
            quantity: dec!(3),
            unit_price: None,
            discount_amount: Some(dec!(5)),
        };
        let line = price_line(&product, &item, dec!(0.1)).unwrap();
        assert_eq!(line.tax_amount, dec!(2.5));
        assert_eq!(line.line_total, dec!(27.5));
    }

    #[test]
    fn line_pricing_rounds_to_four_decimals() {
        let product = test_product(dec!(3.3333));
        let item = item_for(&product, dec!(3));
        let line = price_line(&product, &item, dec!(0.1)).unwrap();
        assert_eq!(line.line_total, dec!(10.9999));
        assert_eq!(line.tax_amount, dec!(1.0000));
    }

    #[test]
    fn discount_larger_than_the_line_is_rejected() {
        let product = test_product(dec!(10));
        let item = OrderItemRequest {
            product_id: product.id,
            quantity: dec!(1),
            unit_price: None,
            discount_amount: Some(dec!(11)),
        };
        assert!(matches!(
            price_line(&product, &item, Decimal::ZERO),
            Err(ServiceError::ValidationError(_))
        ));
    }

    #[test]
    fn archived_products_cannot_be_sold() {
        let mut product = test_product(dec!(10));
        product.status = ProductStatus::Archived;
        let item = item_for(&product, dec!(1));
        assert!(matches!(
            price_line(&product, &item, Decimal::ZERO),
            Err(ServiceError::ValidationError(_))
        ));
    }

    #[test]
    fn duplicate_product_lines_are_rejected() {
        let product = test_product(dec!(10));
        let items = vec![item_for(&product, dec!(1)), item_for(&product, dec!(2))];
        assert!(ensure_unique_products(&items).is_err());
    }

    #[test]
    fn transition_table_matches_the_lifecycle() {
        use OrderStatus::*;
        assert!(check_order_transition(Draft, Pending).is_ok());
        assert!(check_order_transition(Draft, Confirmed).is_ok());
        assert!(check_order_transition(Pending, Confirmed).is_ok());
        assert!(check_order_transition(Confirmed, Shipped).is_ok());
        assert!(check_order_transition(Shipped, Delivered).is_ok());
        assert!(check_order_transition(Pending, Cancelled).is_ok());

        assert!(check_order_transition(Confirmed, Pending).is_err());
        assert!(check_order_transition(Confirmed, Delivered).is_err());
        assert!(check_order_transition(Shipped, Cancelled).is_err());
        assert!(check_order_transition(Delivered, Shipped).is_err());
        assert!(check_order_transition(Cancelled, Pending).is_err());
    }
}
