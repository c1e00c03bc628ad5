use crate::{
    db::DbPool,
    entities::{
        purchase_invoice::{self, InvoiceStatus},
        purchase_invoice_item, purchase_return, purchase_return_item, sale_return,
        sale_return_item,
        sales_order::{self, OrderStatus, PaymentMethod},
        sales_order_item,
        stock_movement::MovementType,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        accounting::AccountingService,
        balance::{PartyBalanceService, PartyRef, RefundSplit},
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
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

lazy_static! {
    static ref SALE_RETURNS_CREATED: IntCounter = IntCounter::new(
        "sale_returns_created_total",
        "Total number of sale returns created"
    )
    .expect("metric can be created");
    static ref PURCHASE_RETURNS_CREATED: IntCounter = IntCounter::new(
        "purchase_returns_created_total",
        "Total number of purchase returns created"
    )
    .expect("metric can be created");
    static ref RETURNS_DELETED: IntCounter = IntCounter::new(
        "returns_deleted_total",
        "Total number of returns deleted (refund and stock replayed in reverse)"
    )
    .expect("metric can be created");
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReturnItemRequest {
    pub product_id: Uuid,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateSaleReturnRequest {
    pub order_id: Uuid,
    #[validate(length(min = 1, message = "Return must contain at least one item"))]
    pub items: Vec<ReturnItemRequest>,
    pub reason: Option<String>,
    /// Settlement method for the refund; defaults to the order's method.
    pub refund_method: Option<PaymentMethod>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreatePurchaseReturnRequest {
    pub invoice_id: Uuid,
    #[validate(length(min = 1, message = "Return must contain at least one item"))]
    pub items: Vec<ReturnItemRequest>,
    pub reason: Option<String>,
    /// Settlement method for the supplier's refund; defaults to the invoice's.
    pub refund_method: Option<PaymentMethod>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct SaleReturnFilters {
    pub customer_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct PurchaseReturnFilters {
    pub supplier_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SaleReturnItemResponse {
    pub id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SaleReturnResponse {
    pub id: Uuid,
    pub return_number: String,
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub reason: Option<String>,
    pub total_amount: Decimal,
    pub refund_method: PaymentMethod,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub items: Vec<SaleReturnItemResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PurchaseReturnItemResponse {
    pub id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub line_total: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PurchaseReturnResponse {
    pub id: Uuid,
    pub return_number: String,
    pub invoice_id: Uuid,
    pub supplier_id: Uuid,
    pub reason: Option<String>,
    pub total_amount: Decimal,
    pub refund_method: PaymentMethod,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub items: Vec<PurchaseReturnItemResponse>,
}

// A return line valued from the originating document line.
#[derive(Debug)]
struct ValuedReturnLine {
    product_id: Uuid,
    product_name: String,
    quantity: Decimal,
    unit_value: Decimal,
    line_total: Decimal,
}

fn ensure_unique_return_products(items: &[ReturnItemRequest]) -> Result<(), ServiceError> {
    let mut seen = HashSet::new();
    for item in items {
        if !seen.insert(item.product_id) {
            return Err(ServiceError::ValidationError(format!(
                "Product {} appears more than once",
                item.product_id
            )));
        }
    }
    Ok(())
}

/// Values sale-return lines at the order line's effective unit value
/// (`line_total / quantity`, so discount and tax travel proportionally) and
/// enforces the per-product cap of ordered minus already returned.
fn value_sale_return_lines(
    order_number: &str,
    order_items: &[sales_order_item::Model],
    already_returned: &HashMap<Uuid, Decimal>,
    items: &[ReturnItemRequest],
) -> Result<Vec<ValuedReturnLine>, ServiceError> {
    let by_product: HashMap<Uuid, &sales_order_item::Model> =
        order_items.iter().map(|i| (i.product_id, i)).collect();

    let mut lines = Vec::with_capacity(items.len());
    for item in items {
        if item.quantity <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Return quantity must be positive".to_string(),
            ));
        }
        let order_item = by_product.get(&item.product_id).ok_or_else(|| {
            ServiceError::ValidationError(format!(
                "Product {} is not on order {}",
                item.product_id, order_number
            ))
        })?;
        let prior = already_returned
            .get(&item.product_id)
            .copied()
            .unwrap_or(Decimal::ZERO);
        let returnable = order_item.quantity - prior;
        if item.quantity > returnable {
            return Err(ServiceError::ValidationError(format!(
                "Cannot return {} of product {}: {} ordered, {} already returned",
                item.quantity, item.product_id, order_item.quantity, prior
            )));
        }

        let unit_value = order_item.line_total / order_item.quantity;
        lines.push(ValuedReturnLine {
            product_id: item.product_id,
            product_name: order_item.product_name.clone(),
            quantity: item.quantity,
            unit_value: unit_value.round_dp(4),
            line_total: (unit_value * item.quantity).round_dp(4),
        });
    }
    Ok(lines)
}

/// Values purchase-return lines at the invoiced unit cost. Stock availability
/// is the guard here; the outbound movement rejects what the shelves lack.
fn value_purchase_return_lines(
    invoice_number: &str,
    invoice_items: &[purchase_invoice_item::Model],
    items: &[ReturnItemRequest],
) -> Result<Vec<ValuedReturnLine>, ServiceError> {
    let by_product: HashMap<Uuid, &purchase_invoice_item::Model> =
        invoice_items.iter().map(|i| (i.product_id, i)).collect();

    let mut lines = Vec::with_capacity(items.len());
    for item in items {
        if item.quantity <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Return quantity must be positive".to_string(),
            ));
        }
        let invoice_item = by_product.get(&item.product_id).ok_or_else(|| {
            ServiceError::ValidationError(format!(
                "Product {} is not on invoice {}",
                item.product_id, invoice_number
            ))
        })?;

        lines.push(ValuedReturnLine {
            product_id: item.product_id,
            product_name: invoice_item.product_name.clone(),
            quantity: item.quantity,
            unit_value: invoice_item.unit_cost,
            line_total: (invoice_item.unit_cost * item.quantity).round_dp(4),
        });
    }
    Ok(lines)
}

fn sale_return_response(
    model: sale_return::Model,
    items: Vec<sale_return_item::Model>,
) -> SaleReturnResponse {
    SaleReturnResponse {
        id: model.id,
        return_number: model.return_number,
        order_id: model.order_id,
        customer_id: model.customer_id,
        reason: model.reason,
        total_amount: model.total_amount,
        refund_method: model.refund_method,
        created_by: model.created_by,
        created_at: model.created_at,
        items: items
            .into_iter()
            .map(|item| SaleReturnItemResponse {
                id: item.id,
                product_id: item.product_id,
                product_name: item.product_name,
                quantity: item.quantity,
                unit_price: item.unit_price,
                line_total: item.line_total,
            })
            .collect(),
    }
}

fn purchase_return_response(
    model: purchase_return::Model,
    items: Vec<purchase_return_item::Model>,
) -> PurchaseReturnResponse {
    PurchaseReturnResponse {
        id: model.id,
        return_number: model.return_number,
        invoice_id: model.invoice_id,
        supplier_id: model.supplier_id,
        reason: model.reason,
        total_amount: model.total_amount,
        refund_method: model.refund_method,
        created_by: model.created_by,
        created_at: model.created_at,
        items: items
            .into_iter()
            .map(|item| PurchaseReturnItemResponse {
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

/// Handles both return families. Sale returns bring stock back in and refund
/// the customer; purchase returns send stock out and recover credit from the
/// supplier. Deleting a return replays its stock and refund moves in reverse.
#[derive(Clone)]
pub struct ReturnsService {
    db_pool: Arc<DbPool>,
    balance: PartyBalanceService,
    stock: InventoryStockService,
    accounting: AccountingService,
    event_sender: Option<Arc<EventSender>>,
}

impl ReturnsService {
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
                warn!(error = %e, "Failed to send return event");
            }
        }
    }

    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn create_sale_return(
        &self,
        request: CreateSaleReturnRequest,
        actor: &str,
    ) -> Result<SaleReturnResponse, ServiceError> {
        request.validate()?;
        ensure_unique_return_products(&request.items)?;

        let db = &*self.db_pool;
        let order = sales_order::Entity::find_by_id(request.order_id)
            .one(db)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Sales order {} not found", request.order_id))
            })?;
        if order.status == OrderStatus::Cancelled {
            return Err(ServiceError::ValidationError(format!(
                "Order {} is cancelled; nothing left to return",
                order.order_number
            )));
        }

        let order_items = sales_order_item::Entity::find()
            .filter(sales_order_item::Column::OrderId.eq(order.id))
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)?;
        let already_returned = self.returned_quantities_for_order(order.id).await?;
        let lines = value_sale_return_lines(
            &order.order_number,
            &order_items,
            &already_returned,
            &request.items,
        )?;
        let total: Decimal = lines.iter().map(|l| l.line_total).sum();
        let refund_method = request.refund_method.unwrap_or(order.payment_method);

        let return_id = Uuid::new_v4();
        let mut compensation = CompensationStack::new();
        for line in &lines {
            let moved = self
                .stock
                .update_stock(StockUpdateInput {
                    product_id: line.product_id,
                    movement_type: MovementType::In,
                    quantity: line.quantity,
                    unit_cost: None,
                    reason: "sale_return".to_string(),
                    reference_type: Some("sale_return".to_string()),
                    reference_id: Some(return_id),
                    performed_by: actor.to_string(),
                })
                .await;
            match moved {
                Ok(_) => compensation.push(
                    format!("take back restocked product {}", line.product_id),
                    StockUpdateInput {
                        product_id: line.product_id,
                        movement_type: MovementType::Out,
                        quantity: line.quantity,
                        unit_cost: None,
                        reason: "compensation".to_string(),
                        reference_type: Some("sale_return".to_string()),
                        reference_id: Some(return_id),
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
            .persist_sale_return(return_id, &order, &request, lines, total, refund_method, actor)
            .await;
        let (model, items) = match persisted {
            Ok(pair) => pair,
            Err(err) => {
                let failures = compensation.unwind(&self.stock).await;
                return Err(resolve_unwind(err, failures));
            }
        };

        SALE_RETURNS_CREATED.inc();
        let cash_refunded = model.total_amount - model.refunded_from_pending;
        if let Err(e) = self
            .accounting
            .record_sale_return(
                model.id,
                &model.return_number,
                model.total_amount,
                cash_refunded,
                model.refund_method,
            )
            .await
        {
            error!(return_id = %model.id, error = %e, "Failed to write accounting entries for sale return");
        }
        self.emit(Event::SaleReturnCreated(model.id)).await;
        info!(
            return_id = %model.id,
            return_number = %model.return_number,
            order_id = %order.id,
            total = %model.total_amount,
            "Sale return created"
        );

        Ok(sale_return_response(model, items))
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_sale_return(
        &self,
        return_id: Uuid,
        order: &sales_order::Model,
        request: &CreateSaleReturnRequest,
        lines: Vec<ValuedReturnLine>,
        total: Decimal,
        refund_method: PaymentMethod,
        actor: &str,
    ) -> Result<(sale_return::Model, Vec<sale_return_item::Model>), ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;
        let party = PartyRef::customer(order.customer_id);

        let split = self.balance.record_refund(&txn, party, total).await?;

        let model = sale_return::ActiveModel {
            id: Set(return_id),
            return_number: Set(document_number("SR")),
            order_id: Set(order.id),
            customer_id: Set(order.customer_id),
            reason: Set(request.reason.clone()),
            total_amount: Set(total),
            refunded_from_advance: Set(split.from_advance),
            refunded_from_pending: Set(split.from_pending),
            refund_method: Set(refund_method),
            created_by: Set(actor.to_string()),
            created_at: Set(Utc::now()),
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::DatabaseError)?;

        let mut items = Vec::with_capacity(lines.len());
        for line in lines {
            let item = sale_return_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                return_id: Set(return_id),
                product_id: Set(line.product_id),
                product_name: Set(line.product_name),
                quantity: Set(line.quantity),
                unit_price: Set(line.unit_value),
                line_total: Set(line.line_total),
            }
            .insert(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
            items.push(item);
        }

        txn.commit().await.map_err(ServiceError::DatabaseError)?;
        Ok((model, items))
    }

    pub async fn get_sale_return(&self, id: Uuid) -> Result<SaleReturnResponse, ServiceError> {
        let db = &*self.db_pool;
        let model = self.require_sale_return(id).await?;
        let items = sale_return_item::Entity::find()
            .filter(sale_return_item::Column::ReturnId.eq(id))
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)?;
        Ok(sale_return_response(model, items))
    }

    pub async fn list_sale_returns(
        &self,
        filters: SaleReturnFilters,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<SaleReturnResponse>, u64), ServiceError> {
        let db = &*self.db_pool;
        let mut query = sale_return::Entity::find().order_by_desc(sale_return::Column::CreatedAt);
        if let Some(customer_id) = filters.customer_id {
            query = query.filter(sale_return::Column::CustomerId.eq(customer_id));
        }
        if let Some(order_id) = filters.order_id {
            query = query.filter(sale_return::Column::OrderId.eq(order_id));
        }

        let paginator = query.paginate(db, per_page);
        let total = paginator
            .num_items()
            .await
            .map_err(ServiceError::DatabaseError)?;
        let returns = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::DatabaseError)?;

        let ids: Vec<Uuid> = returns.iter().map(|r| r.id).collect();
        let mut items_by_return: HashMap<Uuid, Vec<sale_return_item::Model>> = HashMap::new();
        if !ids.is_empty() {
            let items = sale_return_item::Entity::find()
                .filter(sale_return_item::Column::ReturnId.is_in(ids))
                .all(db)
                .await
                .map_err(ServiceError::DatabaseError)?;
            for item in items {
                items_by_return.entry(item.return_id).or_default().push(item);
            }
        }

        let responses = returns
            .into_iter()
            .map(|model| {
                let items = items_by_return.remove(&model.id).unwrap_or_default();
                sale_return_response(model, items)
            })
            .collect();
        Ok((responses, total))
    }

    /// Deletes a sale return: the restocked goods go back out (availability
    /// checked, so a return whose goods were resold refuses), the refund split
    /// is reversed, and the rows are removed.
    #[instrument(skip(self), fields(return_id = %id))]
    pub async fn delete_sale_return(&self, id: Uuid, actor: &str) -> Result<(), ServiceError> {
        let db = &*self.db_pool;
        let model = self.require_sale_return(id).await?;
        let items = sale_return_item::Entity::find()
            .filter(sale_return_item::Column::ReturnId.eq(id))
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)?;

        let mut compensation = CompensationStack::new();
        for item in &items {
            let moved = self
                .stock
                .update_stock(StockUpdateInput {
                    product_id: item.product_id,
                    movement_type: MovementType::Out,
                    quantity: item.quantity,
                    unit_cost: None,
                    reason: "sale_return_deleted".to_string(),
                    reference_type: Some("sale_return".to_string()),
                    reference_id: Some(id),
                    performed_by: actor.to_string(),
                })
                .await;
            match moved {
                Ok(_) => compensation.push(
                    format!("restock product {}", item.product_id),
                    StockUpdateInput {
                        product_id: item.product_id,
                        movement_type: MovementType::In,
                        quantity: item.quantity,
                        unit_cost: None,
                        reason: "compensation".to_string(),
                        reference_type: Some("sale_return".to_string()),
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

        let removed = self.persist_sale_return_removal(&model).await;
        if let Err(err) = removed {
            let failures = compensation.unwind(&self.stock).await;
            return Err(resolve_unwind(err, failures));
        }

        RETURNS_DELETED.inc();
        let cash_refunded = model.total_amount - model.refunded_from_pending;
        if let Err(e) = self
            .accounting
            .record_sale_return_reversal(
                model.id,
                &model.return_number,
                model.total_amount,
                cash_refunded,
                model.refund_method,
            )
            .await
        {
            error!(return_id = %model.id, error = %e, "Failed to write accounting entries for sale return deletion");
        }
        self.emit(Event::SaleReturnDeleted(model.id)).await;
        info!(
            return_id = %model.id,
            return_number = %model.return_number,
            "Sale return deleted"
        );
        Ok(())
    }

    async fn persist_sale_return_removal(
        &self,
        model: &sale_return::Model,
    ) -> Result<(), ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;
        let party = PartyRef::customer(model.customer_id);
        let split = RefundSplit {
            from_advance: model.refunded_from_advance,
            from_pending: model.refunded_from_pending,
        };
        self.balance.reverse_refund_split(&txn, party, &split).await?;
        sale_return_item::Entity::delete_many()
            .filter(sale_return_item::Column::ReturnId.eq(model.id))
            .exec(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
        sale_return::Entity::delete_by_id(model.id)
            .exec(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
        txn.commit().await.map_err(ServiceError::DatabaseError)
    }

    #[instrument(skip(self, request), fields(invoice_id = %request.invoice_id))]
    pub async fn create_purchase_return(
        &self,
        request: CreatePurchaseReturnRequest,
        actor: &str,
    ) -> Result<PurchaseReturnResponse, ServiceError> {
        request.validate()?;
        ensure_unique_return_products(&request.items)?;

        let db = &*self.db_pool;
        let invoice = purchase_invoice::Entity::find_by_id(request.invoice_id)
            .one(db)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Purchase invoice {} not found",
                    request.invoice_id
                ))
            })?;
        if invoice.status == InvoiceStatus::Cancelled {
            return Err(ServiceError::ValidationError(format!(
                "Invoice {} is cancelled; nothing left to return",
                invoice.invoice_number
            )));
        }

        let invoice_items = purchase_invoice_item::Entity::find()
            .filter(purchase_invoice_item::Column::InvoiceId.eq(invoice.id))
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)?;
        let lines =
            value_purchase_return_lines(&invoice.invoice_number, &invoice_items, &request.items)?;
        let total: Decimal = lines.iter().map(|l| l.line_total).sum();
        let refund_method = request.refund_method.unwrap_or(invoice.payment_method);

        let return_id = Uuid::new_v4();
        let mut compensation = CompensationStack::new();
        for line in &lines {
            let moved = self
                .stock
                .update_stock(StockUpdateInput {
                    product_id: line.product_id,
                    movement_type: MovementType::Out,
                    quantity: line.quantity,
                    unit_cost: None,
                    reason: "purchase_return".to_string(),
                    reference_type: Some("purchase_return".to_string()),
                    reference_id: Some(return_id),
                    performed_by: actor.to_string(),
                })
                .await;
            match moved {
                Ok(_) => compensation.push(
                    format!("restore outbound product {}", line.product_id),
                    StockUpdateInput {
                        product_id: line.product_id,
                        movement_type: MovementType::In,
                        quantity: line.quantity,
                        unit_cost: None,
                        reason: "compensation".to_string(),
                        reference_type: Some("purchase_return".to_string()),
                        reference_id: Some(return_id),
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
            .persist_purchase_return(
                return_id,
                &invoice,
                &request,
                lines,
                total,
                refund_method,
                actor,
            )
            .await;
        let (model, items) = match persisted {
            Ok(pair) => pair,
            Err(err) => {
                let failures = compensation.unwind(&self.stock).await;
                return Err(resolve_unwind(err, failures));
            }
        };

        PURCHASE_RETURNS_CREATED.inc();
        let cash_recovered = model.total_amount - model.refunded_from_pending;
        if let Err(e) = self
            .accounting
            .record_purchase_return(
                model.id,
                &model.return_number,
                model.total_amount,
                cash_recovered,
                model.refund_method,
            )
            .await
        {
            error!(return_id = %model.id, error = %e, "Failed to write accounting entries for purchase return");
        }
        self.emit(Event::PurchaseReturnCreated(model.id)).await;
        info!(
            return_id = %model.id,
            return_number = %model.return_number,
            invoice_id = %invoice.id,
            total = %model.total_amount,
            "Purchase return created"
        );

        Ok(purchase_return_response(model, items))
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_purchase_return(
        &self,
        return_id: Uuid,
        invoice: &purchase_invoice::Model,
        request: &CreatePurchaseReturnRequest,
        lines: Vec<ValuedReturnLine>,
        total: Decimal,
        refund_method: PaymentMethod,
        actor: &str,
    ) -> Result<(purchase_return::Model, Vec<purchase_return_item::Model>), ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;
        let party = PartyRef::supplier(invoice.supplier_id);

        let split = self.balance.record_refund(&txn, party, total).await?;

        let model = purchase_return::ActiveModel {
            id: Set(return_id),
            return_number: Set(document_number("PR")),
            invoice_id: Set(invoice.id),
            supplier_id: Set(invoice.supplier_id),
            reason: Set(request.reason.clone()),
            total_amount: Set(total),
            refunded_from_advance: Set(split.from_advance),
            refunded_from_pending: Set(split.from_pending),
            refund_method: Set(refund_method),
            created_by: Set(actor.to_string()),
            created_at: Set(Utc::now()),
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::DatabaseError)?;

        let mut items = Vec::with_capacity(lines.len());
        for line in lines {
            let item = purchase_return_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                return_id: Set(return_id),
                product_id: Set(line.product_id),
                product_name: Set(line.product_name),
                quantity: Set(line.quantity),
                unit_cost: Set(line.unit_value),
                line_total: Set(line.line_total),
            }
            .insert(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
            items.push(item);
        }

        txn.commit().await.map_err(ServiceError::DatabaseError)?;
        Ok((model, items))
    }

    pub async fn get_purchase_return(
        &self,
        id: Uuid,
    ) -> Result<PurchaseReturnResponse, ServiceError> {
        let db = &*self.db_pool;
        let model = self.require_purchase_return(id).await?;
        let items = purchase_return_item::Entity::find()
            .filter(purchase_return_item::Column::ReturnId.eq(id))
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)?;
        Ok(purchase_return_response(model, items))
    }

    pub async fn list_purchase_returns(
        &self,
        filters: PurchaseReturnFilters,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<PurchaseReturnResponse>, u64), ServiceError> {
        let db = &*self.db_pool;
        let mut query =
            purchase_return::Entity::find().order_by_desc(purchase_return::Column::CreatedAt);
        if let Some(supplier_id) = filters.supplier_id {
            query = query.filter(purchase_return::Column::SupplierId.eq(supplier_id));
        }
        if let Some(invoice_id) = filters.invoice_id {
            query = query.filter(purchase_return::Column::InvoiceId.eq(invoice_id));
        }

        let paginator = query.paginate(db, per_page);
        let total = paginator
            .num_items()
            .await
            .map_err(ServiceError::DatabaseError)?;
        let returns = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::DatabaseError)?;

        let ids: Vec<Uuid> = returns.iter().map(|r| r.id).collect();
        let mut items_by_return: HashMap<Uuid, Vec<purchase_return_item::Model>> = HashMap::new();
        if !ids.is_empty() {
            let items = purchase_return_item::Entity::find()
                .filter(purchase_return_item::Column::ReturnId.is_in(ids))
                .all(db)
                .await
                .map_err(ServiceError::DatabaseError)?;
            for item in items {
                items_by_return.entry(item.return_id).or_default().push(item);
            }
        }

        let responses = returns
            .into_iter()
            .map(|model| {
                let items = items_by_return.remove(&model.id).unwrap_or_default();
                purchase_return_response(model, items)
            })
            .collect();
        Ok((responses, total))
    }

    /// Deletes a purchase return: the goods come back onto the shelves, the
    /// supplier credit is reversed, and the rows are removed.
    #[instrument(skip(self), fields(return_id = %id))]
    pub async fn delete_purchase_return(&self, id: Uuid, actor: &str) -> Result<(), ServiceError> {
        let db = &*self.db_pool;
        let model = self.require_purchase_return(id).await?;
        let items = purchase_return_item::Entity::find()
            .filter(purchase_return_item::Column::ReturnId.eq(id))
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)?;

        let mut compensation = CompensationStack::new();
        for item in &items {
            let moved = self
                .stock
                .update_stock(StockUpdateInput {
                    product_id: item.product_id,
                    movement_type: MovementType::In,
                    quantity: item.quantity,
                    unit_cost: None,
                    reason: "purchase_return_deleted".to_string(),
                    reference_type: Some("purchase_return".to_string()),
                    reference_id: Some(id),
                    performed_by: actor.to_string(),
                })
                .await;
            match moved {
                Ok(_) => compensation.push(
                    format!("send product {} back out", item.product_id),
                    StockUpdateInput {
                        product_id: item.product_id,
                        movement_type: MovementType::Out,
                        quantity: item.quantity,
                        unit_cost: None,
                        reason: "compensation".to_string(),
                        reference_type: Some("purchase_return".to_string()),
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

        let removed = self.persist_purchase_return_removal(&model).await;
        if let Err(err) = removed {
            let failures = compensation.unwind(&self.stock).await;
            return Err(resolve_unwind(err, failures));
        }

        RETURNS_DELETED.inc();
        let cash_recovered = model.total_amount - model.refunded_from_pending;
        if let Err(e) = self
            .accounting
            .record_purchase_return_reversal(
                model.id,
                &model.return_number,
                model.total_amount,
                cash_recovered,
                model.refund_method,
            )
            .await
        {
            error!(return_id = %model.id, error = %e, "Failed to write accounting entries for purchase return deletion");
        }
        self.emit(Event::PurchaseReturnDeleted(model.id)).await;
        info!(
            return_id = %model.id,
            return_number = %model.return_number,
            "Purchase return deleted"
        );
        Ok(())
    }

    async fn persist_purchase_return_removal(
        &self,
        model: &purchase_return::Model,
    ) -> Result<(), ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;
        let party = PartyRef::supplier(model.supplier_id);
        let split = RefundSplit {
            from_advance: model.refunded_from_advance,
            from_pending: model.refunded_from_pending,
        };
        self.balance.reverse_refund_split(&txn, party, &split).await?;
        purchase_return_item::Entity::delete_many()
            .filter(purchase_return_item::Column::ReturnId.eq(model.id))
            .exec(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
        purchase_return::Entity::delete_by_id(model.id)
            .exec(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
        txn.commit().await.map_err(ServiceError::DatabaseError)
    }

    /// Sums the previously returned quantity per product across all returns of
    /// one order, feeding the over-return guard.
    async fn returned_quantities_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<HashMap<Uuid, Decimal>, ServiceError> {
        let db = &*self.db_pool;
        let return_ids: Vec<Uuid> = sale_return::Entity::find()
            .filter(sale_return::Column::OrderId.eq(order_id))
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)?
            .into_iter()
            .map(|r| r.id)
            .collect();
        if return_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let items = sale_return_item::Entity::find()
            .filter(sale_return_item::Column::ReturnId.is_in(return_ids))
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)?;
        let mut totals: HashMap<Uuid, Decimal> = HashMap::new();
        for item in items {
            *totals.entry(item.product_id).or_insert(Decimal::ZERO) += item.quantity;
        }
        Ok(totals)
    }

    async fn require_sale_return(&self, id: Uuid) -> Result<sale_return::Model, ServiceError> {
        let db = &*self.db_pool;
        sale_return::Entity::find_by_id(id)
            .one(db)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("Sale return {} not found", id)))
    }

    async fn require_purchase_return(
        &self,
        id: Uuid,
    ) -> Result<purchase_return::Model, ServiceError> {
        let db = &*self.db_pool;
        purchase_return::Entity::find_by_id(id)
            .one(db)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("Purchase return {} not found", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order_item(
        product_id: Uuid,
        quantity: Decimal,
        line_total: Decimal,
    ) -> sales_order_item::Model {
        sales_order_item::Model {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            product_id,
            product_name: "Widget".to_string(),
            quantity,
            unit_price: dec!(0),
            discount_amount: dec!(0),
            tax_amount: dec!(0),
            line_total,
        }
    }

    fn invoice_item(
        product_id: Uuid,
        quantity: Decimal,
        unit_cost: Decimal,
    ) -> purchase_invoice_item::Model {
        purchase_invoice_item::Model {
            id: Uuid::new_v4(),
            invoice_id: Uuid::new_v4(),
            product_id,
            product_name: "Widget".to_string(),
            quantity,
            unit_cost,
            line_total: (quantity * unit_cost).round_dp(4),
        }
    }

    #[test]
    fn sale_return_lines_carry_the_effective_unit_value() {
        let product_id = Uuid::new_v4();
        // 4 units sold for 44 in total, discount and tax already folded in.
        let items = vec![order_item(product_id, dec!(4), dec!(44))];
        let request = vec![ReturnItemRequest {
            product_id,
            quantity: dec!(2),
        }];

        let lines = value_sale_return_lines("SO-TEST", &items, &HashMap::new(), &request).unwrap();
        assert_eq!(lines[0].unit_value, dec!(11));
        assert_eq!(lines[0].line_total, dec!(22));
    }

    #[test]
    fn over_return_is_rejected_against_the_remaining_quantity() {
        let product_id = Uuid::new_v4();
        let items = vec![order_item(product_id, dec!(5), dec!(50))];
        let already = HashMap::from([(product_id, dec!(3))]);
        let request = vec![ReturnItemRequest {
            product_id,
            quantity: dec!(3),
        }];

        let err = value_sale_return_lines("SO-TEST", &items, &already, &request).unwrap_err();
        match err {
            ServiceError::ValidationError(msg) => {
                assert!(msg.contains("5 ordered"));
                assert!(msg.contains("3 already returned"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn returning_a_product_not_on_the_order_is_rejected() {
        let items = vec![order_item(Uuid::new_v4(), dec!(5), dec!(50))];
        let request = vec![ReturnItemRequest {
            product_id: Uuid::new_v4(),
            quantity: dec!(1),
        }];

        assert!(matches!(
            value_sale_return_lines("SO-TEST", &items, &HashMap::new(), &request),
            Err(ServiceError::ValidationError(_))
        ));
    }

    #[test]
    fn zero_quantity_returns_are_rejected() {
        let product_id = Uuid::new_v4();
        let items = vec![order_item(product_id, dec!(5), dec!(50))];
        let request = vec![ReturnItemRequest {
            product_id,
            quantity: dec!(0),
        }];

        assert!(matches!(
            value_sale_return_lines("SO-TEST", &items, &HashMap::new(), &request),
            Err(ServiceError::ValidationError(_))
        ));
    }

    #[test]
    fn duplicate_products_in_one_return_are_rejected() {
        let product_id = Uuid::new_v4();
        let request = vec![
            ReturnItemRequest {
                product_id,
                quantity: dec!(1),
            },
            ReturnItemRequest {
                product_id,
                quantity: dec!(2),
            },
        ];
        assert!(ensure_unique_return_products(&request).is_err());
    }

    #[test]
    fn purchase_return_lines_are_valued_at_the_invoiced_cost() {
        let product_id = Uuid::new_v4();
        let items = vec![invoice_item(product_id, dec!(10), dec!(7))];
        let request = vec![ReturnItemRequest {
            product_id,
            quantity: dec!(3),
        }];

        let lines = value_purchase_return_lines("PI-TEST", &items, &request).unwrap();
        assert_eq!(lines[0].unit_value, dec!(7));
        assert_eq!(lines[0].line_total, dec!(21));
    }
}
