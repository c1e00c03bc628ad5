use crate::{
    db::DbPool,
    entities::{
        customer, product,
        purchase_invoice::{self, InvoiceStatus},
        purchase_invoice_item, purchase_return, purchase_return_item, sale_return,
        sale_return_item,
        sales_order::{self, OrderStatus},
        sales_order_item, stock_movement, supplier,
    },
    errors::ServiceError,
    services::stock::DAMAGE_REFERENCE,
};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use lazy_static::lazy_static;
use prometheus::IntCounter;
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

lazy_static! {
    static ref LEDGER_REPORTS_BUILT: IntCounter = IntCounter::new(
        "stock_ledger_reports_built_total",
        "Total number of stock ledger reconstructions served"
    )
    .expect("metric can be created");
}

/// The document families a ledger entry can come from. String forms appear in
/// filters and JSON payloads.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    ToSchema,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LedgerDocumentType {
    Sale,
    Purchase,
    SaleReturn,
    PurchaseReturn,
    Damage,
}

/// One reconstructed ledger line. Quantity and amount are signed: sales and
/// purchase returns take stock and value out, purchases and sale returns bring
/// them back, damage is always a write-down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LedgerEntry {
    pub date: NaiveDate,
    pub document_type: LedgerDocumentType,
    pub document_number: String,
    pub document_id: Uuid,
    pub party_name: Option<String>,
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: Decimal,
    pub amount: Decimal,
}

/// Ledger entry with the product's running quantity after the entry.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LedgerRow {
    #[serde(flatten)]
    pub entry: LedgerEntry,
    pub running_quantity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProductLedger {
    pub product_id: Uuid,
    pub product_name: String,
    pub entries: Vec<LedgerRow>,
    pub net_quantity: Decimal,
    pub net_amount: Decimal,
}

/// The full reconstruction: product groups for the requested page plus the
/// totals of the whole filtered set.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StockLedgerReport {
    pub products: Vec<ProductLedger>,
    pub page: u64,
    pub per_page: u64,
    pub total_products: u64,
    pub total_quantity: Decimal,
    pub total_amount: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct LedgerFilters {
    /// First day included in the report.
    pub from_date: Option<NaiveDate>,
    /// Last day included in the report.
    pub to_date: Option<NaiveDate>,
    pub product_id: Option<Uuid>,
    pub customer_id: Option<Uuid>,
    pub supplier_id: Option<Uuid>,
    /// Substring match on the document number.
    pub document_number: Option<String>,
    /// Restricts the report to these document families; absent means all.
    pub document_types: Option<Vec<LedgerDocumentType>>,
}

impl LedgerFilters {
    fn wants(&self, document_type: LedgerDocumentType) -> bool {
        match &self.document_types {
            Some(types) => types.contains(&document_type),
            None => true,
        }
    }
}

// UTC instants bounding the inclusive day range, end exclusive.
fn day_bounds(
    filters: &LedgerFilters,
) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let start = filters
        .from_date
        .map(|d| Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN)));
    let end = filters
        .to_date
        .and_then(|d| d.succ_opt())
        .map(|d| Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN)));
    (start, end)
}

fn sort_entries(entries: &mut [LedgerEntry]) {
    entries.sort_by(|a, b| {
        a.date
            .cmp(&b.date)
            .then_with(|| a.document_number.cmp(&b.document_number))
    });
}

/// Buckets sorted entries per product, accumulates the running quantity and
/// the per-product nets, and orders the groups by product name.
fn group_by_product(
    entries: Vec<LedgerEntry>,
    catalog_names: &HashMap<Uuid, String>,
) -> Vec<ProductLedger> {
    let mut buckets: HashMap<Uuid, Vec<LedgerEntry>> = HashMap::new();
    for entry in entries {
        buckets.entry(entry.product_id).or_default().push(entry);
    }

    let mut products: Vec<ProductLedger> = buckets
        .into_iter()
        .map(|(product_id, group)| {
            let product_name = catalog_names
                .get(&product_id)
                .cloned()
                .unwrap_or_else(|| group[0].product_name.clone());
            let mut running = Decimal::ZERO;
            let mut net_amount = Decimal::ZERO;
            let rows = group
                .into_iter()
                .map(|entry| {
                    running += entry.quantity;
                    net_amount += entry.amount;
                    LedgerRow {
                        running_quantity: running,
                        entry,
                    }
                })
                .collect();
            ProductLedger {
                product_id,
                product_name,
                entries: rows,
                net_quantity: running,
                net_amount,
            }
        })
        .collect();

    products.sort_by(|a, b| {
        a.product_name
            .cmp(&b.product_name)
            .then_with(|| a.product_id.cmp(&b.product_id))
    });
    products
}

/// Rebuilds per-product stock history straight from the documents; there is no
/// ledger table to drift. Cancelled orders and invoices are skipped, returns
/// and damage movements have no cancelled state.
#[derive(Clone)]
pub struct StockLedgerService {
    db_pool: Arc<DbPool>,
}

impl StockLedgerService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    #[instrument(skip(self, filters))]
    pub async fn build_report(
        &self,
        filters: &LedgerFilters,
        page: u64,
        per_page: u64,
    ) -> Result<StockLedgerReport, ServiceError> {
        let mut entries = Vec::new();
        entries.extend(self.sale_entries(filters).await?);
        entries.extend(self.purchase_entries(filters).await?);
        entries.extend(self.sale_return_entries(filters).await?);
        entries.extend(self.purchase_return_entries(filters).await?);
        entries.extend(self.damage_entries(filters).await?);
        sort_entries(&mut entries);

        let catalog_names = self.catalog_names(&entries).await?;
        let products = group_by_product(entries, &catalog_names);

        let total_products = products.len() as u64;
        let total_quantity = products.iter().map(|p| p.net_quantity).sum();
        let total_amount = products.iter().map(|p| p.net_amount).sum();

        let per_page = per_page.max(1);
        let page = page.max(1);
        let start = ((page - 1) * per_page) as usize;
        let paged = products
            .into_iter()
            .skip(start)
            .take(per_page as usize)
            .collect();

        LEDGER_REPORTS_BUILT.inc();
        info!(
            total_products = total_products,
            page = page,
            "Stock ledger reconstructed"
        );

        Ok(StockLedgerReport {
            products: paged,
            page,
            per_page,
            total_products,
            total_quantity,
            total_amount,
        })
    }

    async fn sale_entries(
        &self,
        filters: &LedgerFilters,
    ) -> Result<Vec<LedgerEntry>, ServiceError> {
        if !filters.wants(LedgerDocumentType::Sale) || filters.supplier_id.is_some() {
            return Ok(Vec::new());
        }

        let db = &*self.db_pool;
        let (start, end) = day_bounds(filters);
        let mut query = sales_order::Entity::find()
            .filter(sales_order::Column::Status.ne(OrderStatus::Cancelled));
        if let Some(customer_id) = filters.customer_id {
            query = query.filter(sales_order::Column::CustomerId.eq(customer_id));
        }
        if let Some(number) = &filters.document_number {
            query = query.filter(sales_order::Column::OrderNumber.contains(number));
        }
        if let Some(start) = start {
            query = query.filter(sales_order::Column::CreatedAt.gte(start));
        }
        if let Some(end) = end {
            query = query.filter(sales_order::Column::CreatedAt.lt(end));
        }
        let orders = query.all(db).await.map_err(ServiceError::DatabaseError)?;
        if orders.is_empty() {
            return Ok(Vec::new());
        }

        let customer_names = self
            .customer_names(orders.iter().map(|o| o.customer_id).collect())
            .await?;
        let by_id: HashMap<Uuid, &sales_order::Model> =
            orders.iter().map(|o| (o.id, o)).collect();

        let mut items_query = sales_order_item::Entity::find()
            .filter(sales_order_item::Column::OrderId.is_in(by_id.keys().copied().collect::<Vec<_>>()));
        if let Some(product_id) = filters.product_id {
            items_query = items_query.filter(sales_order_item::Column::ProductId.eq(product_id));
        }
        let items = items_query
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)?;

        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            let Some(order) = by_id.get(&item.order_id) else {
                continue;
            };
            entries.push(LedgerEntry {
                date: order.created_at.date_naive(),
                document_type: LedgerDocumentType::Sale,
                document_number: order.order_number.clone(),
                document_id: order.id,
                party_name: customer_names.get(&order.customer_id).cloned(),
                product_id: item.product_id,
                product_name: item.product_name,
                quantity: -item.quantity,
                amount: -item.line_total,
            });
        }
        Ok(entries)
    }

    async fn purchase_entries(
        &self,
        filters: &LedgerFilters,
    ) -> Result<Vec<LedgerEntry>, ServiceError> {
        if !filters.wants(LedgerDocumentType::Purchase) || filters.customer_id.is_some() {
            return Ok(Vec::new());
        }

        let db = &*self.db_pool;
        let (start, end) = day_bounds(filters);
        let mut query = purchase_invoice::Entity::find()
            .filter(purchase_invoice::Column::Status.ne(InvoiceStatus::Cancelled));
        if let Some(supplier_id) = filters.supplier_id {
            query = query.filter(purchase_invoice::Column::SupplierId.eq(supplier_id));
        }
        if let Some(number) = &filters.document_number {
            query = query.filter(purchase_invoice::Column::InvoiceNumber.contains(number));
        }
        if let Some(start) = start {
            query = query.filter(purchase_invoice::Column::CreatedAt.gte(start));
        }
        if let Some(end) = end {
            query = query.filter(purchase_invoice::Column::CreatedAt.lt(end));
        }
        let invoices = query.all(db).await.map_err(ServiceError::DatabaseError)?;
        if invoices.is_empty() {
            return Ok(Vec::new());
        }

        let supplier_names = self
            .supplier_names(invoices.iter().map(|i| i.supplier_id).collect())
            .await?;
        let by_id: HashMap<Uuid, &purchase_invoice::Model> =
            invoices.iter().map(|i| (i.id, i)).collect();

        let mut items_query = purchase_invoice_item::Entity::find().filter(
            purchase_invoice_item::Column::InvoiceId
                .is_in(by_id.keys().copied().collect::<Vec<_>>()),
        );
        if let Some(product_id) = filters.product_id {
            items_query =
                items_query.filter(purchase_invoice_item::Column::ProductId.eq(product_id));
        }
        let items = items_query
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)?;

        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            let Some(invoice) = by_id.get(&item.invoice_id) else {
                continue;
            };
            entries.push(LedgerEntry {
                date: invoice.created_at.date_naive(),
                document_type: LedgerDocumentType::Purchase,
                document_number: invoice.invoice_number.clone(),
                document_id: invoice.id,
                party_name: supplier_names.get(&invoice.supplier_id).cloned(),
                product_id: item.product_id,
                product_name: item.product_name,
                quantity: item.quantity,
                amount: item.line_total,
            });
        }
        Ok(entries)
    }

    async fn sale_return_entries(
        &self,
        filters: &LedgerFilters,
    ) -> Result<Vec<LedgerEntry>, ServiceError> {
        if !filters.wants(LedgerDocumentType::SaleReturn) || filters.supplier_id.is_some() {
            return Ok(Vec::new());
        }

        let db = &*self.db_pool;
        let (start, end) = day_bounds(filters);
        let mut query = sale_return::Entity::find();
        if let Some(customer_id) = filters.customer_id {
            query = query.filter(sale_return::Column::CustomerId.eq(customer_id));
        }
        if let Some(number) = &filters.document_number {
            query = query.filter(sale_return::Column::ReturnNumber.contains(number));
        }
        if let Some(start) = start {
            query = query.filter(sale_return::Column::CreatedAt.gte(start));
        }
        if let Some(end) = end {
            query = query.filter(sale_return::Column::CreatedAt.lt(end));
        }
        let returns = query.all(db).await.map_err(ServiceError::DatabaseError)?;
        if returns.is_empty() {
            return Ok(Vec::new());
        }

        let customer_names = self
            .customer_names(returns.iter().map(|r| r.customer_id).collect())
            .await?;
        let by_id: HashMap<Uuid, &sale_return::Model> =
            returns.iter().map(|r| (r.id, r)).collect();

        let mut items_query = sale_return_item::Entity::find().filter(
            sale_return_item::Column::ReturnId.is_in(by_id.keys().copied().collect::<Vec<_>>()),
        );
        if let Some(product_id) = filters.product_id {
            items_query = items_query.filter(sale_return_item::Column::ProductId.eq(product_id));
        }
        let items = items_query
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)?;

        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            let Some(model) = by_id.get(&item.return_id) else {
                continue;
            };
            entries.push(LedgerEntry {
                date: model.created_at.date_naive(),
                document_type: LedgerDocumentType::SaleReturn,
                document_number: model.return_number.clone(),
                document_id: model.id,
                party_name: customer_names.get(&model.customer_id).cloned(),
                product_id: item.product_id,
                product_name: item.product_name,
                quantity: item.quantity,
                amount: item.line_total,
            });
        }
        Ok(entries)
    }

    async fn purchase_return_entries(
        &self,
        filters: &LedgerFilters,
    ) -> Result<Vec<LedgerEntry>, ServiceError> {
        if !filters.wants(LedgerDocumentType::PurchaseReturn) || filters.customer_id.is_some() {
            return Ok(Vec::new());
        }

        let db = &*self.db_pool;
        let (start, end) = day_bounds(filters);
        let mut query = purchase_return::Entity::find();
        if let Some(supplier_id) = filters.supplier_id {
            query = query.filter(purchase_return::Column::SupplierId.eq(supplier_id));
        }
        if let Some(number) = &filters.document_number {
            query = query.filter(purchase_return::Column::ReturnNumber.contains(number));
        }
        if let Some(start) = start {
            query = query.filter(purchase_return::Column::CreatedAt.gte(start));
        }
        if let Some(end) = end {
            query = query.filter(purchase_return::Column::CreatedAt.lt(end));
        }
        let returns = query.all(db).await.map_err(ServiceError::DatabaseError)?;
        if returns.is_empty() {
            return Ok(Vec::new());
        }

        let supplier_names = self
            .supplier_names(returns.iter().map(|r| r.supplier_id).collect())
            .await?;
        let by_id: HashMap<Uuid, &purchase_return::Model> =
            returns.iter().map(|r| (r.id, r)).collect();

        let mut items_query = purchase_return_item::Entity::find().filter(
            purchase_return_item::Column::ReturnId
                .is_in(by_id.keys().copied().collect::<Vec<_>>()),
        );
        if let Some(product_id) = filters.product_id {
            items_query =
                items_query.filter(purchase_return_item::Column::ProductId.eq(product_id));
        }
        let items = items_query
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)?;

        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            let Some(model) = by_id.get(&item.return_id) else {
                continue;
            };
            entries.push(LedgerEntry {
                date: model.created_at.date_naive(),
                document_type: LedgerDocumentType::PurchaseReturn,
                document_number: model.return_number.clone(),
                document_id: model.id,
                party_name: supplier_names.get(&model.supplier_id).cloned(),
                product_id: item.product_id,
                product_name: item.product_name,
                quantity: -item.quantity,
                amount: -item.line_total,
            });
        }
        Ok(entries)
    }

    /// Damage write-offs come from the movement audit trail rather than a
    /// document table. They carry no party, so any party filter excludes them.
    async fn damage_entries(
        &self,
        filters: &LedgerFilters,
    ) -> Result<Vec<LedgerEntry>, ServiceError> {
        if !filters.wants(LedgerDocumentType::Damage)
            || filters.customer_id.is_some()
            || filters.supplier_id.is_some()
        {
            return Ok(Vec::new());
        }

        let db = &*self.db_pool;
        let (start, end) = day_bounds(filters);
        let mut query = stock_movement::Entity::find()
            .filter(stock_movement::Column::ReferenceType.eq(DAMAGE_REFERENCE));
        if let Some(product_id) = filters.product_id {
            query = query.filter(stock_movement::Column::ProductId.eq(product_id));
        }
        if let Some(start) = start {
            query = query.filter(stock_movement::Column::CreatedAt.gte(start));
        }
        if let Some(end) = end {
            query = query.filter(stock_movement::Column::CreatedAt.lt(end));
        }
        let movements = query.all(db).await.map_err(ServiceError::DatabaseError)?;
        if movements.is_empty() {
            return Ok(Vec::new());
        }

        let product_ids: Vec<Uuid> = movements.iter().map(|m| m.product_id).collect();
        let products = product::Entity::find()
            .filter(product::Column::Id.is_in(product_ids))
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)?;
        let names: HashMap<Uuid, String> =
            products.into_iter().map(|p| (p.id, p.name)).collect();

        let mut entries = Vec::with_capacity(movements.len());
        for movement in movements {
            let number = damage_document_number(movement.id);
            if let Some(needle) = &filters.document_number {
                if !number.contains(needle.as_str()) {
                    continue;
                }
            }
            let unit_cost = movement.unit_cost.unwrap_or(Decimal::ZERO);
            entries.push(LedgerEntry {
                date: movement.created_at.date_naive(),
                document_type: LedgerDocumentType::Damage,
                document_number: number,
                document_id: movement.id,
                party_name: None,
                product_id: movement.product_id,
                product_name: names
                    .get(&movement.product_id)
                    .cloned()
                    .unwrap_or_else(|| "unknown".to_string()),
                quantity: movement.quantity,
                amount: (movement.quantity * unit_cost).round_dp(4),
            });
        }
        Ok(entries)
    }

    async fn catalog_names(
        &self,
        entries: &[LedgerEntry],
    ) -> Result<HashMap<Uuid, String>, ServiceError> {
        let ids: Vec<Uuid> = {
            let mut seen = HashMap::new();
            for entry in entries {
                seen.entry(entry.product_id).or_insert(());
            }
            seen.into_keys().collect()
        };
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let db = &*self.db_pool;
        let products = product::Entity::find()
            .filter(product::Column::Id.is_in(ids))
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)?;
        Ok(products.into_iter().map(|p| (p.id, p.name)).collect())
    }

    async fn customer_names(
        &self,
        ids: Vec<Uuid>,
    ) -> Result<HashMap<Uuid, String>, ServiceError> {
        let db = &*self.db_pool;
        let customers = customer::Entity::find()
            .filter(customer::Column::Id.is_in(ids))
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)?;
        Ok(customers.into_iter().map(|c| (c.id, c.name)).collect())
    }

    async fn supplier_names(
        &self,
        ids: Vec<Uuid>,
    ) -> Result<HashMap<Uuid, String>, ServiceError> {
        let db = &*self.db_pool;
        let suppliers = supplier::Entity::find()
            .filter(supplier::Column::Id.is_in(ids))
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)?;
        Ok(suppliers.into_iter().map(|s| (s.id, s.name)).collect())
    }
}

fn damage_document_number(movement_id: Uuid) -> String {
    let id = movement_id.simple().to_string();
    format!("DMG-{}", id[..8].to_uppercase())
}
