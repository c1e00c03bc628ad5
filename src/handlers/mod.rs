pub mod customers;
pub mod expenses;
pub mod inventory;
pub mod products;
pub mod purchase_invoices;
pub mod reports;
pub mod returns;
pub mod sales_orders;
pub mod suppliers;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::events::EventSender;
use crate::services::{
    accounting::AccountingService, balance::PartyBalanceService, expenses::ExpenseService,
    parties::PartyService, products::ProductService, purchase_invoices::PurchaseInvoiceService,
    returns::ReturnsService, sales_orders::SalesOrderService, stock::InventoryStockService,
    stock_ledger::StockLedgerService,
};
use axum::http::HeaderMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use utoipa::IntoParams;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Header naming the human or system performing the request. Attribution
/// only; there is no authentication layer in front of it.
pub const ACTOR_HEADER: &str = "x-actor-id";

const DEFAULT_ACTOR: &str = "system";

/// Actor recorded on documents and stock movements, from the request header
/// or the system fallback.
pub fn actor_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(ACTOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| DEFAULT_ACTOR.to_string())
}

/// Pagination parameters shared by list endpoints.
#[derive(Debug, Clone, Copy, Deserialize, IntoParams)]
pub struct Pagination {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u64,
}

pub(crate) fn default_page() -> u64 {
    1
}

pub(crate) fn default_per_page() -> u64 {
    20
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: default_page(),
            per_page: default_per_page(),
        }
    }
}

impl Pagination {
    /// Clamps the requested page size to the configured ceiling.
    pub fn clamped(self, max_per_page: u64) -> Self {
        Self {
            page: self.page.max(1),
            per_page: self.per_page.clamp(1, max_per_page),
        }
    }
}

/// The fully wired service graph behind the HTTP surface. Every handler
/// reaches its service through this container.
#[derive(Clone)]
pub struct AppServices {
    pub balance: PartyBalanceService,
    pub stock: InventoryStockService,
    pub accounting: AccountingService,
    pub parties: Arc<PartyService>,
    pub products: Arc<ProductService>,
    pub sales_orders: Arc<SalesOrderService>,
    pub purchase_invoices: Arc<PurchaseInvoiceService>,
    pub returns: Arc<ReturnsService>,
    pub expenses: Arc<ExpenseService>,
    pub stock_ledger: Arc<StockLedgerService>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Option<Arc<EventSender>>,
        config: &AppConfig,
    ) -> Self {
        let default_tax_rate =
            Decimal::from_f64_retain(config.default_tax_rate).unwrap_or(Decimal::ZERO);

        let balance = PartyBalanceService::new(event_sender.clone());
        let stock = InventoryStockService::new(db_pool.clone(), event_sender.clone());
        let accounting =
            AccountingService::new(db_pool.clone(), config.default_currency.clone());

        let parties = Arc::new(PartyService::new(db_pool.clone(), balance.clone()));
        let products = Arc::new(ProductService::new(db_pool.clone()));
        let sales_orders = Arc::new(SalesOrderService::new(
            db_pool.clone(),
            balance.clone(),
            stock.clone(),
            accounting.clone(),
            event_sender.clone(),
            default_tax_rate,
        ));
        let purchase_invoices = Arc::new(PurchaseInvoiceService::new(
            db_pool.clone(),
            balance.clone(),
            stock.clone(),
            accounting.clone(),
            event_sender.clone(),
        ));
        let returns = Arc::new(ReturnsService::new(
            db_pool.clone(),
            balance.clone(),
            stock.clone(),
            accounting.clone(),
            event_sender.clone(),
        ));
        let expenses = Arc::new(ExpenseService::new(
            db_pool.clone(),
            balance.clone(),
            accounting.clone(),
            event_sender,
        ));
        let stock_ledger = Arc::new(StockLedgerService::new(db_pool));

        Self {
            balance,
            stock,
            accounting,
            parties,
            products,
            sales_orders,
            purchase_invoices,
            returns,
            expenses,
            stock_ledger,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn actor_defaults_to_system() {
        let headers = HeaderMap::new();
        assert_eq!(actor_from_headers(&headers), "system");
    }

    #[test]
    fn actor_comes_from_the_header_trimmed() {
        let mut headers = HeaderMap::new();
        headers.insert(ACTOR_HEADER, HeaderValue::from_static("  clerk-7 "));
        assert_eq!(actor_from_headers(&headers), "clerk-7");
    }

    #[test]
    fn blank_actor_header_falls_back() {
        let mut headers = HeaderMap::new();
        headers.insert(ACTOR_HEADER, HeaderValue::from_static("   "));
        assert_eq!(actor_from_headers(&headers), "system");
    }

    #[test]
    fn pagination_clamps_to_the_ceiling() {
        let p = Pagination {
            page: 0,
            per_page: 500,
        }
        .clamped(100);
        assert_eq!(p.page, 1);
        assert_eq!(p.per_page, 100);
    }
}
