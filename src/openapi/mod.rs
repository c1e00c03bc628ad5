use axum::{response::IntoResponse, routing::get, Json, Router};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Tradebook API",
        version = "1.0.0",
        description = r#"
# Tradebook Trading Operations API

An API for running a retail and wholesale trading business: customers and
suppliers with running balances, product stock with weighted-average costing,
sales orders, purchase invoices, returns, recurring expenses and a stock
ledger report reconstructed from the documents themselves.

## Actor attribution

Mutating endpoints record who performed the change. Pass the acting user in
the `X-Actor-Id` header; requests without it are attributed to `system`.

## Pagination

List endpoints accept `page` (default 1) and `per_page` (default 20, capped
by server configuration) and respond with an envelope carrying `items`,
`total`, `page`, `per_page` and `total_pages`.

## Error handling

Errors use consistent response bodies with appropriate HTTP status codes:

```json
{
  "error": "Unprocessable Entity",
  "message": "Insufficient stock for product ...",
  "details": { "requested": "5", "available": "2" },
  "request_id": "9f6b...",
  "timestamp": "2025-06-01T12:00:00Z"
}
```
        "#,
        contact(
            name = "Tradebook Maintainers",
            url = "https://github.com/tradebook/tradebook-api"
        ),
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080/api/v1", description = "Local development")
    ),
    tags(
        (name = "Customers", description = "Customer records, balances and credit checks"),
        (name = "Suppliers", description = "Supplier records and balances"),
        (name = "Products", description = "Product catalog endpoints"),
        (name = "Inventory", description = "Stock levels, adjustments, damage and reservations"),
        (name = "Sales Orders", description = "Sales order lifecycle and payments"),
        (name = "Purchase Invoices", description = "Purchase invoice lifecycle and payments"),
        (name = "Returns", description = "Sale and purchase return processing"),
        (name = "Expenses", description = "Recurring expenses and expense payments"),
        (name = "Reports", description = "Stock ledger reporting")
    ),
    components(
        schemas(
            // Common types
            crate::ApiResponse<serde_json::Value>,
            crate::PaginatedResponse<serde_json::Value>,
            crate::errors::ErrorResponse,

            // Party types
            crate::services::parties::CreateCustomerRequest,
            crate::services::parties::UpdateCustomerRequest,
            crate::services::parties::CreateSupplierRequest,
            crate::services::parties::UpdateSupplierRequest,
            crate::services::parties::CustomerResponse,
            crate::services::parties::SupplierResponse,
            crate::entities::customer::PartyStatus,
            crate::services::balance::PartyBalances,
            crate::services::balance::CreditCheck,
            crate::services::balance::BalanceRecalculation,

            // Product types
            crate::services::products::CreateProductRequest,
            crate::services::products::UpdateProductRequest,
            crate::services::products::ProductResponse,
            crate::entities::product::ProductStatus,

            // Inventory types
            crate::entities::inventory_stock::Model,
            crate::entities::stock_movement::Model,
            crate::entities::stock_movement::MovementType,
            crate::services::stock::StockUpdateResult,

            // Sales order types
            crate::services::sales_orders::CreateSalesOrderRequest,
            crate::services::sales_orders::UpdateSalesOrderRequest,
            crate::services::sales_orders::OrderItemRequest,
            crate::services::sales_orders::RecordPaymentRequest,
            crate::services::sales_orders::SalesOrderResponse,
            crate::services::sales_orders::OrderItemResponse,
            crate::entities::sales_order::OrderStatus,
            crate::entities::sales_order::PaymentStatus,
            crate::entities::sales_order::PaymentMethod,

            // Purchase invoice types
            crate::services::purchase_invoices::CreatePurchaseInvoiceRequest,
            crate::services::purchase_invoices::UpdatePurchaseInvoiceRequest,
            crate::services::purchase_invoices::InvoiceItemRequest,
            crate::services::purchase_invoices::PurchaseInvoiceResponse,
            crate::services::purchase_invoices::InvoiceItemResponse,
            crate::entities::purchase_invoice::InvoiceStatus,

            // Return types
            crate::services::returns::CreateSaleReturnRequest,
            crate::services::returns::CreatePurchaseReturnRequest,
            crate::services::returns::ReturnItemRequest,
            crate::services::returns::SaleReturnResponse,
            crate::services::returns::PurchaseReturnResponse,

            // Expense types
            crate::services::expenses::CreateExpenseRequest,
            crate::services::expenses::UpdateExpenseRequest,
            crate::services::expenses::RecordExpensePaymentRequest,
            crate::services::expenses::ExpenseResponse,
            crate::services::expenses::ExpensePaymentResponse,
            crate::entities::recurring_expense::ExpenseFrequency,

            // Report types
            crate::services::stock_ledger::LedgerDocumentType,
            crate::services::stock_ledger::LedgerEntry,
            crate::services::stock_ledger::LedgerRow,
            crate::services::stock_ledger::ProductLedger,
            crate::services::stock_ledger::StockLedgerReport,
        )
    )
)]
pub struct ApiDocV1;

async fn openapi_json() -> impl IntoResponse {
    Json(ApiDocV1::openapi())
}

/// Serves the generated document; state-agnostic so it can merge into any
/// application router.
pub fn openapi_routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/api-docs/openapi.json", get(openapi_json))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_generates_with_schemas() {
        let openapi = ApiDocV1::openapi();
        let json = serde_json::to_string_pretty(&openapi).unwrap();
        assert!(json.contains("Tradebook API"));
        assert!(json.contains("CreateSalesOrderRequest"));
        assert!(json.contains("StockLedgerReport"));
    }
}
