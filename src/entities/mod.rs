pub mod accounting_entry;
pub mod customer;
pub mod expense_payment;
pub mod inventory_stock;
pub mod product;
pub mod purchase_invoice;
pub mod purchase_invoice_item;
pub mod purchase_return;
pub mod purchase_return_item;
pub mod recurring_expense;
pub mod sale_return;
pub mod sale_return_item;
pub mod sales_order;
pub mod sales_order_item;
pub mod stock_movement;
pub mod supplier;
