//! Sale and purchase returns: restocking, refund allocation against advance
//! and pending balances, over-return protection, and exact reversal on delete.

mod common;

use common::{dec, seed_customer, seed_product, seed_stock, seed_supplier, TestApp};
use rust_decimal::Decimal;
use tradebook_api::entities::sales_order::PaymentMethod;
use tradebook_api::errors::ServiceError;
use tradebook_api::services::balance::PartyRef;
use tradebook_api::services::purchase_invoices::{
    CreatePurchaseInvoiceRequest, InvoiceItemRequest,
};
use tradebook_api::services::returns::{
    CreatePurchaseReturnRequest, CreateSaleReturnRequest, ReturnItemRequest,
};
use tradebook_api::services::sales_orders::{
    CreateSalesOrderRequest, OrderItemRequest, UpdateSalesOrderRequest,
};

async fn place_order(
    app: &TestApp,
    customer_id: uuid::Uuid,
    product_id: uuid::Uuid,
    quantity: i64,
    amount_paid: Option<i64>,
) -> tradebook_api::services::sales_orders::SalesOrderResponse {
    app.state
        .services
        .sales_orders
        .create_order(
            CreateSalesOrderRequest {
                customer_id,
                items: vec![OrderItemRequest {
                    product_id,
                    quantity: dec(quantity),
                    unit_price: None,
                    discount_amount: None,
                }],
                payment_method: PaymentMethod::Cash,
                amount_paid: amount_paid.map(dec),
                status: None,
                notes: None,
            },
            "clerk",
        )
        .await
        .expect("failed to place order")
}

async fn receive_invoice(
    app: &TestApp,
    supplier_id: uuid::Uuid,
    product_id: uuid::Uuid,
    quantity: i64,
    unit_cost: i64,
) -> tradebook_api::services::purchase_invoices::PurchaseInvoiceResponse {
    app.state
        .services
        .purchase_invoices
        .create_invoice(
            CreatePurchaseInvoiceRequest {
                supplier_id,
                items: vec![InvoiceItemRequest {
                    product_id,
                    quantity: dec(quantity),
                    unit_cost: Some(dec(unit_cost)),
                }],
                payment_method: PaymentMethod::BankTransfer,
                amount_paid: None,
                discount_total: None,
                tax_total: None,
                status: None,
                notes: None,
            },
            "buyer",
        )
        .await
        .expect("failed to receive invoice")
}

fn return_items(product_id: uuid::Uuid, quantity: i64) -> Vec<ReturnItemRequest> {
    vec![ReturnItemRequest {
        product_id,
        quantity: dec(quantity),
    }]
}

#[tokio::test]
async fn sale_return_restocks_and_drains_advance_first() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Corner Shop", 10_000).await;
    let product_id = seed_product(&app, "RET-100", 250, 100).await;
    seed_stock(&app, product_id, 10, 100).await;

    // Overpaying by 200 leaves the customer holding an advance.
    let order = place_order(&app, customer_id, product_id, 4, Some(1200)).await;

    let ret = app
        .state
        .services
        .returns
        .create_sale_return(
            CreateSaleReturnRequest {
                order_id: order.id,
                items: return_items(product_id, 2),
                reason: Some("wrong size".to_string()),
                refund_method: None,
            },
            "clerk",
        )
        .await
        .unwrap();

    assert!(ret.return_number.starts_with("SR-"));
    assert_eq!(ret.total_amount, dec(500));
    assert_eq!(ret.customer_id, customer_id);

    let record = app
        .state
        .services
        .stock
        .get_stock(product_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.current_stock, dec(8));

    // 200 of the 500 refund came out of the advance; the rest was cash back.
    let balances = app
        .state
        .services
        .balance
        .get_balances(app.state.db.as_ref(), PartyRef::customer(customer_id))
        .await
        .unwrap();
    assert_eq!(balances.advance_balance, Decimal::ZERO);
    assert_eq!(balances.pending_balance, Decimal::ZERO);
}

#[tokio::test]
async fn sale_return_on_unpaid_order_relieves_pending() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Corner Shop", 10_000).await;
    let product_id = seed_product(&app, "RET-101", 250, 100).await;
    seed_stock(&app, product_id, 10, 100).await;

    let order = place_order(&app, customer_id, product_id, 4, None).await;

    app.state
        .services
        .returns
        .create_sale_return(
            CreateSaleReturnRequest {
                order_id: order.id,
                items: return_items(product_id, 2),
                reason: None,
                refund_method: None,
            },
            "clerk",
        )
        .await
        .unwrap();

    let balances = app
        .state
        .services
        .balance
        .get_balances(app.state.db.as_ref(), PartyRef::customer(customer_id))
        .await
        .unwrap();
    assert_eq!(balances.pending_balance, dec(500));
}

#[tokio::test]
async fn returns_cannot_exceed_what_was_ordered() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Corner Shop", 10_000).await;
    let product_id = seed_product(&app, "RET-102", 250, 100).await;
    seed_stock(&app, product_id, 10, 100).await;
    let returns = &app.state.services.returns;

    let order = place_order(&app, customer_id, product_id, 4, None).await;

    returns
        .create_sale_return(
            CreateSaleReturnRequest {
                order_id: order.id,
                items: return_items(product_id, 3),
                reason: None,
                refund_method: None,
            },
            "clerk",
        )
        .await
        .unwrap();

    // Only one unit is still returnable.
    let err = returns
        .create_sale_return(
            CreateSaleReturnRequest {
                order_id: order.id,
                items: return_items(product_id, 2),
                reason: None,
                refund_method: None,
            },
            "clerk",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn orders_with_returns_refuse_edits_and_deletes() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Corner Shop", 10_000).await;
    let product_id = seed_product(&app, "RET-103", 250, 100).await;
    seed_stock(&app, product_id, 10, 100).await;

    let order = place_order(&app, customer_id, product_id, 4, None).await;
    app.state
        .services
        .returns
        .create_sale_return(
            CreateSaleReturnRequest {
                order_id: order.id,
                items: return_items(product_id, 1),
                reason: None,
                refund_method: None,
            },
            "clerk",
        )
        .await
        .unwrap();

    let update = app
        .state
        .services
        .sales_orders
        .update_order(
            order.id,
            UpdateSalesOrderRequest {
                items: vec![OrderItemRequest {
                    product_id,
                    quantity: dec(2),
                    unit_price: None,
                    discount_amount: None,
                }],
                notes: None,
                expected_version: None,
            },
            "clerk",
        )
        .await;
    assert!(matches!(update, Err(ServiceError::Conflict(_))));

    let delete = app
        .state
        .services
        .sales_orders
        .delete_order(order.id, "manager")
        .await;
    assert!(matches!(delete, Err(ServiceError::Conflict(_))));
}

#[tokio::test]
async fn deleting_a_sale_return_restores_the_position() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Corner Shop", 10_000).await;
    let product_id = seed_product(&app, "RET-104", 250, 100).await;
    seed_stock(&app, product_id, 10, 100).await;
    let returns = &app.state.services.returns;

    let order = place_order(&app, customer_id, product_id, 4, None).await;
    let ret = returns
        .create_sale_return(
            CreateSaleReturnRequest {
                order_id: order.id,
                items: return_items(product_id, 2),
                reason: None,
                refund_method: None,
            },
            "clerk",
        )
        .await
        .unwrap();

    returns.delete_sale_return(ret.id, "manager").await.unwrap();

    let missing = returns.get_sale_return(ret.id).await;
    assert!(matches!(missing, Err(ServiceError::NotFound(_))));

    // Stock and the customer's pending figure are back where the order left them.
    let record = app
        .state
        .services
        .stock
        .get_stock(product_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.current_stock, dec(6));

    let balances = app
        .state
        .services
        .balance
        .get_balances(app.state.db.as_ref(), PartyRef::customer(customer_id))
        .await
        .unwrap();
    assert_eq!(balances.pending_balance, dec(1000));
}

#[tokio::test]
async fn purchase_return_sends_goods_back_and_relieves_pending() {
    let app = TestApp::spawn().await;
    let supplier_id = seed_supplier(&app, "Mills & Co", 100_000).await;
    let product_id = seed_product(&app, "RET-105", 250, 100).await;

    let invoice = receive_invoice(&app, supplier_id, product_id, 10, 100).await;

    let ret = app
        .state
        .services
        .returns
        .create_purchase_return(
            CreatePurchaseReturnRequest {
                invoice_id: invoice.id,
                items: return_items(product_id, 4),
                reason: Some("damaged in transit".to_string()),
                refund_method: None,
            },
            "buyer",
        )
        .await
        .unwrap();

    assert!(ret.return_number.starts_with("PR-"));
    assert_eq!(ret.total_amount, dec(400));
    assert_eq!(ret.supplier_id, supplier_id);

    let record = app
        .state
        .services
        .stock
        .get_stock(product_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.current_stock, dec(6));

    let balances = app
        .state
        .services
        .balance
        .get_balances(app.state.db.as_ref(), PartyRef::supplier(supplier_id))
        .await
        .unwrap();
    assert_eq!(balances.pending_balance, dec(600));
}

#[tokio::test]
async fn purchase_return_cannot_exceed_what_was_received() {
    let app = TestApp::spawn().await;
    let supplier_id = seed_supplier(&app, "Mills & Co", 100_000).await;
    let product_id = seed_product(&app, "RET-106", 250, 100).await;

    let invoice = receive_invoice(&app, supplier_id, product_id, 10, 100).await;

    let err = app
        .state
        .services
        .returns
        .create_purchase_return(
            CreatePurchaseReturnRequest {
                invoice_id: invoice.id,
                items: return_items(product_id, 11),
                reason: None,
                refund_method: None,
            },
            "buyer",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ValidationError(_)));

    // The rejected return must not have moved stock.
    let record = app
        .state
        .services
        .stock
        .get_stock(product_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.current_stock, dec(10));
}

#[tokio::test]
async fn sale_returns_are_listable_by_order() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Corner Shop", 10_000).await;
    let product_id = seed_product(&app, "RET-107", 250, 100).await;
    seed_stock(&app, product_id, 10, 100).await;
    let returns = &app.state.services.returns;

    let order = place_order(&app, customer_id, product_id, 4, None).await;
    returns
        .create_sale_return(
            CreateSaleReturnRequest {
                order_id: order.id,
                items: return_items(product_id, 1),
                reason: None,
                refund_method: None,
            },
            "clerk",
        )
        .await
        .unwrap();

    let (listed, total) = returns
        .list_sale_returns(
            tradebook_api::services::returns::SaleReturnFilters {
                customer_id: None,
                order_id: Some(order.id),
            },
            1,
            20,
        )
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(listed[0].order_id, order.id);
}
