//! Purchase invoice lifecycle: goods receipt with weighted average costing,
//! supplier balance bookkeeping, payments, cancellation, and deletion.

mod common;

use common::{dec, seed_product, seed_stock, seed_supplier, TestApp};
use rust_decimal::Decimal;
use tradebook_api::entities::purchase_invoice::InvoiceStatus;
use tradebook_api::entities::sales_order::{PaymentMethod, PaymentStatus};
use tradebook_api::errors::ServiceError;
use tradebook_api::services::balance::PartyRef;
use tradebook_api::services::purchase_invoices::{
    CreatePurchaseInvoiceRequest, InvoiceItemRequest, InvoicePaymentRequest,
};

fn invoice_request(
    supplier_id: uuid::Uuid,
    product_id: uuid::Uuid,
    quantity: i64,
    unit_cost: i64,
    amount_paid: Option<i64>,
) -> CreatePurchaseInvoiceRequest {
    CreatePurchaseInvoiceRequest {
        supplier_id,
        items: vec![InvoiceItemRequest {
            product_id,
            quantity: dec(quantity),
            unit_cost: Some(dec(unit_cost)),
        }],
        payment_method: PaymentMethod::BankTransfer,
        amount_paid: amount_paid.map(dec),
        discount_total: None,
        tax_total: None,
        status: None,
        notes: None,
    }
}

#[tokio::test]
async fn receiving_an_invoice_brings_stock_in_at_invoice_cost() {
    let app = TestApp::spawn().await;
    let supplier_id = seed_supplier(&app, "Mills & Co", 100_000).await;
    let product_id = seed_product(&app, "RAW-100", 250, 100).await;
    seed_stock(&app, product_id, 10, 100).await;

    let invoice = app
        .state
        .services
        .purchase_invoices
        .create_invoice(
            invoice_request(supplier_id, product_id, 10, 140, None),
            "buyer",
        )
        .await
        .unwrap();

    assert!(invoice.invoice_number.starts_with("PI-"));
    assert_eq!(invoice.status, InvoiceStatus::Pending);
    assert_eq!(invoice.total_amount, dec(1400));
    assert_eq!(invoice.remaining_balance, dec(1400));

    let record = app
        .state
        .services
        .stock
        .get_stock(product_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.current_stock, dec(20));
    // (10 * 100 + 10 * 140) / 20
    assert_eq!(record.average_cost, dec(120));

    let balances = app
        .state
        .services
        .balance
        .get_balances(app.state.db.as_ref(), PartyRef::supplier(supplier_id))
        .await
        .unwrap();
    assert_eq!(balances.pending_balance, dec(1400));
}

#[tokio::test]
async fn invoice_discount_and_tax_are_taken_as_stated() {
    let app = TestApp::spawn().await;
    let supplier_id = seed_supplier(&app, "Mills & Co", 100_000).await;
    let product_id = seed_product(&app, "RAW-101", 250, 100).await;

    let mut request = invoice_request(supplier_id, product_id, 10, 100, None);
    request.discount_total = Some(dec(50));
    request.tax_total = Some(dec(30));

    let invoice = app
        .state
        .services
        .purchase_invoices
        .create_invoice(request, "buyer")
        .await
        .unwrap();

    assert_eq!(invoice.subtotal, dec(1000));
    assert_eq!(invoice.discount_total, dec(50));
    assert_eq!(invoice.tax_total, dec(30));
    assert_eq!(invoice.total_amount, dec(980));
}

#[tokio::test]
async fn paying_a_supplier_overflows_into_advance() {
    let app = TestApp::spawn().await;
    let supplier_id = seed_supplier(&app, "Mills & Co", 100_000).await;
    let product_id = seed_product(&app, "RAW-102", 250, 100).await;

    let invoice = app
        .state
        .services
        .purchase_invoices
        .create_invoice(
            invoice_request(supplier_id, product_id, 10, 100, None),
            "buyer",
        )
        .await
        .unwrap();

    let paid = app
        .state
        .services
        .purchase_invoices
        .record_payment(
            invoice.id,
            InvoicePaymentRequest {
                amount: dec(1200),
                payment_method: Some(PaymentMethod::Cash),
            },
        )
        .await
        .unwrap();

    assert_eq!(paid.payment_status, PaymentStatus::Paid);
    assert_eq!(paid.status, InvoiceStatus::Confirmed);
    assert_eq!(paid.remaining_balance, Decimal::ZERO);

    let balances = app
        .state
        .services
        .balance
        .get_balances(app.state.db.as_ref(), PartyRef::supplier(supplier_id))
        .await
        .unwrap();
    assert_eq!(balances.pending_balance, Decimal::ZERO);
    assert_eq!(balances.advance_balance, dec(200));
}

#[tokio::test]
async fn full_payment_confirms_the_invoice_at_creation() {
    let app = TestApp::spawn().await;
    let supplier_id = seed_supplier(&app, "Mills & Co", 0).await;
    let product_id = seed_product(&app, "RAW-103", 250, 100).await;

    let invoice = app
        .state
        .services
        .purchase_invoices
        .create_invoice(
            invoice_request(supplier_id, product_id, 10, 100, Some(1000)),
            "buyer",
        )
        .await
        .unwrap();

    assert_eq!(invoice.status, InvoiceStatus::Confirmed);
    assert_eq!(invoice.payment_status, PaymentStatus::Paid);
}

#[tokio::test]
async fn supplier_credit_limit_gates_unpaid_invoices() {
    let app = TestApp::spawn().await;
    let supplier_id = seed_supplier(&app, "Mills & Co", 500).await;
    let product_id = seed_product(&app, "RAW-104", 250, 100).await;

    let err = app
        .state
        .services
        .purchase_invoices
        .create_invoice(
            invoice_request(supplier_id, product_id, 10, 100, None),
            "buyer",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::CreditLimitExceeded { .. }));

    // The receipt must not have happened.
    let record = app.state.services.stock.get_stock(product_id).await.unwrap();
    assert!(record.map_or(true, |r| r.current_stock == Decimal::ZERO));
}

#[tokio::test]
async fn confirming_an_invoice_posts_the_supplier_balance() {
    let app = TestApp::spawn().await;
    let supplier_id = seed_supplier(&app, "Mills & Co", 100_000).await;
    let product_id = seed_product(&app, "RAW-105", 250, 100).await;
    let invoices = &app.state.services.purchase_invoices;

    let invoice = invoices
        .create_invoice(
            invoice_request(supplier_id, product_id, 10, 100, None),
            "buyer",
        )
        .await
        .unwrap();

    let confirmed = invoices
        .transition_status(invoice.id, InvoiceStatus::Confirmed)
        .await
        .unwrap();
    assert_eq!(confirmed.status, InvoiceStatus::Confirmed);

    let balances = app
        .state
        .services
        .balance
        .get_balances(app.state.db.as_ref(), PartyRef::supplier(supplier_id))
        .await
        .unwrap();
    assert_eq!(balances.pending_balance, Decimal::ZERO);
    assert_eq!(balances.current_balance, dec(1000));
}

#[tokio::test]
async fn cancelling_an_invoice_removes_the_received_goods() {
    let app = TestApp::spawn().await;
    let supplier_id = seed_supplier(&app, "Mills & Co", 100_000).await;
    let product_id = seed_product(&app, "RAW-106", 250, 100).await;
    let invoices = &app.state.services.purchase_invoices;

    let invoice = invoices
        .create_invoice(
            invoice_request(supplier_id, product_id, 10, 100, None),
            "buyer",
        )
        .await
        .unwrap();

    let cancelled = invoices.cancel_invoice(invoice.id, "buyer").await.unwrap();
    assert_eq!(cancelled.status, InvoiceStatus::Cancelled);

    let record = app
        .state
        .services
        .stock
        .get_stock(product_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.current_stock, Decimal::ZERO);

    let balances = app
        .state
        .services
        .balance
        .get_balances(app.state.db.as_ref(), PartyRef::supplier(supplier_id))
        .await
        .unwrap();
    assert_eq!(balances.pending_balance, Decimal::ZERO);
}

#[tokio::test]
async fn cancelling_fails_once_the_goods_are_gone() {
    let app = TestApp::spawn().await;
    let supplier_id = seed_supplier(&app, "Mills & Co", 100_000).await;
    let product_id = seed_product(&app, "RAW-107", 250, 100).await;
    let invoices = &app.state.services.purchase_invoices;

    let invoice = invoices
        .create_invoice(
            invoice_request(supplier_id, product_id, 10, 100, None),
            "buyer",
        )
        .await
        .unwrap();

    // Most of the received goods have since been issued.
    app.state
        .services
        .stock
        .update_stock(tradebook_api::services::stock::StockUpdateInput {
            product_id,
            movement_type: tradebook_api::entities::stock_movement::MovementType::Out,
            quantity: dec(8),
            unit_cost: None,
            reason: "manual issue".to_string(),
            reference_type: None,
            reference_id: None,
            performed_by: "tester".to_string(),
        })
        .await
        .unwrap();

    let err = invoices.cancel_invoice(invoice.id, "buyer").await.unwrap_err();
    assert!(matches!(err, ServiceError::InsufficientStock { .. }));

    // The invoice survives untouched.
    let still_there = invoices.get_invoice(invoice.id).await.unwrap();
    assert_eq!(still_there.status, InvoiceStatus::Pending);
}

#[tokio::test]
async fn deleting_an_invoice_restores_the_supplier_and_stock() {
    let app = TestApp::spawn().await;
    let supplier_id = seed_supplier(&app, "Mills & Co", 100_000).await;
    let product_id = seed_product(&app, "RAW-108", 250, 100).await;
    let invoices = &app.state.services.purchase_invoices;

    let invoice = invoices
        .create_invoice(
            invoice_request(supplier_id, product_id, 10, 100, None),
            "buyer",
        )
        .await
        .unwrap();

    invoices.delete_invoice(invoice.id, "buyer").await.unwrap();

    let missing = invoices.get_invoice(invoice.id).await;
    assert!(matches!(missing, Err(ServiceError::NotFound(_))));

    let record = app
        .state
        .services
        .stock
        .get_stock(product_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.current_stock, Decimal::ZERO);

    let balances = app
        .state
        .services
        .balance
        .get_balances(app.state.db.as_ref(), PartyRef::supplier(supplier_id))
        .await
        .unwrap();
    assert_eq!(balances.pending_balance, Decimal::ZERO);
}
