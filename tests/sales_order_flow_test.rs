//! Sales order lifecycle: stock deduction, balance bookkeeping, payments,
//! credit gating, cancellation, and deletion with exact restoration.

mod common;

use common::{dec, seed_customer, seed_product, seed_stock, TestApp};
use rust_decimal::Decimal;
use tradebook_api::entities::sales_order::{OrderStatus, PaymentMethod, PaymentStatus};
use tradebook_api::errors::ServiceError;
use tradebook_api::services::balance::PartyRef;
use tradebook_api::services::sales_orders::{
    CreateSalesOrderRequest, OrderItemRequest, RecordPaymentRequest, UpdateSalesOrderRequest,
};

fn order_request(
    customer_id: uuid::Uuid,
    product_id: uuid::Uuid,
    quantity: i64,
    amount_paid: Option<i64>,
) -> CreateSalesOrderRequest {
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
    }
}

#[tokio::test]
async fn creating_an_order_deducts_stock_and_charges_pending() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Corner Shop", 10_000).await;
    let product_id = seed_product(&app, "SKU-100", 250, 100).await;
    seed_stock(&app, product_id, 10, 100).await;

    let order = app
        .state
        .services
        .sales_orders
        .create_order(order_request(customer_id, product_id, 4, None), "clerk")
        .await
        .unwrap();

    assert!(order.order_number.starts_with("SO-"));
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.payment_status, PaymentStatus::Unpaid);
    assert_eq!(order.subtotal, dec(1000));
    assert_eq!(order.total_amount, dec(1000));
    assert_eq!(order.remaining_balance, dec(1000));
    assert_eq!(order.version, 1);
    assert_eq!(order.created_by, "clerk");
    assert_eq!(order.items.len(), 1);

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
    assert_eq!(balances.current_balance, Decimal::ZERO);
}

#[tokio::test]
async fn full_payment_confirms_the_order_at_creation() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Corner Shop", 0).await;
    let product_id = seed_product(&app, "SKU-101", 250, 100).await;
    seed_stock(&app, product_id, 10, 100).await;

    let order = app
        .state
        .services
        .sales_orders
        .create_order(order_request(customer_id, product_id, 4, Some(1000)), "clerk")
        .await
        .unwrap();

    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(order.remaining_balance, Decimal::ZERO);

    let balances = app
        .state
        .services
        .balance
        .get_balances(app.state.db.as_ref(), PartyRef::customer(customer_id))
        .await
        .unwrap();
    assert_eq!(balances.pending_balance, Decimal::ZERO);
    assert_eq!(balances.current_balance, Decimal::ZERO);
    assert_eq!(balances.advance_balance, Decimal::ZERO);
}

#[tokio::test]
async fn overpayment_is_credited_to_customer_advance() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Corner Shop", 0).await;
    let product_id = seed_product(&app, "SKU-102", 250, 100).await;
    seed_stock(&app, product_id, 10, 100).await;

    let order = app
        .state
        .services
        .sales_orders
        .create_order(order_request(customer_id, product_id, 4, Some(1200)), "clerk")
        .await
        .unwrap();

    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(order.remaining_balance, Decimal::ZERO);

    let balances = app
        .state
        .services
        .balance
        .get_balances(app.state.db.as_ref(), PartyRef::customer(customer_id))
        .await
        .unwrap();
    assert_eq!(balances.advance_balance, dec(200));
    assert_eq!(balances.pending_balance, Decimal::ZERO);
}

#[tokio::test]
async fn credit_limit_rejection_reports_the_projection() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Corner Shop", 500).await;
    let product_id = seed_product(&app, "SKU-103", 250, 100).await;
    seed_stock(&app, product_id, 10, 100).await;

    let err = app
        .state
        .services
        .sales_orders
        .create_order(order_request(customer_id, product_id, 4, None), "clerk")
        .await
        .unwrap_err();

    match err {
        ServiceError::CreditLimitExceeded {
            requested,
            projected_balance,
            credit_limit,
            ..
        } => {
            assert_eq!(requested, dec(1000));
            assert_eq!(projected_balance, dec(1000));
            assert_eq!(credit_limit, dec(500));
        }
        other => panic!("expected CreditLimitExceeded, got {other:?}"),
    }

    // Nothing may have moved.
    let record = app
        .state
        .services
        .stock
        .get_stock(product_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.current_stock, dec(10));

    let (orders, total) = app
        .state
        .services
        .sales_orders
        .list_orders(Default::default(), 1, 20)
        .await
        .unwrap();
    assert_eq!(total, 0);
    assert!(orders.is_empty());
}

#[tokio::test]
async fn insufficient_stock_unwinds_lines_already_taken() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Corner Shop", 100_000).await;
    let plentiful = seed_product(&app, "SKU-104", 250, 100).await;
    let scarce = seed_product(&app, "SKU-105", 250, 100).await;
    seed_stock(&app, plentiful, 10, 100).await;
    seed_stock(&app, scarce, 2, 100).await;

    let request = CreateSalesOrderRequest {
        customer_id,
        items: vec![
            OrderItemRequest {
                product_id: plentiful,
                quantity: dec(5),
                unit_price: None,
                discount_amount: None,
            },
            OrderItemRequest {
                product_id: scarce,
                quantity: dec(5),
                unit_price: None,
                discount_amount: None,
            },
        ],
        payment_method: PaymentMethod::Cash,
        amount_paid: None,
        status: None,
        notes: None,
    };

    let err = app
        .state
        .services
        .sales_orders
        .create_order(request, "clerk")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InsufficientStock { .. }));

    // The first line's deduction must have been put back.
    let record = app
        .state
        .services
        .stock
        .get_stock(plentiful)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.current_stock, dec(10));

    let balances = app
        .state
        .services
        .balance
        .get_balances(app.state.db.as_ref(), PartyRef::customer(customer_id))
        .await
        .unwrap();
    assert_eq!(balances.pending_balance, Decimal::ZERO);
}

#[tokio::test]
async fn draft_orders_cannot_take_payment_at_creation() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Corner Shop", 10_000).await;
    let product_id = seed_product(&app, "SKU-106", 250, 100).await;
    seed_stock(&app, product_id, 10, 100).await;

    let mut request = order_request(customer_id, product_id, 2, Some(100));
    request.status = Some(OrderStatus::Draft);

    let err = app
        .state
        .services
        .sales_orders
        .create_order(request, "clerk")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn later_payment_in_full_auto_confirms() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Corner Shop", 10_000).await;
    let product_id = seed_product(&app, "SKU-107", 250, 100).await;
    seed_stock(&app, product_id, 10, 100).await;

    let order = app
        .state
        .services
        .sales_orders
        .create_order(order_request(customer_id, product_id, 4, Some(400)), "clerk")
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.payment_status, PaymentStatus::Partial);

    let paid = app
        .state
        .services
        .sales_orders
        .record_payment(
            order.id,
            RecordPaymentRequest {
                amount: dec(600),
                payment_method: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(paid.status, OrderStatus::Confirmed);
    assert_eq!(paid.payment_status, PaymentStatus::Paid);
    assert_eq!(paid.amount_paid, dec(1000));
    assert_eq!(paid.remaining_balance, Decimal::ZERO);

    let balances = app
        .state
        .services
        .balance
        .get_balances(app.state.db.as_ref(), PartyRef::customer(customer_id))
        .await
        .unwrap();
    assert_eq!(balances.pending_balance, Decimal::ZERO);
    assert_eq!(balances.current_balance, Decimal::ZERO);
}

#[tokio::test]
async fn lifecycle_transitions_move_unpaid_balance_on_confirmation() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Corner Shop", 10_000).await;
    let product_id = seed_product(&app, "SKU-108", 250, 100).await;
    seed_stock(&app, product_id, 10, 100).await;
    let orders = &app.state.services.sales_orders;

    let order = orders
        .create_order(order_request(customer_id, product_id, 4, None), "clerk")
        .await
        .unwrap();

    let confirmed = orders
        .transition_status(order.id, OrderStatus::Confirmed)
        .await
        .unwrap();
    assert_eq!(confirmed.status, OrderStatus::Confirmed);

    let balances = app
        .state
        .services
        .balance
        .get_balances(app.state.db.as_ref(), PartyRef::customer(customer_id))
        .await
        .unwrap();
    assert_eq!(balances.pending_balance, Decimal::ZERO);
    assert_eq!(balances.current_balance, dec(1000));

    let shipped = orders
        .transition_status(order.id, OrderStatus::Shipped)
        .await
        .unwrap();
    assert_eq!(shipped.status, OrderStatus::Shipped);
    let delivered = orders
        .transition_status(order.id, OrderStatus::Delivered)
        .await
        .unwrap();
    assert_eq!(delivered.status, OrderStatus::Delivered);

    // Delivered is terminal.
    let err = orders
        .transition_status(order.id, OrderStatus::Pending)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn cancellation_goes_through_cancel_order_not_transition() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Corner Shop", 10_000).await;
    let product_id = seed_product(&app, "SKU-109", 250, 100).await;
    seed_stock(&app, product_id, 10, 100).await;
    let orders = &app.state.services.sales_orders;

    let order = orders
        .create_order(order_request(customer_id, product_id, 4, None), "clerk")
        .await
        .unwrap();

    let err = orders
        .transition_status(order.id, OrderStatus::Cancelled)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidStateTransition { .. }));

    let cancelled = orders.cancel_order(order.id, "manager").await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);

    let record = app
        .state
        .services
        .stock
        .get_stock(product_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.current_stock, dec(10));

    let balances = app
        .state
        .services
        .balance
        .get_balances(app.state.db.as_ref(), PartyRef::customer(customer_id))
        .await
        .unwrap();
    assert_eq!(balances.pending_balance, Decimal::ZERO);
}

#[tokio::test]
async fn updating_items_applies_stock_deltas_and_bumps_version() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Corner Shop", 10_000).await;
    let product_id = seed_product(&app, "SKU-110", 250, 100).await;
    seed_stock(&app, product_id, 10, 100).await;
    let orders = &app.state.services.sales_orders;

    let order = orders
        .create_order(order_request(customer_id, product_id, 4, None), "clerk")
        .await
        .unwrap();

    let updated = orders
        .update_order(
            order.id,
            UpdateSalesOrderRequest {
                items: vec![OrderItemRequest {
                    product_id,
                    quantity: dec(2),
                    unit_price: None,
                    discount_amount: None,
                }],
                notes: Some("trimmed".to_string()),
                expected_version: Some(1),
            },
            "clerk",
        )
        .await
        .unwrap();

    assert_eq!(updated.version, 2);
    assert_eq!(updated.total_amount, dec(500));

    let record = app
        .state
        .services
        .stock
        .get_stock(product_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.current_stock, dec(8));

    let balances = app
        .state
        .services
        .balance
        .get_balances(app.state.db.as_ref(), PartyRef::customer(customer_id))
        .await
        .unwrap();
    assert_eq!(balances.pending_balance, dec(500));

    // A writer still holding version 1 must now be told to reload.
    let stale = orders
        .update_order(
            order.id,
            UpdateSalesOrderRequest {
                items: vec![OrderItemRequest {
                    product_id,
                    quantity: dec(3),
                    unit_price: None,
                    discount_amount: None,
                }],
                notes: None,
                expected_version: Some(1),
            },
            "clerk",
        )
        .await;
    assert!(matches!(
        stale,
        Err(ServiceError::ConcurrentModification(_))
    ));
}

#[tokio::test]
async fn deleting_an_order_restores_the_world() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Corner Shop", 10_000).await;
    let product_id = seed_product(&app, "SKU-111", 250, 100).await;
    seed_stock(&app, product_id, 10, 100).await;
    let orders = &app.state.services.sales_orders;

    let order = orders
        .create_order(order_request(customer_id, product_id, 4, None), "clerk")
        .await
        .unwrap();

    orders.delete_order(order.id, "manager").await.unwrap();

    let missing = orders.get_order(order.id).await;
    assert!(matches!(missing, Err(ServiceError::NotFound(_))));

    let record = app
        .state
        .services
        .stock
        .get_stock(product_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.current_stock, dec(10));

    let balances = app
        .state
        .services
        .balance
        .get_balances(app.state.db.as_ref(), PartyRef::customer(customer_id))
        .await
        .unwrap();
    assert_eq!(balances.pending_balance, Decimal::ZERO);
}

#[tokio::test]
async fn cancelled_orders_delete_without_restoring_twice() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Corner Shop", 10_000).await;
    let product_id = seed_product(&app, "SKU-112", 250, 100).await;
    seed_stock(&app, product_id, 10, 100).await;
    let orders = &app.state.services.sales_orders;

    let order = orders
        .create_order(order_request(customer_id, product_id, 4, None), "clerk")
        .await
        .unwrap();
    orders.cancel_order(order.id, "manager").await.unwrap();
    orders.delete_order(order.id, "manager").await.unwrap();

    // Cancellation already put the 4 units back; deletion must not add more.
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
async fn shipped_orders_refuse_deletion() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Corner Shop", 10_000).await;
    let product_id = seed_product(&app, "SKU-113", 250, 100).await;
    seed_stock(&app, product_id, 10, 100).await;
    let orders = &app.state.services.sales_orders;

    let order = orders
        .create_order(order_request(customer_id, product_id, 4, None), "clerk")
        .await
        .unwrap();
    orders
        .transition_status(order.id, OrderStatus::Confirmed)
        .await
        .unwrap();
    orders
        .transition_status(order.id, OrderStatus::Shipped)
        .await
        .unwrap();

    let err = orders.delete_order(order.id, "manager").await.unwrap_err();
    assert!(matches!(err, ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn duplicate_product_lines_are_rejected() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Corner Shop", 10_000).await;
    let product_id = seed_product(&app, "SKU-114", 250, 100).await;
    seed_stock(&app, product_id, 10, 100).await;

    let request = CreateSalesOrderRequest {
        customer_id,
        items: vec![
            OrderItemRequest {
                product_id,
                quantity: dec(1),
                unit_price: None,
                discount_amount: None,
            },
            OrderItemRequest {
                product_id,
                quantity: dec(2),
                unit_price: None,
                discount_amount: None,
            },
        ],
        payment_method: PaymentMethod::Cash,
        amount_paid: None,
        status: None,
        notes: None,
    };

    let err = app
        .state
        .services
        .sales_orders
        .create_order(request, "clerk")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ValidationError(_)));
}
