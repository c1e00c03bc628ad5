//! Stock record maintenance: weighted average costing, reservations, damage
//! write-offs, and the movement audit trail.

mod common;

use common::{dec, seed_product, seed_stock, TestApp};
use rust_decimal::Decimal;
use rust_decimal_macros::dec as d;
use tradebook_api::entities::stock_movement::MovementType;
use tradebook_api::errors::ServiceError;
use tradebook_api::services::stock::StockUpdateInput;

fn stock_in(product_id: uuid::Uuid, quantity: i64, unit_cost: i64) -> StockUpdateInput {
    StockUpdateInput {
        product_id,
        movement_type: MovementType::In,
        quantity: dec(quantity),
        unit_cost: Some(dec(unit_cost)),
        reason: "restock".to_string(),
        reference_type: None,
        reference_id: None,
        performed_by: "tester".to_string(),
    }
}

fn stock_out(product_id: uuid::Uuid, quantity: i64) -> StockUpdateInput {
    StockUpdateInput {
        product_id,
        movement_type: MovementType::Out,
        quantity: dec(quantity),
        unit_cost: None,
        reason: "manual issue".to_string(),
        reference_type: None,
        reference_id: None,
        performed_by: "tester".to_string(),
    }
}

#[tokio::test]
async fn stock_in_updates_weighted_average_cost() {
    let app = TestApp::spawn().await;
    let product_id = seed_product(&app, "WIDGET-1", 250, 100).await;
    let stock = &app.state.services.stock;

    let first = stock.update_stock(stock_in(product_id, 10, 100)).await.unwrap();
    assert_eq!(first.new_stock, dec(10));
    assert_eq!(first.average_cost, dec(100));

    let second = stock.update_stock(stock_in(product_id, 10, 200)).await.unwrap();
    assert_eq!(second.previous_stock, dec(10));
    assert_eq!(second.new_stock, dec(20));
    assert_eq!(second.average_cost, dec(150));

    // Issues consume at the running average without moving it.
    let out = stock.update_stock(stock_out(product_id, 5)).await.unwrap();
    assert_eq!(out.new_stock, dec(15));
    assert_eq!(out.average_cost, dec(150));
}

#[tokio::test]
async fn fractional_receipts_round_average_to_four_places() {
    let app = TestApp::spawn().await;
    let product_id = seed_product(&app, "WIDGET-2", 250, 100).await;
    let stock = &app.state.services.stock;

    stock.update_stock(stock_in(product_id, 1, 10)).await.unwrap();
    let result = stock.update_stock(stock_in(product_id, 2, 20)).await.unwrap();

    // (1 * 10 + 2 * 20) / 3 rounds to 16.6667
    assert_eq!(result.average_cost, d!(16.6667));
}

#[tokio::test]
async fn stock_out_is_rejected_when_insufficient() {
    let app = TestApp::spawn().await;
    let product_id = seed_product(&app, "WIDGET-3", 250, 100).await;
    seed_stock(&app, product_id, 6, 100).await;
    let stock = &app.state.services.stock;

    let err = stock.update_stock(stock_out(product_id, 7)).await.unwrap_err();
    match err {
        ServiceError::InsufficientStock {
            requested,
            available,
            ..
        } => {
            assert_eq!(requested, dec(7));
            assert_eq!(available, dec(6));
        }
        other => panic!("expected InsufficientStock, got {other:?}"),
    }

    // The rejected issue must leave the record untouched.
    let record = stock.get_stock(product_id).await.unwrap().unwrap();
    assert_eq!(record.current_stock, dec(6));
}

#[tokio::test]
async fn damage_write_off_is_valued_at_running_average() {
    let app = TestApp::spawn().await;
    let product_id = seed_product(&app, "WIDGET-4", 250, 100).await;
    let stock = &app.state.services.stock;

    stock.update_stock(stock_in(product_id, 10, 80)).await.unwrap();

    let result = stock
        .record_damage(product_id, dec(3), Some("water damage".to_string()), "tester".to_string())
        .await
        .unwrap();
    assert_eq!(result.movement_type, MovementType::Adjustment);
    assert_eq!(result.quantity, dec(-3));
    assert_eq!(result.new_stock, dec(7));

    let (movements, _) = stock.list_movements(product_id, 1, 50).await.unwrap();
    let damage = movements
        .iter()
        .find(|m| m.is_damage())
        .expect("damage movement recorded");
    assert_eq!(damage.unit_cost, Some(dec(80)));
    assert_eq!(damage.previous_stock + damage.quantity, damage.new_stock);
}

#[tokio::test]
async fn reservations_hold_availability_without_moving_stock() {
    let app = TestApp::spawn().await;
    let product_id = seed_product(&app, "WIDGET-5", 250, 100).await;
    seed_stock(&app, product_id, 10, 100).await;
    let stock = &app.state.services.stock;

    let reserved = stock.reserve_stock(product_id, dec(4)).await.unwrap();
    assert_eq!(reserved.current_stock, dec(10));
    assert_eq!(reserved.reserved_stock, dec(4));
    assert_eq!(reserved.available_stock, dec(6));

    // An issue larger than what is left unreserved must fail.
    let err = stock.update_stock(stock_out(product_id, 7)).await.unwrap_err();
    assert!(matches!(err, ServiceError::InsufficientStock { .. }));

    // Releasing more than is held floors the reservation at zero.
    let released = stock.release_stock(product_id, dec(9)).await.unwrap();
    assert_eq!(released.reserved_stock, Decimal::ZERO);
    assert_eq!(released.available_stock, dec(10));
}

#[tokio::test]
async fn over_reservation_is_rejected() {
    let app = TestApp::spawn().await;
    let product_id = seed_product(&app, "WIDGET-6", 250, 100).await;
    seed_stock(&app, product_id, 5, 100).await;
    let stock = &app.state.services.stock;

    stock.reserve_stock(product_id, dec(5)).await.unwrap();
    let err = stock.reserve_stock(product_id, dec(1)).await.unwrap_err();
    match err {
        ServiceError::InsufficientStock { available, .. } => {
            assert_eq!(available, Decimal::ZERO);
        }
        other => panic!("expected InsufficientStock, got {other:?}"),
    }
}

#[tokio::test]
async fn low_stock_report_filters_by_threshold() {
    let app = TestApp::spawn().await;
    let scarce = seed_product(&app, "SCARCE-1", 250, 100).await;
    let plentiful = seed_product(&app, "PLENTY-1", 250, 100).await;
    seed_stock(&app, scarce, 2, 100).await;
    seed_stock(&app, plentiful, 50, 100).await;
    let stock = &app.state.services.stock;

    let low = stock.list_low_stock(dec(5)).await.unwrap();
    assert!(low.iter().any(|r| r.product_id == scarce));
    assert!(low.iter().all(|r| r.product_id != plentiful));
}

#[tokio::test]
async fn movement_trail_reconciles_every_step() {
    let app = TestApp::spawn().await;
    let product_id = seed_product(&app, "WIDGET-7", 250, 100).await;
    let stock = &app.state.services.stock;

    stock.update_stock(stock_in(product_id, 10, 100)).await.unwrap();
    stock.update_stock(stock_out(product_id, 3)).await.unwrap();

    let (movements, total) = stock.list_movements(product_id, 1, 50).await.unwrap();
    assert_eq!(total, 2);
    for movement in &movements {
        assert_eq!(
            movement.previous_stock + movement.quantity,
            movement.new_stock
        );
    }
    let issued = movements
        .iter()
        .find(|m| m.movement_type == MovementType::Out)
        .expect("out movement recorded");
    assert_eq!(issued.quantity, dec(-3));
}
