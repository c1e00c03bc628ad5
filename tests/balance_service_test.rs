//! Party balance bookkeeping against a live database: charge, payment, and
//! refund allocation across the pending, current, and advance figures.

mod common;

use common::{dec, seed_customer, TestApp};
use rust_decimal::Decimal;
use tradebook_api::errors::ServiceError;
use tradebook_api::services::balance::{BalanceBucket, PartyRef};

#[tokio::test]
async fn charges_accumulate_in_pending() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Acme Retail", 0).await;
    let party = PartyRef::customer(customer_id);
    let db = app.state.db.as_ref();
    let balance = &app.state.services.balance;

    balance.record_charge(db, party, dec(100)).await.unwrap();
    balance.record_charge(db, party, dec(50)).await.unwrap();

    let balances = balance.get_balances(db, party).await.unwrap();
    assert_eq!(balances.pending_balance, dec(150));
    assert_eq!(balances.current_balance, Decimal::ZERO);
    assert_eq!(balances.advance_balance, Decimal::ZERO);
}

#[tokio::test]
async fn payment_overflow_is_credited_to_advance() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Acme Retail", 0).await;
    let party = PartyRef::customer(customer_id);
    let db = app.state.db.as_ref();
    let balance = &app.state.services.balance;

    balance.record_charge(db, party, dec(100)).await.unwrap();
    let split = balance
        .record_payment(db, party, dec(150), dec(100), BalanceBucket::Pending)
        .await
        .unwrap();

    assert_eq!(split.applied_to_balance, dec(100));
    assert_eq!(split.credited_to_advance, dec(50));

    let balances = balance.get_balances(db, party).await.unwrap();
    assert_eq!(balances.pending_balance, Decimal::ZERO);
    assert_eq!(balances.advance_balance, dec(50));
}

#[tokio::test]
async fn refunds_drain_advance_before_pending() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Acme Retail", 0).await;
    let party = PartyRef::customer(customer_id);
    let db = app.state.db.as_ref();
    let balance = &app.state.services.balance;

    // Overpay a 40 charge to build up a 60 advance, then owe another 30.
    balance.record_charge(db, party, dec(40)).await.unwrap();
    balance
        .record_payment(db, party, dec(100), dec(40), BalanceBucket::Pending)
        .await
        .unwrap();
    balance.record_charge(db, party, dec(30)).await.unwrap();

    let split = balance.record_refund(db, party, dec(80)).await.unwrap();
    assert_eq!(split.from_advance, dec(60));
    assert_eq!(split.from_pending, dec(20));

    let balances = balance.get_balances(db, party).await.unwrap();
    assert_eq!(balances.advance_balance, Decimal::ZERO);
    assert_eq!(balances.pending_balance, dec(10));
}

#[tokio::test]
async fn confirm_charge_moves_pending_into_current() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Acme Retail", 0).await;
    let party = PartyRef::customer(customer_id);
    let db = app.state.db.as_ref();
    let balance = &app.state.services.balance;

    balance.record_charge(db, party, dec(100)).await.unwrap();
    balance.confirm_charge(db, party, dec(100)).await.unwrap();

    let balances = balance.get_balances(db, party).await.unwrap();
    assert_eq!(balances.pending_balance, Decimal::ZERO);
    assert_eq!(balances.current_balance, dec(100));

    // A fully paid document confirms with zero unpaid and moves nothing.
    balance.confirm_charge(db, party, Decimal::ZERO).await.unwrap();
    let unchanged = balance.get_balances(db, party).await.unwrap();
    assert_eq!(unchanged.current_balance, dec(100));
}

#[tokio::test]
async fn credit_check_projects_against_current_balance() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Acme Retail", 500).await;
    let party = PartyRef::customer(customer_id);
    let db = app.state.db.as_ref();
    let balance = &app.state.services.balance;

    balance.record_charge(db, party, dec(400)).await.unwrap();
    balance.confirm_charge(db, party, dec(400)).await.unwrap();

    let at_limit = balance.can_accept_charge(db, party, dec(100)).await.unwrap();
    assert!(at_limit.allowed);
    assert_eq!(at_limit.projected_balance, dec(500));

    let over_limit = balance.can_accept_charge(db, party, dec(101)).await.unwrap();
    assert!(!over_limit.allowed);
    assert_eq!(over_limit.current_balance, dec(400));
    assert_eq!(over_limit.projected_balance, dec(501));
    assert_eq!(over_limit.credit_limit, dec(500));
}

#[tokio::test]
async fn negative_amounts_are_rejected() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Acme Retail", 0).await;
    let party = PartyRef::customer(customer_id);
    let db = app.state.db.as_ref();
    let balance = &app.state.services.balance;

    let charge = balance.record_charge(db, party, dec(-1)).await;
    assert!(matches!(charge, Err(ServiceError::ValidationError(_))));

    let payment = balance
        .record_payment(db, party, dec(-1), Decimal::ZERO, BalanceBucket::Pending)
        .await;
    assert!(matches!(payment, Err(ServiceError::ValidationError(_))));

    let refund = balance.record_refund(db, party, dec(-1)).await;
    assert!(matches!(refund, Err(ServiceError::ValidationError(_))));
}

#[tokio::test]
async fn recalculation_repairs_drifted_figures() {
    let app = TestApp::spawn().await;
    let customer_id = seed_customer(&app, "Acme Retail", 0).await;
    let party = PartyRef::customer(customer_id);
    let db = app.state.db.as_ref();
    let balance = &app.state.services.balance;

    // A charge with no backing document is exactly the kind of drift the
    // rebuild exists to repair.
    balance.record_charge(db, party, dec(75)).await.unwrap();

    let first = balance
        .recalculate_balance(&app.state.db, party)
        .await
        .unwrap();
    assert!(first.drift_detected);
    assert_eq!(first.before.pending_balance, dec(75));
    assert_eq!(first.after.pending_balance, Decimal::ZERO);

    let second = balance
        .recalculate_balance(&app.state.db, party)
        .await
        .unwrap();
    assert!(!second.drift_detected);

    let balances = balance.get_balances(db, party).await.unwrap();
    assert_eq!(balances.pending_balance, Decimal::ZERO);
}
