//! Recurring expenses: payment recording, due-date advancement with month-end
//! clamping, supplier-linked settlement, and due filtering.

mod common;

use chrono::NaiveDate;
use common::{dec, seed_supplier, TestApp};
use rust_decimal::Decimal;
use tradebook_api::entities::recurring_expense::ExpenseFrequency;
use tradebook_api::entities::sales_order::PaymentMethod;
use tradebook_api::errors::ServiceError;
use tradebook_api::services::balance::PartyRef;
use tradebook_api::services::expenses::{
    CreateExpenseRequest, ExpenseFilters, RecordExpensePaymentRequest,
};

fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

fn expense_request(name: &str, amount: i64, due: NaiveDate) -> CreateExpenseRequest {
    CreateExpenseRequest {
        name: name.to_string(),
        category: Some("rent".to_string()),
        amount: dec(amount),
        frequency: ExpenseFrequency::Monthly,
        supplier_id: None,
        next_due_date: due,
        notes: None,
    }
}

fn payment_request() -> RecordExpensePaymentRequest {
    RecordExpensePaymentRequest {
        amount: None,
        payment_method: PaymentMethod::BankTransfer,
        period_start: None,
        period_end: None,
        notes: None,
    }
}

#[tokio::test]
async fn paying_an_expense_advances_the_due_date() {
    let app = TestApp::spawn().await;
    let expenses = &app.state.services.expenses;

    let expense = expenses
        .create_expense(expense_request("Shop rent", 900, date(2026, 3, 15)))
        .await
        .unwrap();

    let payment = expenses
        .record_payment(expense.id, payment_request(), "accountant")
        .await
        .unwrap();

    assert_eq!(payment.amount, dec(900));
    assert_eq!(payment.created_by, "accountant");
    assert_eq!(payment.next_due_date, date(2026, 4, 15));

    let reloaded = expenses.get_expense(expense.id).await.unwrap();
    assert_eq!(reloaded.next_due_date, date(2026, 4, 15));
}

#[tokio::test]
async fn month_end_due_dates_clamp_to_shorter_months() {
    let app = TestApp::spawn().await;
    let expenses = &app.state.services.expenses;

    let expense = expenses
        .create_expense(expense_request("Storage", 300, date(2026, 1, 31)))
        .await
        .unwrap();

    let payment = expenses
        .record_payment(expense.id, payment_request(), "accountant")
        .await
        .unwrap();
    assert_eq!(payment.next_due_date, date(2026, 2, 28));
}

#[tokio::test]
async fn custom_payment_amounts_still_advance_the_schedule() {
    let app = TestApp::spawn().await;
    let expenses = &app.state.services.expenses;

    let expense = expenses
        .create_expense(expense_request("Utilities", 900, date(2026, 5, 1)))
        .await
        .unwrap();

    let payment = expenses
        .record_payment(
            expense.id,
            RecordExpensePaymentRequest {
                amount: Some(dec(640)),
                ..payment_request()
            },
            "accountant",
        )
        .await
        .unwrap();

    assert_eq!(payment.amount, dec(640));
    assert_eq!(payment.next_due_date, date(2026, 6, 1));
}

#[tokio::test]
async fn supplier_linked_payments_settle_through_the_supplier() {
    let app = TestApp::spawn().await;
    let supplier_id = seed_supplier(&app, "Properties Ltd", 0).await;
    let expenses = &app.state.services.expenses;

    let mut request = expense_request("Warehouse rent", 1200, date(2026, 4, 1));
    request.supplier_id = Some(supplier_id);
    let expense = expenses.create_expense(request).await.unwrap();
    assert_eq!(expense.supplier_id, Some(supplier_id));

    expenses
        .record_payment(expense.id, payment_request(), "accountant")
        .await
        .unwrap();

    // The charge and its settlement cancel out on the supplier's figures.
    let balances = app
        .state
        .services
        .balance
        .get_balances(app.state.db.as_ref(), PartyRef::supplier(supplier_id))
        .await
        .unwrap();
    assert_eq!(balances.pending_balance, Decimal::ZERO);
    assert_eq!(balances.current_balance, Decimal::ZERO);
    assert_eq!(balances.advance_balance, Decimal::ZERO);
}

#[tokio::test]
async fn inactive_expenses_refuse_payment() {
    let app = TestApp::spawn().await;
    let expenses = &app.state.services.expenses;

    let expense = expenses
        .create_expense(expense_request("Old subscription", 50, date(2026, 2, 1)))
        .await
        .unwrap();

    let deactivated = expenses.deactivate_expense(expense.id).await.unwrap();
    assert!(!deactivated.is_active);

    let err = expenses
        .record_payment(expense.id, payment_request(), "accountant")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn due_filter_limits_the_listing() {
    let app = TestApp::spawn().await;
    let expenses = &app.state.services.expenses;

    let due_soon = expenses
        .create_expense(expense_request("Rent", 900, date(2026, 1, 1)))
        .await
        .unwrap();
    let due_later = expenses
        .create_expense(expense_request("Insurance", 400, date(2026, 12, 1)))
        .await
        .unwrap();

    let (listed, total) = expenses
        .list_expenses(
            ExpenseFilters {
                active: Some(true),
                supplier_id: None,
                due_before: Some(date(2026, 6, 1)),
            },
            1,
            20,
        )
        .await
        .unwrap();

    assert_eq!(total, 1);
    assert!(listed.iter().any(|e| e.id == due_soon.id));
    assert!(listed.iter().all(|e| e.id != due_later.id));
}

#[tokio::test]
async fn payment_history_is_recorded_per_expense() {
    let app = TestApp::spawn().await;
    let expenses = &app.state.services.expenses;

    let expense = expenses
        .create_expense(expense_request("Internet", 80, date(2026, 3, 1)))
        .await
        .unwrap();

    expenses
        .record_payment(expense.id, payment_request(), "accountant")
        .await
        .unwrap();
    expenses
        .record_payment(expense.id, payment_request(), "accountant")
        .await
        .unwrap();

    let (payments, total) = expenses.list_payments(expense.id, 1, 20).await.unwrap();
    assert_eq!(total, 2);
    assert!(payments.iter().all(|p| p.expense_id == expense.id));

    // Two monthly periods were consumed.
    let reloaded = expenses.get_expense(expense.id).await.unwrap();
    assert_eq!(reloaded.next_due_date, date(2026, 5, 1));
}

#[tokio::test]
async fn invalid_period_ranges_are_rejected() {
    let app = TestApp::spawn().await;
    let expenses = &app.state.services.expenses;

    let expense = expenses
        .create_expense(expense_request("Cleaning", 120, date(2026, 2, 1)))
        .await
        .unwrap();

    let err = expenses
        .record_payment(
            expense.id,
            RecordExpensePaymentRequest {
                period_start: Some(date(2026, 2, 10)),
                period_end: Some(date(2026, 2, 1)),
                ..payment_request()
            },
            "accountant",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ValidationError(_)));
}
