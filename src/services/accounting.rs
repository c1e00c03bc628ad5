use crate::{
    db::DbPool,
    entities::accounting_entry::{self, EntryType},
    entities::sales_order::PaymentMethod,
    errors::ServiceError,
};
use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::IntCounter;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, Set, TransactionTrait};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

lazy_static! {
    static ref ACCOUNTING_TRANSACTIONS: IntCounter = IntCounter::new(
        "accounting_transactions_posted_total",
        "Total number of accounting transactions posted"
    )
    .expect("metric can be created");
}

pub const ACCOUNT_CASH: &str = "cash";
pub const ACCOUNT_BANK: &str = "bank";
pub const ACCOUNT_RECEIVABLE: &str = "accounts_receivable";
pub const ACCOUNT_PAYABLE: &str = "accounts_payable";
pub const ACCOUNT_REVENUE: &str = "sales_revenue";
pub const ACCOUNT_SALES_RETURNS: &str = "sales_returns";
pub const ACCOUNT_INVENTORY: &str = "inventory";
pub const ACCOUNT_EXPENSES: &str = "operating_expenses";

/// One side of a journal pair.
#[derive(Debug, Clone)]
pub struct EntryLine {
    pub account: String,
    pub entry_type: EntryType,
    pub amount: Decimal,
}

pub fn debit(account: &str, amount: Decimal) -> EntryLine {
    EntryLine {
        account: account.to_string(),
        entry_type: EntryType::Debit,
        amount,
    }
}

pub fn credit(account: &str, amount: Decimal) -> EntryLine {
    EntryLine {
        account: account.to_string(),
        entry_type: EntryType::Credit,
        amount,
    }
}

/// Maps a payment method to the account the money actually moves through.
/// Settlement "on account" moves no money and writes no cash pair.
fn settlement_account(method: PaymentMethod) -> &'static str {
    match method {
        PaymentMethod::Cash => ACCOUNT_CASH,
        PaymentMethod::Card | PaymentMethod::BankTransfer => ACCOUNT_BANK,
        PaymentMethod::Account => ACCOUNT_CASH,
    }
}

/// Writes balanced journal pairs to `accounting_entries` for an external
/// bookkeeping system. Invoked after the business transaction commits; every
/// caller treats failures as log-only.
#[derive(Clone)]
pub struct AccountingService {
    db_pool: Arc<DbPool>,
    currency: String,
}

impl AccountingService {
    pub fn new(db_pool: Arc<DbPool>, currency: String) -> Self {
        Self { db_pool, currency }
    }

    /// Posts one balanced transaction; all rows share a transaction id.
    #[instrument(skip(self, lines), fields(description = %description))]
    pub async fn post_transaction(
        &self,
        description: &str,
        reference_type: Option<&str>,
        reference_id: Option<Uuid>,
        lines: Vec<EntryLine>,
    ) -> Result<Uuid, ServiceError> {
        if lines.is_empty() {
            return Err(ServiceError::InternalError(
                "Accounting transaction has no lines".to_string(),
            ));
        }

        let mut debits = Decimal::ZERO;
        let mut credits = Decimal::ZERO;
        for line in &lines {
            if line.amount <= Decimal::ZERO {
                return Err(ServiceError::InternalError(format!(
                    "Accounting line for {} has non-positive amount {}",
                    line.account, line.amount
                )));
            }
            match line.entry_type {
                EntryType::Debit => debits += line.amount,
                EntryType::Credit => credits += line.amount,
            }
        }
        if debits != credits {
            return Err(ServiceError::InternalError(format!(
                "Unbalanced accounting transaction: debits {} vs credits {}",
                debits, credits
            )));
        }

        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;
        let transaction_id = Uuid::new_v4();
        let now = Utc::now();

        for line in lines {
            let model = accounting_entry::ActiveModel {
                id: Set(Uuid::new_v4()),
                transaction_id: Set(transaction_id),
                account: Set(line.account),
                entry_type: Set(line.entry_type),
                amount: Set(line.amount),
                currency: Set(self.currency.clone()),
                description: Set(description.to_string()),
                reference_type: Set(reference_type.map(|s| s.to_string())),
                reference_id: Set(reference_id),
                posting_date: Set(now),
                created_at: Set(now),
            };
            model.insert(&txn).await.map_err(ServiceError::DatabaseError)?;
        }

        txn.commit().await.map_err(ServiceError::DatabaseError)?;
        ACCOUNTING_TRANSACTIONS.inc();
        info!(transaction_id = %transaction_id, "Accounting transaction posted");

        Ok(transaction_id)
    }

    /// Sale: receivable against revenue, plus a cash pair for money taken.
    pub async fn record_sale(
        &self,
        order_id: Uuid,
        order_number: &str,
        total: Decimal,
        amount_paid: Decimal,
        method: PaymentMethod,
    ) -> Result<(), ServiceError> {
        if total > Decimal::ZERO {
            self.post_transaction(
                &format!("Sale {}", order_number),
                Some("sales_order"),
                Some(order_id),
                vec![debit(ACCOUNT_RECEIVABLE, total), credit(ACCOUNT_REVENUE, total)],
            )
            .await?;
        }
        if amount_paid > Decimal::ZERO && method != PaymentMethod::Account {
            self.post_transaction(
                &format!("Payment on sale {}", order_number),
                Some("sales_order"),
                Some(order_id),
                vec![
                    debit(settlement_account(method), amount_paid),
                    credit(ACCOUNT_RECEIVABLE, amount_paid),
                ],
            )
            .await?;
        }
        Ok(())
    }

    /// Purchase: inventory against payable, plus a cash pair for money paid out.
    pub async fn record_purchase(
        &self,
        invoice_id: Uuid,
        invoice_number: &str,
        total: Decimal,
        amount_paid: Decimal,
        method: PaymentMethod,
    ) -> Result<(), ServiceError> {
        if total > Decimal::ZERO {
            self.post_transaction(
                &format!("Purchase {}", invoice_number),
                Some("purchase_invoice"),
                Some(invoice_id),
                vec![debit(ACCOUNT_INVENTORY, total), credit(ACCOUNT_PAYABLE, total)],
            )
            .await?;
        }
        if amount_paid > Decimal::ZERO && method != PaymentMethod::Account {
            self.post_transaction(
                &format!("Payment on purchase {}", invoice_number),
                Some("purchase_invoice"),
                Some(invoice_id),
                vec![
                    debit(ACCOUNT_PAYABLE, amount_paid),
                    credit(settlement_account(method), amount_paid),
                ],
            )
            .await?;
        }
        Ok(())
    }

    /// Later payment received against a sale.
    pub async fn record_payment_received(
        &self,
        order_id: Uuid,
        order_number: &str,
        amount: Decimal,
        method: PaymentMethod,
    ) -> Result<(), ServiceError> {
        if amount <= Decimal::ZERO || method == PaymentMethod::Account {
            return Ok(());
        }
        self.post_transaction(
            &format!("Payment on sale {}", order_number),
            Some("sales_order"),
            Some(order_id),
            vec![
                debit(settlement_account(method), amount),
                credit(ACCOUNT_RECEIVABLE, amount),
            ],
        )
        .await
        .map(|_| ())
    }

    /// Later payment made against a purchase.
    pub async fn record_payment_made(
        &self,
        invoice_id: Uuid,
        invoice_number: &str,
        amount: Decimal,
        method: PaymentMethod,
    ) -> Result<(), ServiceError> {
        if amount <= Decimal::ZERO || method == PaymentMethod::Account {
            return Ok(());
        }
        self.post_transaction(
            &format!("Payment on purchase {}", invoice_number),
            Some("purchase_invoice"),
            Some(invoice_id),
            vec![
                debit(ACCOUNT_PAYABLE, amount),
                credit(settlement_account(method), amount),
            ],
        )
        .await
        .map(|_| ())
    }

    /// Repriced sale: one signed pair for the change in the document total.
    pub async fn record_sale_adjustment(
        &self,
        order_id: Uuid,
        order_number: &str,
        delta: Decimal,
    ) -> Result<(), ServiceError> {
        if delta == Decimal::ZERO {
            return Ok(());
        }
        let lines = if delta > Decimal::ZERO {
            vec![debit(ACCOUNT_RECEIVABLE, delta), credit(ACCOUNT_REVENUE, delta)]
        } else {
            vec![debit(ACCOUNT_REVENUE, -delta), credit(ACCOUNT_RECEIVABLE, -delta)]
        };
        self.post_transaction(
            &format!("Revision of sale {}", order_number),
            Some("sales_order"),
            Some(order_id),
            lines,
        )
        .await
        .map(|_| ())
    }

    /// Repriced purchase: one signed pair for the change in the invoice total.
    pub async fn record_purchase_adjustment(
        &self,
        invoice_id: Uuid,
        invoice_number: &str,
        delta: Decimal,
    ) -> Result<(), ServiceError> {
        if delta == Decimal::ZERO {
            return Ok(());
        }
        let lines = if delta > Decimal::ZERO {
            vec![debit(ACCOUNT_INVENTORY, delta), credit(ACCOUNT_PAYABLE, delta)]
        } else {
            vec![debit(ACCOUNT_PAYABLE, -delta), credit(ACCOUNT_INVENTORY, -delta)]
        };
        self.post_transaction(
            &format!("Revision of purchase {}", invoice_number),
            Some("purchase_invoice"),
            Some(invoice_id),
            lines,
        )
        .await
        .map(|_| ())
    }

    /// Sale return: contra-revenue against receivable, plus the cash refunded.
    pub async fn record_sale_return(
        &self,
        return_id: Uuid,
        return_number: &str,
        total: Decimal,
        cash_refunded: Decimal,
        method: PaymentMethod,
    ) -> Result<(), ServiceError> {
        if total > Decimal::ZERO {
            self.post_transaction(
                &format!("Sale return {}", return_number),
                Some("sale_return"),
                Some(return_id),
                vec![
                    debit(ACCOUNT_SALES_RETURNS, total),
                    credit(ACCOUNT_RECEIVABLE, total),
                ],
            )
            .await?;
        }
        if cash_refunded > Decimal::ZERO && method != PaymentMethod::Account {
            self.post_transaction(
                &format!("Refund on sale return {}", return_number),
                Some("sale_return"),
                Some(return_id),
                vec![
                    debit(ACCOUNT_RECEIVABLE, cash_refunded),
                    credit(settlement_account(method), cash_refunded),
                ],
            )
            .await?;
        }
        Ok(())
    }

    /// Purchase return: payable against inventory, plus the cash recovered.
    pub async fn record_purchase_return(
        &self,
        return_id: Uuid,
        return_number: &str,
        total: Decimal,
        cash_recovered: Decimal,
        method: PaymentMethod,
    ) -> Result<(), ServiceError> {
        if total > Decimal::ZERO {
            self.post_transaction(
                &format!("Purchase return {}", return_number),
                Some("purchase_return"),
                Some(return_id),
                vec![
                    debit(ACCOUNT_PAYABLE, total),
                    credit(ACCOUNT_INVENTORY, total),
                ],
            )
            .await?;
        }
        if cash_recovered > Decimal::ZERO && method != PaymentMethod::Account {
            self.post_transaction(
                &format!("Refund on purchase return {}", return_number),
                Some("purchase_return"),
                Some(return_id),
                vec![
                    debit(settlement_account(method), cash_recovered),
                    credit(ACCOUNT_PAYABLE, cash_recovered),
                ],
            )
            .await?;
        }
        Ok(())
    }

    /// Mirrors the sale-return pairs when the return is deleted.
    pub async fn record_sale_return_reversal(
        &self,
        return_id: Uuid,
        return_number: &str,
        total: Decimal,
        cash_refunded: Decimal,
        method: PaymentMethod,
    ) -> Result<(), ServiceError> {
        if cash_refunded > Decimal::ZERO && method != PaymentMethod::Account {
            self.post_transaction(
                &format!("Refund withdrawn on sale return {}", return_number),
                Some("sale_return"),
                Some(return_id),
                vec![
                    debit(settlement_account(method), cash_refunded),
                    credit(ACCOUNT_RECEIVABLE, cash_refunded),
                ],
            )
            .await?;
        }
        if total > Decimal::ZERO {
            self.post_transaction(
                &format!("Reversal of sale return {}", return_number),
                Some("sale_return"),
                Some(return_id),
                vec![
                    debit(ACCOUNT_RECEIVABLE, total),
                    credit(ACCOUNT_SALES_RETURNS, total),
                ],
            )
            .await?;
        }
        Ok(())
    }

    /// Mirrors the purchase-return pairs when the return is deleted.
    pub async fn record_purchase_return_reversal(
        &self,
        return_id: Uuid,
        return_number: &str,
        total: Decimal,
        cash_recovered: Decimal,
        method: PaymentMethod,
    ) -> Result<(), ServiceError> {
        if cash_recovered > Decimal::ZERO && method != PaymentMethod::Account {
            self.post_transaction(
                &format!("Refund returned on purchase return {}", return_number),
                Some("purchase_return"),
                Some(return_id),
                vec![
                    debit(ACCOUNT_PAYABLE, cash_recovered),
                    credit(settlement_account(method), cash_recovered),
                ],
            )
            .await?;
        }
        if total > Decimal::ZERO {
            self.post_transaction(
                &format!("Reversal of purchase return {}", return_number),
                Some("purchase_return"),
                Some(return_id),
                vec![
                    debit(ACCOUNT_INVENTORY, total),
                    credit(ACCOUNT_PAYABLE, total),
                ],
            )
            .await?;
        }
        Ok(())
    }

    /// Expense payment: expense against the settling account.
    pub async fn record_expense_payment(
        &self,
        payment_id: Uuid,
        expense_name: &str,
        amount: Decimal,
        method: PaymentMethod,
    ) -> Result<(), ServiceError> {
        if amount <= Decimal::ZERO {
            return Ok(());
        }
        self.post_transaction(
            &format!("Expense payment: {}", expense_name),
            Some("expense_payment"),
            Some(payment_id),
            vec![
                debit(ACCOUNT_EXPENSES, amount),
                credit(settlement_account(method), amount),
            ],
        )
        .await
        .map(|_| ())
    }

    /// Mirrors the sale pairs when an order is cancelled or deleted.
    pub async fn record_sale_reversal(
        &self,
        order_id: Uuid,
        order_number: &str,
        total: Decimal,
        amount_paid: Decimal,
        method: PaymentMethod,
    ) -> Result<(), ServiceError> {
        if amount_paid > Decimal::ZERO && method != PaymentMethod::Account {
            self.post_transaction(
                &format!("Refund on cancelled sale {}", order_number),
                Some("sales_order"),
                Some(order_id),
                vec![
                    debit(ACCOUNT_RECEIVABLE, amount_paid),
                    credit(settlement_account(method), amount_paid),
                ],
            )
            .await?;
        }
        if total > Decimal::ZERO {
            self.post_transaction(
                &format!("Reversal of sale {}", order_number),
                Some("sales_order"),
                Some(order_id),
                vec![
                    debit(ACCOUNT_REVENUE, total),
                    credit(ACCOUNT_RECEIVABLE, total),
                ],
            )
            .await?;
        }
        Ok(())
    }

    /// Mirrors the purchase pairs when an invoice is cancelled or deleted.
    pub async fn record_purchase_reversal(
        &self,
        invoice_id: Uuid,
        invoice_number: &str,
        total: Decimal,
        amount_paid: Decimal,
        method: PaymentMethod,
    ) -> Result<(), ServiceError> {
        if amount_paid > Decimal::ZERO && method != PaymentMethod::Account {
            self.post_transaction(
                &format!("Refund on cancelled purchase {}", invoice_number),
                Some("purchase_invoice"),
                Some(invoice_id),
                vec![
                    debit(settlement_account(method), amount_paid),
                    credit(ACCOUNT_PAYABLE, amount_paid),
                ],
            )
            .await?;
        }
        if total > Decimal::ZERO {
            self.post_transaction(
                &format!("Reversal of purchase {}", invoice_number),
                Some("purchase_invoice"),
                Some(invoice_id),
                vec![
                    debit(ACCOUNT_PAYABLE, total),
                    credit(ACCOUNT_INVENTORY, total),
                ],
            )
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use sea_orm::DatabaseConnection;

    #[test]
    fn settlement_accounts_follow_the_method() {
        assert_eq!(settlement_account(PaymentMethod::Cash), ACCOUNT_CASH);
        assert_eq!(settlement_account(PaymentMethod::Card), ACCOUNT_BANK);
        assert_eq!(settlement_account(PaymentMethod::BankTransfer), ACCOUNT_BANK);
    }

    #[tokio::test]
    async fn unbalanced_transactions_are_rejected_before_touching_the_database() {
        let service = AccountingService::new(
            Arc::new(DatabaseConnection::Disconnected),
            "USD".to_string(),
        );
        let result = service
            .post_transaction(
                "broken",
                None,
                None,
                vec![debit(ACCOUNT_CASH, dec!(10)), credit(ACCOUNT_REVENUE, dec!(9))],
            )
            .await;
        assert!(matches!(result, Err(ServiceError::InternalError(_))));
    }

    #[tokio::test]
    async fn non_positive_lines_are_rejected() {
        let service = AccountingService::new(
            Arc::new(DatabaseConnection::Disconnected),
            "USD".to_string(),
        );
        let result = service
            .post_transaction(
                "broken",
                None,
                None,
                vec![debit(ACCOUNT_CASH, dec!(0)), credit(ACCOUNT_REVENUE, dec!(0))],
            )
            .await;
        assert!(matches!(result, Err(ServiceError::InternalError(_))));
    }
}
