use crate::{
    entities::customer::{self, Entity as CustomerEntity},
    entities::purchase_invoice::{self, Entity as PurchaseInvoiceEntity},
    entities::purchase_return::{self, Entity as PurchaseReturnEntity},
    entities::sale_return::{self, Entity as SaleReturnEntity},
    entities::sales_order::{self, Entity as SalesOrderEntity},
    entities::supplier::{self, Entity as SupplierEntity},
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::IntCounter;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

lazy_static! {
    static ref BALANCE_RECALCULATIONS: IntCounter = IntCounter::new(
        "balance_recalculations_total",
        "Total number of party balance recalculations"
    )
    .expect("metric can be created");
    static ref BALANCE_FLOOR_CLAMPS: IntCounter = IntCounter::new(
        "balance_floor_clamps_total",
        "Total number of balance writes clamped at zero"
    )
    .expect("metric can be created");
}

/// The side of the books a party sits on. Customers owe us, we owe suppliers;
/// the balance arithmetic is identical for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PartyKind {
    Customer,
    Supplier,
}

impl PartyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartyKind::Customer => "customer",
            PartyKind::Supplier => "supplier",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PartyRef {
    pub kind: PartyKind,
    pub id: Uuid,
}

impl PartyRef {
    pub fn customer(id: Uuid) -> Self {
        Self {
            kind: PartyKind::Customer,
            id,
        }
    }

    pub fn supplier(id: Uuid) -> Self {
        Self {
            kind: PartyKind::Supplier,
            id,
        }
    }
}

impl fmt::Display for PartyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.as_str(), self.id)
    }
}

/// Which denormalized figure a document's unpaid amount currently occupies:
/// `Pending` until the document is confirmed, `Posted` afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceBucket {
    Pending,
    Posted,
}

impl BalanceBucket {
    fn field(&self) -> &'static str {
        match self {
            BalanceBucket::Pending => "pending_balance",
            BalanceBucket::Posted => "current_balance",
        }
    }
}

/// Snapshot of a party's denormalized balance figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PartyBalances {
    pub pending_balance: Decimal,
    pub current_balance: Decimal,
    pub advance_balance: Decimal,
    pub credit_limit: Decimal,
}

/// How a payment was absorbed: the part that cancelled outstanding balance and
/// the overflow credited to the party's advance. Persisted on the paying
/// document so reversal and recalculation stay exact.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PaymentSplit {
    pub applied_to_balance: Decimal,
    pub credited_to_advance: Decimal,
}

impl PaymentSplit {
    pub fn total(&self) -> Decimal {
        self.applied_to_balance + self.credited_to_advance
    }
}

/// How a refund was absorbed: advance drained first, the remainder taken from
/// the pending balance. Persisted on the return document.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RefundSplit {
    pub from_advance: Decimal,
    pub from_pending: Decimal,
}

/// Outcome of a credit check, with the numbers behind the verdict.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreditCheck {
    pub allowed: bool,
    pub party_id: Uuid,
    pub current_balance: Decimal,
    pub credit_limit: Decimal,
    pub requested: Decimal,
    pub projected_balance: Decimal,
}

impl CreditCheck {
    /// Converts a failed check into the error carrying its numbers.
    pub fn into_error(self) -> ServiceError {
        ServiceError::CreditLimitExceeded {
            party_id: self.party_id,
            current_balance: self.current_balance,
            credit_limit: self.credit_limit,
            requested: self.requested,
            projected_balance: self.projected_balance,
        }
    }
}

/// Before/after report of a full balance recomputation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BalanceRecalculation {
    pub party_id: Uuid,
    pub party_kind: PartyKind,
    pub before: PartyBalances,
    pub after: PartyBalances,
    pub drift_detected: bool,
}

/// Splits a payment between outstanding balance and advance credit. Phase one
/// absorbs up to the paying document's outstanding contribution, phase two
/// credits the overflow to the advance.
pub fn allocate_payment(outstanding: Decimal, amount: Decimal) -> PaymentSplit {
    let applied = amount.min(outstanding.max(Decimal::ZERO));
    PaymentSplit {
        applied_to_balance: applied,
        credited_to_advance: amount - applied,
    }
}

/// Splits a refund between the advance balance (drained first) and the pending
/// balance (the remainder, capped so pending never goes negative). Anything
/// beyond both buckets leaves as cash and is not recorded in the split.
pub fn allocate_refund(advance: Decimal, pending: Decimal, amount: Decimal) -> RefundSplit {
    let from_advance = amount.min(advance.max(Decimal::ZERO));
    let remainder = amount - from_advance;
    RefundSplit {
        from_advance,
        from_pending: remainder.min(pending.max(Decimal::ZERO)),
    }
}

/// Maintains the three denormalized balance figures per party. Every mutation
/// takes the caller's connection so document services can run balance moves
/// inside their own transactions.
#[derive(Clone)]
pub struct PartyBalanceService {
    event_sender: Option<Arc<EventSender>>,
}

impl PartyBalanceService {
    pub fn new(event_sender: Option<Arc<EventSender>>) -> Self {
        Self { event_sender }
    }

    /// Reads the current balance figures for a party.
    pub async fn get_balances<C: ConnectionTrait>(
        &self,
        db: &C,
        party: PartyRef,
    ) -> Result<PartyBalances, ServiceError> {
        self.load(db, party).await
    }

    /// Records a new charge against the party's pending balance.
    #[instrument(skip(self, db), fields(party = %party, amount = %amount))]
    pub async fn record_charge<C: ConnectionTrait>(
        &self,
        db: &C,
        party: PartyRef,
        amount: Decimal,
    ) -> Result<(), ServiceError> {
        if amount < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Charge amount cannot be negative".to_string(),
            ));
        }

        let mut balances = self.load(db, party).await?;
        balances.pending_balance += amount;
        self.store(db, party, &balances).await
    }

    /// Allocates a payment: phase one cancels the paying document's outstanding
    /// contribution in its bucket, phase two credits the overflow to advance.
    /// Returns the split for the caller to persist on the document.
    #[instrument(skip(self, db), fields(party = %party, amount = %amount, outstanding = %outstanding))]
    pub async fn record_payment<C: ConnectionTrait>(
        &self,
        db: &C,
        party: PartyRef,
        amount: Decimal,
        outstanding: Decimal,
        bucket: BalanceBucket,
    ) -> Result<PaymentSplit, ServiceError> {
        if amount < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Payment amount cannot be negative".to_string(),
            ));
        }

        let split = allocate_payment(outstanding, amount);
        if split.total() == Decimal::ZERO {
            return Ok(split);
        }

        let mut balances = self.load(db, party).await?;
        match bucket {
            BalanceBucket::Pending => {
                balances.pending_balance = self.floor_at_zero(
                    balances.pending_balance - split.applied_to_balance,
                    party,
                    bucket.field(),
                );
            }
            BalanceBucket::Posted => {
                balances.current_balance = self.floor_at_zero(
                    balances.current_balance - split.applied_to_balance,
                    party,
                    bucket.field(),
                );
            }
        }
        balances.advance_balance += split.credited_to_advance;
        self.store(db, party, &balances).await?;

        Ok(split)
    }

    /// Allocates a refund: advance drained first, the remainder reduces the
    /// pending balance, floored at zero. Returns the split actually applied.
    #[instrument(skip(self, db), fields(party = %party, amount = %amount))]
    pub async fn record_refund<C: ConnectionTrait>(
        &self,
        db: &C,
        party: PartyRef,
        amount: Decimal,
    ) -> Result<RefundSplit, ServiceError> {
        if amount < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Refund amount cannot be negative".to_string(),
            ));
        }

        let mut balances = self.load(db, party).await?;
        let split = allocate_refund(balances.advance_balance, balances.pending_balance, amount);
        balances.advance_balance = (balances.advance_balance - split.from_advance).max(Decimal::ZERO);
        balances.pending_balance = (balances.pending_balance - split.from_pending).max(Decimal::ZERO);
        self.store(db, party, &balances).await?;

        Ok(split)
    }

    /// Moves a document's unpaid amount from pending to current on confirmation.
    #[instrument(skip(self, db), fields(party = %party, unpaid = %unpaid))]
    pub async fn confirm_charge<C: ConnectionTrait>(
        &self,
        db: &C,
        party: PartyRef,
        unpaid: Decimal,
    ) -> Result<(), ServiceError> {
        if unpaid < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Unpaid amount cannot be negative".to_string(),
            ));
        }
        if unpaid == Decimal::ZERO {
            return Ok(());
        }

        let mut balances = self.load(db, party).await?;
        balances.pending_balance =
            self.floor_at_zero(balances.pending_balance - unpaid, party, "pending_balance");
        balances.current_balance += unpaid;
        self.store(db, party, &balances).await
    }

    /// Removes a charge from the bucket it occupies, clamped at zero.
    #[instrument(skip(self, db), fields(party = %party, amount = %amount, bucket = ?bucket))]
    pub async fn reverse_charge<C: ConnectionTrait>(
        &self,
        db: &C,
        party: PartyRef,
        amount: Decimal,
        bucket: BalanceBucket,
    ) -> Result<(), ServiceError> {
        if amount <= Decimal::ZERO {
            return Ok(());
        }

        let mut balances = self.load(db, party).await?;
        match bucket {
            BalanceBucket::Pending => {
                balances.pending_balance = self.floor_at_zero(
                    balances.pending_balance - amount,
                    party,
                    bucket.field(),
                );
            }
            BalanceBucket::Posted => {
                balances.current_balance = self.floor_at_zero(
                    balances.current_balance - amount,
                    party,
                    bucket.field(),
                );
            }
        }
        self.store(db, party, &balances).await
    }

    /// Exact inverse of a recorded payment using its persisted split: the
    /// applied part returns to the bucket, the advance credit is taken back.
    #[instrument(skip(self, db, split), fields(party = %party))]
    pub async fn reverse_payment_split<C: ConnectionTrait>(
        &self,
        db: &C,
        party: PartyRef,
        split: &PaymentSplit,
        bucket: BalanceBucket,
    ) -> Result<(), ServiceError> {
        if split.total() == Decimal::ZERO {
            return Ok(());
        }

        let mut balances = self.load(db, party).await?;
        match bucket {
            BalanceBucket::Pending => balances.pending_balance += split.applied_to_balance,
            BalanceBucket::Posted => balances.current_balance += split.applied_to_balance,
        }
        balances.advance_balance = self.floor_at_zero(
            balances.advance_balance - split.credited_to_advance,
            party,
            "advance_balance",
        );
        self.store(db, party, &balances).await
    }

    /// Exact inverse of a recorded refund using its persisted split.
    #[instrument(skip(self, db, split), fields(party = %party))]
    pub async fn reverse_refund_split<C: ConnectionTrait>(
        &self,
        db: &C,
        party: PartyRef,
        split: &RefundSplit,
    ) -> Result<(), ServiceError> {
        if split.from_advance == Decimal::ZERO && split.from_pending == Decimal::ZERO {
            return Ok(());
        }

        let mut balances = self.load(db, party).await?;
        balances.advance_balance += split.from_advance;
        balances.pending_balance += split.from_pending;
        self.store(db, party, &balances).await
    }

    /// Applies a signed total delta to the bucket a document occupies, used by
    /// the document-update path.
    #[instrument(skip(self, db), fields(party = %party, delta = %delta, bucket = ?bucket))]
    pub async fn apply_charge_delta<C: ConnectionTrait>(
        &self,
        db: &C,
        party: PartyRef,
        delta: Decimal,
        bucket: BalanceBucket,
    ) -> Result<(), ServiceError> {
        if delta == Decimal::ZERO {
            return Ok(());
        }

        let mut balances = self.load(db, party).await?;
        match bucket {
            BalanceBucket::Pending => {
                balances.pending_balance = self.floor_at_zero(
                    balances.pending_balance + delta,
                    party,
                    bucket.field(),
                );
            }
            BalanceBucket::Posted => {
                balances.current_balance = self.floor_at_zero(
                    balances.current_balance + delta,
                    party,
                    bucket.field(),
                );
            }
        }
        self.store(db, party, &balances).await
    }

    /// Checks whether a new charge fits under the party's credit limit. The
    /// verdict always carries the full numeric context; a zero limit means no
    /// credit at all.
    #[instrument(skip(self, db), fields(party = %party, amount = %amount))]
    pub async fn can_accept_charge<C: ConnectionTrait>(
        &self,
        db: &C,
        party: PartyRef,
        amount: Decimal,
    ) -> Result<CreditCheck, ServiceError> {
        let balances = self.load(db, party).await?;
        let projected = balances.current_balance + amount;

        Ok(CreditCheck {
            allowed: projected <= balances.credit_limit,
            party_id: party.id,
            current_balance: balances.current_balance,
            credit_limit: balances.credit_limit,
            requested: amount,
            projected_balance: projected,
        })
    }

    /// Recomputes the three balance figures from the party's source documents
    /// and persisted splits, repairing any drift. Idempotent: for an untouched
    /// document set it reproduces what the incremental updates built.
    #[instrument(skip(self, db), fields(party = %party))]
    pub async fn recalculate_balance(
        &self,
        db: &DatabaseConnection,
        party: PartyRef,
    ) -> Result<BalanceRecalculation, ServiceError> {
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;

        let before = self.load(&txn, party).await?;
        let mut pending = Decimal::ZERO;
        let mut current = Decimal::ZERO;
        let mut advance = Decimal::ZERO;

        match party.kind {
            PartyKind::Customer => {
                let orders = SalesOrderEntity::find()
                    .filter(sales_order::Column::CustomerId.eq(party.id))
                    .all(&txn)
                    .await
                    .map_err(ServiceError::DatabaseError)?;
                for order in orders {
                    if order.status == sales_order::OrderStatus::Cancelled {
                        continue;
                    }
                    let contribution = order.total_amount - order.balance_applied;
                    if order.status.is_posted() {
                        current += contribution;
                    } else {
                        pending += contribution;
                    }
                    advance += order.advance_credited;
                }

                let returns = SaleReturnEntity::find()
                    .filter(sale_return::Column::CustomerId.eq(party.id))
                    .all(&txn)
                    .await
                    .map_err(ServiceError::DatabaseError)?;
                for ret in returns {
                    pending -= ret.refunded_from_pending;
                    advance -= ret.refunded_from_advance;
                }
            }
            PartyKind::Supplier => {
                let invoices = PurchaseInvoiceEntity::find()
                    .filter(purchase_invoice::Column::SupplierId.eq(party.id))
                    .all(&txn)
                    .await
                    .map_err(ServiceError::DatabaseError)?;
                for invoice in invoices {
                    if invoice.status == purchase_invoice::InvoiceStatus::Cancelled {
                        continue;
                    }
                    let contribution = invoice.total_amount - invoice.balance_applied;
                    if invoice.status.is_posted() {
                        current += contribution;
                    } else {
                        pending += contribution;
                    }
                    advance += invoice.advance_credited;
                }

                let returns = PurchaseReturnEntity::find()
                    .filter(purchase_return::Column::SupplierId.eq(party.id))
                    .all(&txn)
                    .await
                    .map_err(ServiceError::DatabaseError)?;
                for ret in returns {
                    pending -= ret.refunded_from_pending;
                    advance -= ret.refunded_from_advance;
                }
            }
        }

        let after = PartyBalances {
            pending_balance: pending.max(Decimal::ZERO),
            current_balance: current.max(Decimal::ZERO),
            advance_balance: advance.max(Decimal::ZERO),
            credit_limit: before.credit_limit,
        };
        self.store(&txn, party, &after).await?;

        txn.commit().await.map_err(ServiceError::DatabaseError)?;
        BALANCE_RECALCULATIONS.inc();

        let drift_detected = before != after;
        if drift_detected {
            warn!(
                party = %party,
                before = ?before,
                after = ?after,
                "Balance recalculation corrected drifted figures"
            );
            self.emit_drift_events(party, &before, &after).await;
        } else {
            info!(party = %party, "Balance recalculation confirmed stored figures");
        }

        if let Some(sender) = &self.event_sender {
            let _ = sender
                .send(Event::BalanceRecalculated {
                    party_type: party.kind.as_str().to_string(),
                    party_id: party.id,
                })
                .await;
        }

        Ok(BalanceRecalculation {
            party_id: party.id,
            party_kind: party.kind,
            before,
            after,
            drift_detected,
        })
    }

    async fn emit_drift_events(&self, party: PartyRef, before: &PartyBalances, after: &PartyBalances) {
        let Some(sender) = &self.event_sender else {
            return;
        };
        let fields = [
            ("pending_balance", before.pending_balance, after.pending_balance),
            ("current_balance", before.current_balance, after.current_balance),
            ("advance_balance", before.advance_balance, after.advance_balance),
        ];
        for (field, stored, computed) in fields {
            if stored != computed {
                let _ = sender
                    .send(Event::BalanceDriftDetected {
                        party_type: party.kind.as_str().to_string(),
                        party_id: party.id,
                        field: field.to_string(),
                        stored,
                        computed,
                    })
                    .await;
            }
        }
    }

    fn floor_at_zero(&self, value: Decimal, party: PartyRef, field: &str) -> Decimal {
        if value < Decimal::ZERO {
            warn!(
                party = %party,
                field = field,
                value = %value,
                "Balance write clamped at zero; run a recalculation to repair drift"
            );
            BALANCE_FLOOR_CLAMPS.inc();
            Decimal::ZERO
        } else {
            value
        }
    }

    async fn load<C: ConnectionTrait>(
        &self,
        db: &C,
        party: PartyRef,
    ) -> Result<PartyBalances, ServiceError> {
        match party.kind {
            PartyKind::Customer => {
                let model = CustomerEntity::find_by_id(party.id)
                    .one(db)
                    .await
                    .map_err(ServiceError::DatabaseError)?
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!("Customer {} not found", party.id))
                    })?;
                Ok(PartyBalances {
                    pending_balance: model.pending_balance,
                    current_balance: model.current_balance,
                    advance_balance: model.advance_balance,
                    credit_limit: model.credit_limit,
                })
            }
            PartyKind::Supplier => {
                let model = SupplierEntity::find_by_id(party.id)
                    .one(db)
                    .await
                    .map_err(ServiceError::DatabaseError)?
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!("Supplier {} not found", party.id))
                    })?;
                Ok(PartyBalances {
                    pending_balance: model.pending_balance,
                    current_balance: model.current_balance,
                    advance_balance: model.advance_balance,
                    credit_limit: model.credit_limit,
                })
            }
        }
    }

    async fn store<C: ConnectionTrait>(
        &self,
        db: &C,
        party: PartyRef,
        balances: &PartyBalances,
    ) -> Result<(), ServiceError> {
        let now = Utc::now();
        match party.kind {
            PartyKind::Customer => {
                CustomerEntity::update_many()
                    .col_expr(
                        customer::Column::PendingBalance,
                        Expr::value(balances.pending_balance),
                    )
                    .col_expr(
                        customer::Column::CurrentBalance,
                        Expr::value(balances.current_balance),
                    )
                    .col_expr(
                        customer::Column::AdvanceBalance,
                        Expr::value(balances.advance_balance),
                    )
                    .col_expr(customer::Column::UpdatedAt, Expr::value(now))
                    .filter(customer::Column::Id.eq(party.id))
                    .exec(db)
                    .await
                    .map_err(ServiceError::DatabaseError)?;
            }
            PartyKind::Supplier => {
                SupplierEntity::update_many()
                    .col_expr(
                        supplier::Column::PendingBalance,
                        Expr::value(balances.pending_balance),
                    )
                    .col_expr(
                        supplier::Column::CurrentBalance,
                        Expr::value(balances.current_balance),
                    )
                    .col_expr(
                        supplier::Column::AdvanceBalance,
                        Expr::value(balances.advance_balance),
                    )
                    .col_expr(supplier::Column::UpdatedAt, Expr::value(now))
                    .filter(supplier::Column::Id.eq(party.id))
                    .exec(db)
                    .await
                    .map_err(ServiceError::DatabaseError)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn payment_within_outstanding_is_fully_applied() {
        let split = allocate_payment(dec!(100), dec!(30));
        assert_eq!(split.applied_to_balance, dec!(30));
        assert_eq!(split.credited_to_advance, dec!(0));
    }

    #[test]
    fn payment_overflow_credits_advance() {
        let split = allocate_payment(dec!(100), dec!(120));
        assert_eq!(split.applied_to_balance, dec!(100));
        assert_eq!(split.credited_to_advance, dec!(20));
    }

    #[test]
    fn payment_against_zero_outstanding_goes_entirely_to_advance() {
        let split = allocate_payment(dec!(0), dec!(50));
        assert_eq!(split.applied_to_balance, dec!(0));
        assert_eq!(split.credited_to_advance, dec!(50));
    }

    #[test]
    fn negative_outstanding_is_treated_as_zero() {
        let split = allocate_payment(dec!(-10), dec!(50));
        assert_eq!(split.applied_to_balance, dec!(0));
        assert_eq!(split.credited_to_advance, dec!(50));
    }

    #[test]
    fn refund_drains_advance_first() {
        let split = allocate_refund(dec!(40), dec!(100), dec!(50));
        assert_eq!(split.from_advance, dec!(40));
        assert_eq!(split.from_pending, dec!(10));
    }

    #[test]
    fn refund_covered_by_advance_leaves_pending_untouched() {
        let split = allocate_refund(dec!(80), dec!(100), dec!(50));
        assert_eq!(split.from_advance, dec!(50));
        assert_eq!(split.from_pending, dec!(0));
    }

    #[test]
    fn refund_beyond_both_buckets_is_capped() {
        let split = allocate_refund(dec!(10), dec!(5), dec!(50));
        assert_eq!(split.from_advance, dec!(10));
        assert_eq!(split.from_pending, dec!(5));
    }

    #[test]
    fn credit_check_error_carries_the_numbers() {
        let check = CreditCheck {
            allowed: false,
            party_id: Uuid::new_v4(),
            current_balance: dec!(80),
            credit_limit: dec!(100),
            requested: dec!(30),
            projected_balance: dec!(110),
        };
        match check.into_error() {
            ServiceError::CreditLimitExceeded {
                projected_balance, ..
            } => assert_eq!(projected_balance, dec!(110)),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
