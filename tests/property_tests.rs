//! Property-based tests for the pure money and costing arithmetic.
//!
//! These tests use proptest to verify invariants across a wide range of inputs,
//! helping to catch edge cases that unit tests might miss.

use proptest::prelude::*;
use rust_decimal::Decimal;
use tradebook_api::entities::sales_order::PaymentStatus;
use tradebook_api::services::balance::{allocate_payment, allocate_refund};
use tradebook_api::services::stock::weighted_average_cost;

// Strategies for generating test data
fn money() -> impl Strategy<Value = Decimal> {
    (0i64..=100_000_000).prop_map(|cents| Decimal::new(cents, 2))
}

fn signed_money() -> impl Strategy<Value = Decimal> {
    (-100_000_000i64..=100_000_000).prop_map(|cents| Decimal::new(cents, 2))
}

fn quantity() -> impl Strategy<Value = Decimal> {
    (1i64..=100_000).prop_map(Decimal::from)
}

// Property: a payment splits exactly into balance relief plus advance credit
proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    #[test]
    fn payment_split_sums_to_the_amount(outstanding in signed_money(), amount in money()) {
        let split = allocate_payment(outstanding, amount);
        prop_assert_eq!(split.applied_to_balance + split.credited_to_advance, amount);
    }

    #[test]
    fn payment_never_relieves_more_than_outstanding(outstanding in signed_money(), amount in money()) {
        let split = allocate_payment(outstanding, amount);
        prop_assert!(
            split.applied_to_balance <= outstanding.max(Decimal::ZERO),
            "applied {} exceeds outstanding {}",
            split.applied_to_balance,
            outstanding
        );
        prop_assert!(split.applied_to_balance >= Decimal::ZERO);
        prop_assert!(split.credited_to_advance >= Decimal::ZERO);
    }

    #[test]
    fn settled_documents_send_everything_to_advance(owed_cents in -100_000_000i64..=0, amount in money()) {
        let split = allocate_payment(Decimal::new(owed_cents, 2), amount);
        prop_assert_eq!(split.applied_to_balance, Decimal::ZERO);
        prop_assert_eq!(split.credited_to_advance, amount);
    }
}

// Property: refunds drain the advance before touching the pending balance
proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    #[test]
    fn refund_components_stay_within_their_buckets(
        advance in money(),
        pending in money(),
        amount in money(),
    ) {
        let split = allocate_refund(advance, pending, amount);
        prop_assert!(split.from_advance >= Decimal::ZERO && split.from_advance <= advance);
        prop_assert!(split.from_pending >= Decimal::ZERO && split.from_pending <= pending);
        prop_assert!(
            split.from_advance + split.from_pending <= amount,
            "split {} + {} exceeds refund {}",
            split.from_advance,
            split.from_pending,
            amount
        );
    }

    #[test]
    fn pending_is_touched_only_once_the_advance_is_empty(
        advance in money(),
        pending in money(),
        amount in money(),
    ) {
        let split = allocate_refund(advance, pending, amount);
        if split.from_pending > Decimal::ZERO {
            prop_assert_eq!(split.from_advance, advance);
        }
    }

    #[test]
    fn refunds_within_the_advance_never_touch_pending(
        a in money(),
        b in money(),
        pending in money(),
    ) {
        let advance = a.max(b);
        let amount = a.min(b);
        let split = allocate_refund(advance, pending, amount);
        prop_assert_eq!(split.from_advance, amount);
        prop_assert_eq!(split.from_pending, Decimal::ZERO);
    }
}

// Property: a blended average cost never leaves the band of its inputs
proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    #[test]
    fn blended_cost_stays_between_the_two_costs(
        old_quantity in quantity(),
        in_quantity in quantity(),
        old_average in money(),
        unit_cost in money(),
    ) {
        let avg = weighted_average_cost(old_quantity, old_average, in_quantity, unit_cost);
        let rounding = Decimal::new(1, 4);
        prop_assert!(
            avg >= old_average.min(unit_cost) - rounding,
            "average {} fell below both costs ({}, {})",
            avg,
            old_average,
            unit_cost
        );
        prop_assert!(
            avg <= old_average.max(unit_cost) + rounding,
            "average {} rose above both costs ({}, {})",
            avg,
            old_average,
            unit_cost
        );
    }

    #[test]
    fn first_receipt_takes_the_invoice_cost(in_quantity in quantity(), unit_cost in money()) {
        let avg = weighted_average_cost(Decimal::ZERO, Decimal::ZERO, in_quantity, unit_cost);
        prop_assert_eq!(avg, unit_cost);
    }

    #[test]
    fn equal_batches_blend_symmetrically(q in quantity(), a in money(), b in money()) {
        prop_assert_eq!(
            weighted_average_cost(q, a, q, b),
            weighted_average_cost(q, b, q, a)
        );
    }
}

// Property: payment status follows the paid/total boundaries exactly
proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn zero_or_negative_payments_read_unpaid(paid_cents in -100_000_000i64..=0, total in money()) {
        let status = PaymentStatus::for_amounts(Decimal::new(paid_cents, 2), total);
        prop_assert_eq!(status, PaymentStatus::Unpaid);
    }

    #[test]
    fn payments_short_of_the_total_read_partial(paid_cents in 1i64..=100_000_000, gap_cents in 1i64..=100_000_000) {
        let paid = Decimal::new(paid_cents, 2);
        let total = paid + Decimal::new(gap_cents, 2);
        prop_assert_eq!(PaymentStatus::for_amounts(paid, total), PaymentStatus::Partial);
    }

    #[test]
    fn paying_the_total_or_beyond_reads_paid(total_cents in 1i64..=100_000_000, extra_cents in 0i64..=100_000_000) {
        let total = Decimal::new(total_cents, 2);
        let paid = total + Decimal::new(extra_cents, 2);
        prop_assert_eq!(PaymentStatus::for_amounts(paid, total), PaymentStatus::Paid);
    }
}
