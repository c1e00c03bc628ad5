use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
    utoipa::ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExpenseFrequency {
    #[sea_orm(string_value = "daily")]
    Daily,
    #[sea_orm(string_value = "weekly")]
    Weekly,
    #[sea_orm(string_value = "monthly")]
    Monthly,
    #[sea_orm(string_value = "quarterly")]
    Quarterly,
    #[sea_orm(string_value = "yearly")]
    Yearly,
}

impl ExpenseFrequency {
    /// Next due date one period after the given date. Month arithmetic clamps
    /// to the last day of shorter months.
    pub fn advance(&self, from: NaiveDate) -> NaiveDate {
        match self {
            Self::Daily => from + chrono::Duration::days(1),
            Self::Weekly => from + chrono::Duration::weeks(1),
            Self::Monthly => add_months(from, 1),
            Self::Quarterly => add_months(from, 3),
            Self::Yearly => add_months(from, 12),
        }
    }
}

fn add_months(date: NaiveDate, months: u32) -> NaiveDate {
    date.checked_add_months(chrono::Months::new(months))
        .unwrap_or(date)
}

/// Recurring operating cost (rent, utilities, subscriptions). Due dates advance
/// when a payment is recorded, not on a timer.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "recurring_expenses")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub name: String,
    pub category: Option<String>,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub amount: Decimal,
    pub frequency: ExpenseFrequency,
    pub supplier_id: Option<Uuid>,
    pub next_due_date: Date,
    pub is_active: bool,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::supplier::Entity",
        from = "Column::SupplierId",
        to = "super::supplier::Column::Id"
    )]
    Supplier,
    #[sea_orm(has_many = "super::expense_payment::Entity")]
    Payments,
}

impl Related<super::supplier::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Supplier.def()
    }
}

impl Related<super::expense_payment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Payments.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn monthly_advance_clamps_to_month_end() {
        assert_eq!(
            ExpenseFrequency::Monthly.advance(d(2025, 1, 31)),
            d(2025, 2, 28)
        );
    }

    #[test]
    fn quarterly_advance_spans_three_months() {
        assert_eq!(
            ExpenseFrequency::Quarterly.advance(d(2025, 11, 30)),
            d(2026, 2, 28)
        );
    }

    #[test]
    fn weekly_advance_adds_seven_days() {
        assert_eq!(
            ExpenseFrequency::Weekly.advance(d(2025, 3, 28)),
            d(2025, 4, 4)
        );
    }
}
