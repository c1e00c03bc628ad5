// Consistency engine
pub mod balance;
pub mod compensation;
pub mod stock;

// Document services
pub mod expenses;
pub mod purchase_invoices;
pub mod returns;
pub mod sales_orders;

// Master data
pub mod parties;
pub mod products;

// Bookkeeping and reporting collaborators
pub mod accounting;
pub mod stock_ledger;

use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

/// Short human-readable document number, e.g. `SO-9F2C41AB`. Uniqueness is
/// enforced by the column constraint; collisions on 8 hex chars are not a
/// practical concern at this scale.
pub(crate) fn document_number(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, id[..8].to_uppercase())
}

/// Net quantity change per product between the stored lines of a document and
/// the requested ones. Positive means the new version carries more quantity.
pub(crate) fn quantity_deltas(
    old: &HashMap<Uuid, Decimal>,
    new: &HashMap<Uuid, Decimal>,
) -> Vec<(Uuid, Decimal)> {
    let mut deltas = Vec::new();
    for (product_id, qty) in new {
        let previous = old.get(product_id).copied().unwrap_or(Decimal::ZERO);
        if *qty != previous {
            deltas.push((*product_id, *qty - previous));
        }
    }
    for (product_id, qty) in old {
        if !new.contains_key(product_id) {
            deltas.push((*product_id, -*qty));
        }
    }
    deltas
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn document_numbers_carry_the_prefix_and_a_short_suffix() {
        let number = document_number("SO");
        assert!(number.starts_with("SO-"));
        assert_eq!(number.len(), 11);
        assert!(number[3..]
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn quantity_deltas_cover_added_changed_and_removed_products() {
        let kept = Uuid::new_v4();
        let removed = Uuid::new_v4();
        let added = Uuid::new_v4();
        let old = HashMap::from([(kept, dec!(5)), (removed, dec!(2))]);
        let new = HashMap::from([(kept, dec!(3)), (added, dec!(4))]);

        let by_id: HashMap<Uuid, Decimal> = quantity_deltas(&old, &new).into_iter().collect();
        assert_eq!(by_id.len(), 3);
        assert_eq!(by_id[&kept], dec!(-2));
        assert_eq!(by_id[&removed], dec!(-2));
        assert_eq!(by_id[&added], dec!(4));
    }
}
