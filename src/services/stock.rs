use crate::{
    db::DbPool,
    entities::inventory_stock::{self, Entity as InventoryStockEntity, StockStatus},
    entities::product::{self, Entity as ProductEntity},
    entities::stock_movement::{self, Entity as StockMovementEntity, MovementType},
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::IntCounter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

lazy_static! {
    static ref STOCK_MOVEMENTS_RECORDED: IntCounter = IntCounter::new(
        "stock_movements_recorded_total",
        "Total number of stock movements written"
    )
    .expect("metric can be created");
    static ref STOCK_REJECTIONS: IntCounter = IntCounter::new(
        "stock_update_rejections_total",
        "Total number of stock updates rejected for insufficient availability"
    )
    .expect("metric can be created");
}

/// Reference type marking a write-off; ledger reconstruction picks these
/// movements up as damage entries.
pub const DAMAGE_REFERENCE: &str = "damage";

/// Reason written on synthetic movements that align a drifted product cache.
pub const CACHE_SYNC_REASON: &str = "cache_sync";

/// A requested stock mutation. `quantity` is positive for `In`/`Out` and
/// signed for `Adjustment`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockUpdateInput {
    pub product_id: Uuid,
    pub movement_type: MovementType,
    pub quantity: Decimal,
    pub unit_cost: Option<Decimal>,
    pub reason: String,
    pub reference_type: Option<String>,
    pub reference_id: Option<Uuid>,
    pub performed_by: String,
}

/// What a stock mutation actually did, with the audit row it wrote.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StockUpdateResult {
    pub product_id: Uuid,
    pub movement_id: Uuid,
    pub movement_type: MovementType,
    pub quantity: Decimal,
    pub previous_stock: Decimal,
    pub new_stock: Decimal,
    pub available_stock: Decimal,
    pub average_cost: Decimal,
}

// Working copy of a stock record inside the update transaction. Seeded rows
// are inserted once with their final figures.
struct RecordState {
    id: Uuid,
    current: Decimal,
    reserved: Decimal,
    average_cost: Decimal,
    is_new: bool,
}

/// Owns the per-product stock records and their audit trail. Every mutation
/// runs in its own short transaction; the product row's `current_stock` is a
/// cache refreshed from the record on each write.
#[derive(Clone)]
pub struct InventoryStockService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
}

impl InventoryStockService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    pub(crate) fn events(&self) -> Option<&Arc<EventSender>> {
        self.event_sender.as_ref()
    }

    /// Applies one stock mutation: drift sync, availability check, the write
    /// itself, the audit movement, average-cost maintenance and the cache
    /// refresh, all in a single transaction.
    #[instrument(skip(self, input), fields(product_id = %input.product_id, movement_type = ?input.movement_type, quantity = %input.quantity))]
    pub async fn update_stock(
        &self,
        input: StockUpdateInput,
    ) -> Result<StockUpdateResult, ServiceError> {
        match input.movement_type {
            MovementType::In | MovementType::Out => {
                if input.quantity <= Decimal::ZERO {
                    return Err(ServiceError::ValidationError(
                        "Stock in/out quantity must be positive".to_string(),
                    ));
                }
            }
            MovementType::Adjustment => {
                if input.quantity == Decimal::ZERO {
                    return Err(ServiceError::ValidationError(
                        "Adjustment quantity cannot be zero".to_string(),
                    ));
                }
            }
        }

        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;

        let product = ProductEntity::find_by_id(input.product_id)
            .one(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", input.product_id))
            })?;

        let mut state = self.load_or_seed(&txn, &product).await?;

        // The product cache can run ahead of the record when rows were touched
        // outside this service. A higher cache is adopted through a synthetic
        // movement; a lower cache is stale and gets overwritten on refresh.
        if product.current_stock > state.current {
            let drift = product.current_stock - state.current;
            self.insert_movement(
                &txn,
                product.id,
                MovementType::Adjustment,
                drift,
                state.current,
                product.current_stock,
                None,
                CACHE_SYNC_REASON,
                Some(CACHE_SYNC_REASON.to_string()),
                None,
                "system",
            )
            .await?;
            warn!(
                product_id = %product.id,
                record_stock = %state.current,
                cache_stock = %product.current_stock,
                "Adopted higher product cache into stock record"
            );
            state.current = product.current_stock;
        }

        let delta = match input.movement_type {
            MovementType::In => input.quantity,
            MovementType::Out => -input.quantity,
            MovementType::Adjustment => input.quantity,
        };

        if delta < Decimal::ZERO {
            let needed = delta.abs();
            match input.movement_type {
                MovementType::Out => {
                    let available = state.current - state.reserved;
                    if available < needed {
                        STOCK_REJECTIONS.inc();
                        return Err(ServiceError::InsufficientStock {
                            product_id: product.id,
                            requested: needed,
                            available: available.max(Decimal::ZERO),
                        });
                    }
                }
                _ => {
                    // Adjustments ignore reservations but may not take the
                    // record below zero.
                    if state.current < needed {
                        STOCK_REJECTIONS.inc();
                        return Err(ServiceError::InsufficientStock {
                            product_id: product.id,
                            requested: needed,
                            available: state.current.max(Decimal::ZERO),
                        });
                    }
                }
            }
        }

        let previous_stock = state.current;
        let new_stock = previous_stock + delta;

        if input.movement_type == MovementType::In {
            if let Some(cost) = input.unit_cost {
                state.average_cost = weighted_average_cost(
                    previous_stock,
                    state.average_cost,
                    input.quantity,
                    cost,
                );
            }
        }

        // Damage write-offs are valued at the running average when the caller
        // did not price them.
        let recorded_cost = match (input.unit_cost, input.reference_type.as_deref()) {
            (Some(cost), _) => Some(cost),
            (None, Some(DAMAGE_REFERENCE)) => Some(state.average_cost),
            _ => None,
        };

        let movement_id = self
            .insert_movement(
                &txn,
                product.id,
                input.movement_type,
                delta,
                previous_stock,
                new_stock,
                recorded_cost,
                &input.reason,
                input.reference_type.clone(),
                input.reference_id,
                &input.performed_by,
            )
            .await?;

        state.current = new_stock;
        let available_stock = (state.current - state.reserved).max(Decimal::ZERO);
        self.persist_record(&txn, product.id, &state, available_stock)
            .await?;

        let mut product_model: product::ActiveModel = product.into();
        product_model.current_stock = Set(new_stock);
        product_model.updated_at = Set(Utc::now());
        product_model
            .update(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;

        txn.commit().await.map_err(ServiceError::DatabaseError)?;
        STOCK_MOVEMENTS_RECORDED.inc();

        info!(
            product_id = %input.product_id,
            movement_id = %movement_id,
            previous_stock = %previous_stock,
            new_stock = %new_stock,
            "Stock updated"
        );

        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender
                .send(Event::StockUpdated {
                    product_id: input.product_id,
                    movement_type: input.movement_type.to_string(),
                    quantity: delta,
                    previous_stock,
                    new_stock,
                })
                .await
            {
                warn!(error = %e, product_id = %input.product_id, "Failed to send stock update event");
            }
        }

        Ok(StockUpdateResult {
            product_id: input.product_id,
            movement_id,
            movement_type: input.movement_type,
            quantity: delta,
            previous_stock,
            new_stock,
            available_stock,
            average_cost: state.average_cost,
        })
    }

    /// Writes off damaged goods: a negative adjustment valued at the running
    /// average cost, flagged so ledger reconstruction reports it.
    #[instrument(skip(self), fields(product_id = %product_id, quantity = %quantity))]
    pub async fn record_damage(
        &self,
        product_id: Uuid,
        quantity: Decimal,
        reason: Option<String>,
        performed_by: String,
    ) -> Result<StockUpdateResult, ServiceError> {
        if quantity <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Damage quantity must be positive".to_string(),
            ));
        }

        self.update_stock(StockUpdateInput {
            product_id,
            movement_type: MovementType::Adjustment,
            quantity: -quantity,
            unit_cost: None,
            reason: reason.unwrap_or_else(|| "damage write-off".to_string()),
            reference_type: Some(DAMAGE_REFERENCE.to_string()),
            reference_id: None,
            performed_by,
        })
        .await
    }

    /// Places a soft hold: moves quantity from available to reserved without
    /// touching `current_stock`.
    #[instrument(skip(self), fields(product_id = %product_id, quantity = %quantity))]
    pub async fn reserve_stock(
        &self,
        product_id: Uuid,
        quantity: Decimal,
    ) -> Result<inventory_stock::Model, ServiceError> {
        if quantity <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Reservation quantity must be positive".to_string(),
            ));
        }

        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;

        let product = ProductEntity::find_by_id(product_id)
            .one(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;

        let mut state = self.load_or_seed(&txn, &product).await?;
        let available = state.current - state.reserved;
        if available < quantity {
            STOCK_REJECTIONS.inc();
            return Err(ServiceError::InsufficientStock {
                product_id,
                requested: quantity,
                available: available.max(Decimal::ZERO),
            });
        }

        state.reserved += quantity;
        let available_stock = (state.current - state.reserved).max(Decimal::ZERO);
        self.persist_record(&txn, product_id, &state, available_stock)
            .await?;
        txn.commit().await.map_err(ServiceError::DatabaseError)?;

        if let Some(sender) = &self.event_sender {
            let _ = sender
                .send(Event::StockReserved {
                    product_id,
                    quantity,
                })
                .await;
        }

        self.require_stock(product_id).await
    }

    /// Releases a soft hold, flooring the reserved figure at zero.
    #[instrument(skip(self), fields(product_id = %product_id, quantity = %quantity))]
    pub async fn release_stock(
        &self,
        product_id: Uuid,
        quantity: Decimal,
    ) -> Result<inventory_stock::Model, ServiceError> {
        if quantity <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Release quantity must be positive".to_string(),
            ));
        }

        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;

        let record = InventoryStockEntity::find()
            .filter(inventory_stock::Column::ProductId.eq(product_id))
            .one(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("No stock record for product {}", product_id))
            })?;

        let reserved = (record.reserved_stock - quantity).max(Decimal::ZERO);
        let available = (record.current_stock - reserved).max(Decimal::ZERO);

        let mut model: inventory_stock::ActiveModel = record.into();
        model.reserved_stock = Set(reserved);
        model.available_stock = Set(available);
        model.updated_at = Set(Utc::now());
        model
            .update(&txn)
            .await
            .map_err(ServiceError::DatabaseError)?;
        txn.commit().await.map_err(ServiceError::DatabaseError)?;

        if let Some(sender) = &self.event_sender {
            let _ = sender
                .send(Event::StockReleased {
                    product_id,
                    quantity,
                })
                .await;
        }

        self.require_stock(product_id).await
    }

    /// Fetches the stock record for a product, if one has been seeded.
    pub async fn get_stock(
        &self,
        product_id: Uuid,
    ) -> Result<Option<inventory_stock::Model>, ServiceError> {
        InventoryStockEntity::find()
            .filter(inventory_stock::Column::ProductId.eq(product_id))
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)
    }

    /// Lists stock records with pagination.
    pub async fn list_stock(
        &self,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<inventory_stock::Model>, u64), ServiceError> {
        let paginator = InventoryStockEntity::find()
            .order_by_asc(inventory_stock::Column::AvailableStock)
            .paginate(&*self.db_pool, per_page);

        let total = paginator
            .num_items()
            .await
            .map_err(ServiceError::DatabaseError)?;
        let records = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::DatabaseError)?;

        Ok((records, total))
    }

    /// Lists stock records whose availability sits at or below the threshold.
    pub async fn list_low_stock(
        &self,
        threshold: Decimal,
    ) -> Result<Vec<inventory_stock::Model>, ServiceError> {
        InventoryStockEntity::find()
            .filter(inventory_stock::Column::AvailableStock.lte(threshold))
            .order_by_asc(inventory_stock::Column::AvailableStock)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::DatabaseError)
    }

    /// Lists the movement audit trail for a product, newest first.
    pub async fn list_movements(
        &self,
        product_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<stock_movement::Model>, u64), ServiceError> {
        let paginator = StockMovementEntity::find()
            .filter(stock_movement::Column::ProductId.eq(product_id))
            .order_by_desc(stock_movement::Column::CreatedAt)
            .paginate(&*self.db_pool, per_page);

        let total = paginator
            .num_items()
            .await
            .map_err(ServiceError::DatabaseError)?;
        let movements = paginator
            .fetch_page(page.saturating_sub(1))
            .await
            .map_err(ServiceError::DatabaseError)?;

        Ok((movements, total))
    }

    async fn require_stock(
        &self,
        product_id: Uuid,
    ) -> Result<inventory_stock::Model, ServiceError> {
        self.get_stock(product_id).await?.ok_or_else(|| {
            ServiceError::InternalError(format!(
                "Stock record for product {} disappeared after write",
                product_id
            ))
        })
    }

    async fn load_or_seed<C: ConnectionTrait>(
        &self,
        txn: &C,
        product: &product::Model,
    ) -> Result<RecordState, ServiceError> {
        let existing = InventoryStockEntity::find()
            .filter(inventory_stock::Column::ProductId.eq(product.id))
            .one(txn)
            .await
            .map_err(ServiceError::DatabaseError)?;

        match existing {
            Some(record) => Ok(RecordState {
                id: record.id,
                current: record.current_stock,
                reserved: record.reserved_stock,
                average_cost: record.average_cost,
                is_new: false,
            }),
            None => Ok(RecordState {
                id: Uuid::new_v4(),
                // A negative cache never seeds negative stock.
                current: product.current_stock.max(Decimal::ZERO),
                reserved: Decimal::ZERO,
                average_cost: product.unit_cost,
                is_new: true,
            }),
        }
    }

    async fn persist_record<C: ConnectionTrait>(
        &self,
        txn: &C,
        product_id: Uuid,
        state: &RecordState,
        available_stock: Decimal,
    ) -> Result<(), ServiceError> {
        let now = Utc::now();
        let status = if state.current <= Decimal::ZERO {
            StockStatus::OutOfStock
        } else {
            StockStatus::Active
        };

        if state.is_new {
            let model = inventory_stock::ActiveModel {
                id: Set(state.id),
                product_id: Set(product_id),
                current_stock: Set(state.current),
                reserved_stock: Set(state.reserved),
                available_stock: Set(available_stock),
                average_cost: Set(state.average_cost),
                status: Set(status),
                created_at: Set(now),
                updated_at: Set(now),
            };
            model.insert(txn).await.map_err(ServiceError::DatabaseError)?;
        } else {
            let model = inventory_stock::ActiveModel {
                id: Set(state.id),
                product_id: Set(product_id),
                current_stock: Set(state.current),
                reserved_stock: Set(state.reserved),
                available_stock: Set(available_stock),
                average_cost: Set(state.average_cost),
                status: Set(status),
                updated_at: Set(now),
                ..Default::default()
            };
            model.update(txn).await.map_err(ServiceError::DatabaseError)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_movement<C: ConnectionTrait>(
        &self,
        txn: &C,
        product_id: Uuid,
        movement_type: MovementType,
        quantity: Decimal,
        previous_stock: Decimal,
        new_stock: Decimal,
        unit_cost: Option<Decimal>,
        reason: &str,
        reference_type: Option<String>,
        reference_id: Option<Uuid>,
        performed_by: &str,
    ) -> Result<Uuid, ServiceError> {
        let movement_id = Uuid::new_v4();
        let model = stock_movement::ActiveModel {
            id: Set(movement_id),
            product_id: Set(product_id),
            movement_type: Set(movement_type),
            quantity: Set(quantity),
            previous_stock: Set(previous_stock),
            new_stock: Set(new_stock),
            unit_cost: Set(unit_cost),
            reason: Set(reason.to_string()),
            reference_type: Set(reference_type),
            reference_id: Set(reference_id),
            performed_by: Set(performed_by.to_string()),
            created_at: Set(Utc::now()),
        };
        model.insert(txn).await.map_err(ServiceError::DatabaseError)?;
        Ok(movement_id)
    }
}

/// Recomputes the running average cost after a priced stock-in.
pub fn weighted_average_cost(
    old_quantity: Decimal,
    old_average: Decimal,
    in_quantity: Decimal,
    unit_cost: Decimal,
) -> Decimal {
    let denominator = old_quantity + in_quantity;
    if denominator <= Decimal::ZERO {
        return unit_cost;
    }
    ((old_quantity * old_average + in_quantity * unit_cost) / denominator).round_dp(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn average_cost_blends_existing_and_incoming() {
        // 10 @ 5.00 plus 10 @ 7.00 averages to 6.00
        let avg = weighted_average_cost(dec!(10), dec!(5), dec!(10), dec!(7));
        assert_eq!(avg, dec!(6));
    }

    #[test]
    fn average_cost_with_empty_stock_takes_the_incoming_cost() {
        let avg = weighted_average_cost(dec!(0), dec!(5), dec!(20), dec!(7.5));
        assert_eq!(avg, dec!(7.5));
    }

    #[test]
    fn average_cost_rounds_to_four_places() {
        let avg = weighted_average_cost(dec!(3), dec!(1), dec!(1), dec!(2));
        assert_eq!(avg, dec!(1.25));

        let avg = weighted_average_cost(dec!(3), dec!(1), dec!(4), dec!(2));
        // 11 / 7 = 1.5714285..., stored at four decimal places
        assert_eq!(avg, dec!(1.5714));
    }
}
