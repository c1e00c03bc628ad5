use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

// The events emitted after a state change commits. Listeners must never
// mutate balances or stock; those are settled before the event is sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Sales order events
    SalesOrderCreated(Uuid),
    SalesOrderUpdated(Uuid),
    SalesOrderConfirmed(Uuid),
    SalesOrderCancelled(Uuid),
    SalesOrderDeleted(Uuid),

    // Purchase invoice events
    PurchaseInvoiceCreated(Uuid),
    PurchaseInvoiceUpdated(Uuid),
    PurchaseInvoiceConfirmed(Uuid),
    PurchaseInvoiceCancelled(Uuid),
    PurchaseInvoiceDeleted(Uuid),

    // Return events
    SaleReturnCreated(Uuid),
    SaleReturnDeleted(Uuid),
    PurchaseReturnCreated(Uuid),
    PurchaseReturnDeleted(Uuid),

    // Payment events
    PaymentRecorded {
        document_type: String,
        document_id: Uuid,
        party_id: Uuid,
        amount: Decimal,
    },
    ExpensePaymentRecorded {
        expense_id: Uuid,
        payment_id: Uuid,
        amount: Decimal,
    },

    // Stock events
    StockUpdated {
        product_id: Uuid,
        movement_type: String,
        quantity: Decimal,
        previous_stock: Decimal,
        new_stock: Decimal,
    },
    StockReserved {
        product_id: Uuid,
        quantity: Decimal,
    },
    StockReleased {
        product_id: Uuid,
        quantity: Decimal,
    },

    // Balance events
    BalanceRecalculated {
        party_type: String,
        party_id: Uuid,
    },
    BalanceDriftDetected {
        party_type: String,
        party_id: Uuid,
        field: String,
        stored: Decimal,
        computed: Decimal,
    },

    // Compensation events
    CompensationApplied {
        source: String,
        reference_id: Option<Uuid>,
        steps_unwound: usize,
    },
    CompensationFailed {
        source: String,
        reference_id: Option<Uuid>,
        failures: Vec<String>,
    },
}

// Drains the event channel and dispatches to the per-type handlers.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match event {
            Event::StockUpdated {
                product_id,
                ref movement_type,
                quantity,
                previous_stock,
                new_stock,
            } => {
                if let Err(e) = handle_stock_updated(
                    product_id,
                    movement_type,
                    quantity,
                    previous_stock,
                    new_stock,
                )
                .await
                {
                    error!(
                        "Failed to handle stock update event: product_id={}, error={}",
                        product_id, e
                    );
                }
            }
            Event::BalanceDriftDetected {
                ref party_type,
                party_id,
                ref field,
                stored,
                computed,
            } => {
                warn!(
                    "Balance drift detected: {} {} field {} stored={} computed={}",
                    party_type, party_id, field, stored, computed
                );
            }
            Event::CompensationApplied {
                ref source,
                reference_id,
                steps_unwound,
            } => {
                warn!(
                    "Compensation unwound {} stock step(s) for {} {:?}",
                    steps_unwound, source, reference_id
                );
            }
            Event::CompensationFailed {
                ref source,
                reference_id,
                ref failures,
            } => {
                error!(
                    "COMPENSATION FAILED for {} {:?}: {} step(s) could not be unwound",
                    source,
                    reference_id,
                    failures.len()
                );
                for failure in failures {
                    error!("  unrecovered step: {}", failure);
                }
            }
            Event::PaymentRecorded {
                ref document_type,
                document_id,
                party_id,
                amount,
            } => {
                info!(
                    "Payment of {} recorded on {} {} for party {}",
                    amount, document_type, document_id, party_id
                );
            }
            ref other => {
                info!("Received event: {:?}", other);
            }
        }
    }

    warn!("Event processing loop has ended");
}

async fn handle_stock_updated(
    product_id: Uuid,
    movement_type: &str,
    quantity: Decimal,
    previous_stock: Decimal,
    new_stock: Decimal,
) -> Result<(), String> {
    info!(
        "Stock updated: product={}, type={}, delta={}, {} -> {}",
        product_id, movement_type, quantity, previous_stock, new_stock
    );

    if new_stock <= Decimal::ZERO {
        warn!(
            "Out of stock: product {} has {} units remaining",
            product_id, new_stock
        );
        // Reorder workflows hang off this signal
    }

    Ok(())
}
