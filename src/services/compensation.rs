use crate::{
    errors::ServiceError,
    events::Event,
    services::stock::{InventoryStockService, StockUpdateInput},
};
use lazy_static::lazy_static;
use prometheus::IntCounter;
use tracing::{error, warn};

lazy_static! {
    static ref COMPENSATIONS_RUN: IntCounter = IntCounter::new(
        "stock_compensations_run_total",
        "Total number of compensation unwinds executed"
    )
    .expect("metric can be created");
    static ref COMPENSATION_STEP_FAILURES: IntCounter = IntCounter::new(
        "stock_compensation_step_failures_total",
        "Total number of compensating stock movements that failed"
    )
    .expect("metric can be created");
}

/// One inverse stock movement, queued while the forward movement commits.
pub struct CompensationStep {
    pub description: String,
    pub inverse: StockUpdateInput,
}

/// Records committed stock mutations so a failing document flow can put the
/// shelves back. Steps unwind in reverse order; a step that fails is reported,
/// never retried.
#[derive(Default)]
pub struct CompensationStack {
    steps: Vec<CompensationStep>,
}

impl CompensationStack {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Queues the inverse of a movement that just committed.
    pub fn push(&mut self, description: impl Into<String>, inverse: StockUpdateInput) {
        self.steps.push(CompensationStep {
            description: description.into(),
            inverse,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Applies every queued inverse movement in reverse order and returns the
    /// descriptions of the ones that could not be applied.
    pub async fn unwind(mut self, stock: &InventoryStockService) -> Vec<String> {
        if self.steps.is_empty() {
            return Vec::new();
        }

        COMPENSATIONS_RUN.inc();
        // Every step on one stack belongs to the same document, so the first
        // step's reference names the unwind.
        let source = self.steps[0]
            .inverse
            .reference_type
            .clone()
            .unwrap_or_else(|| "stock".to_string());
        let reference_id = self.steps[0].inverse.reference_id;
        let steps_unwound = self.steps.len();
        let mut failures = Vec::new();

        while let Some(step) = self.steps.pop() {
            match stock.update_stock(step.inverse).await {
                Ok(result) => {
                    warn!(
                        step = %step.description,
                        product_id = %result.product_id,
                        new_stock = %result.new_stock,
                        "Compensating stock movement applied"
                    );
                }
                Err(e) => {
                    COMPENSATION_STEP_FAILURES.inc();
                    error!(
                        step = %step.description,
                        error = %e,
                        "Compensating stock movement FAILED; stock left inconsistent"
                    );
                    failures.push(format!("{}: {}", step.description, e));
                }
            }
        }

        if let Some(sender) = stock.events() {
            let event = if failures.is_empty() {
                Event::CompensationApplied {
                    source,
                    reference_id,
                    steps_unwound,
                }
            } else {
                Event::CompensationFailed {
                    source,
                    reference_id,
                    failures: failures.clone(),
                }
            };
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "Failed to send compensation event");
            }
        }

        failures
    }
}

/// Folds an unwind outcome into the error surfaced to the caller: the original
/// failure when every step compensated, otherwise the partial-compensation
/// error carrying both.
pub fn resolve_unwind(original: ServiceError, failures: Vec<String>) -> ServiceError {
    if failures.is_empty() {
        original
    } else {
        ServiceError::PartialCompensationFailure {
            source_error: original.to_string(),
            failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::stock_movement::MovementType;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn sample_input() -> StockUpdateInput {
        StockUpdateInput {
            product_id: Uuid::new_v4(),
            movement_type: MovementType::In,
            quantity: dec!(1),
            unit_cost: None,
            reason: "test".to_string(),
            reference_type: None,
            reference_id: None,
            performed_by: "tests".to_string(),
        }
    }

    #[test]
    fn stack_tracks_pushed_steps() {
        let mut stack = CompensationStack::new();
        assert!(stack.is_empty());

        stack.push("restore line 1", sample_input());
        stack.push("restore line 2", sample_input());
        assert_eq!(stack.len(), 2);
    }

    #[test]
    fn clean_unwind_surfaces_the_original_error() {
        let original = ServiceError::ValidationError("bad request".to_string());
        let resolved = resolve_unwind(original, Vec::new());
        assert!(matches!(resolved, ServiceError::ValidationError(_)));
    }

    #[test]
    fn failed_unwind_escalates_to_partial_compensation() {
        let original = ServiceError::ValidationError("bad request".to_string());
        let resolved = resolve_unwind(original, vec!["line 1: timeout".to_string()]);
        match resolved {
            ServiceError::PartialCompensationFailure {
                source_error,
                failures,
            } => {
                assert!(source_error.contains("bad request"));
                assert_eq!(failures.len(), 1);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
