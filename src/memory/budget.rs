//! Per-class raw-exemplar budget.

use crate::error::{RehearsalError, Result};

/// Divides a fixed total raw-exemplar budget evenly across known classes.
#[derive(Debug, Clone, Copy)]
pub struct MemoryBudgetPolicy {
    pub total_budget: usize,
}

impl MemoryBudgetPolicy {
    pub fn new(total_budget: usize) -> Self {
        Self { total_budget }
    }

    /// Raw exemplars each class may keep once `known_classes` are known.
    ///
    /// Floor division; a quota of zero means the budget can no longer
    /// represent every class and is reported as an error rather than
    /// silently dropping classes.
    pub fn quota_for(&self, known_classes: usize) -> Result<usize> {
        if known_classes == 0 {
            return Err(RehearsalError::BudgetUnderflow {
                total_budget: self.total_budget,
                known_classes,
            });
        }
        let quota = self.total_budget / known_classes;
        if quota == 0 {
            return Err(RehearsalError::BudgetUnderflow {
                total_budget: self.total_budget,
                known_classes,
            });
        }
        Ok(quota)
    }
}
