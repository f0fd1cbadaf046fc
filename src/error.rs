//! Error types for rehearsal-memory management

use thiserror::Error;

/// Rehearsal-memory errors
#[derive(Debug, Error)]
pub enum RehearsalError {
    /// Fewer candidates than the requested selection quota
    #[error("insufficient data: requested {requested} exemplars, only {available} candidates")]
    InsufficientData { requested: usize, available: usize },

    /// Target feature (or statistics profile) with near-zero norm
    #[error("degenerate reconstruction target: norm {norm} below epsilon")]
    DegenerateTarget { norm: f32 },

    /// Statistics-hook lifecycle violation (unpaired register/remove)
    #[error("hook state error: {0}")]
    HookState(String),

    /// Per-class quota collapsed to zero under the total budget
    #[error("budget underflow: {total_budget} total slots across {known_classes} known classes")]
    BudgetUnderflow {
        total_budget: usize,
        known_classes: usize,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Shape mismatch between tensors or feature vectors
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for rehearsal-memory operations
pub type Result<T> = std::result::Result<T, RehearsalError>;
