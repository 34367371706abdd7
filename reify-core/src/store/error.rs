//! Store error types.

use thiserror::Error;

/// Failure raised inside a computed definition.
///
/// The computed cache stores the error and re-delivers it on every read
/// until a dependency change triggers a fresh evaluation, so the type is
/// cheap to clone and comparable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DerivationError {
    message: String,
}

impl DerivationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Store errors encountered while a definition runs become derivation
/// failures; an inner derivation error passes through unchanged, so the same
/// error surfaces across chained computed reads.
impl From<StoreError> for DerivationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Derivation(inner) => inner,
            other => DerivationError::new(other.to_string()),
        }
    }
}

/// Errors produced by store construction and node operations.
///
/// Every error is synchronous and localized to the triggering operation;
/// the store is unchanged when an operation fails.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// Construction was handed a tree the store cannot wrap.
    #[error("invalid initial tree: {0}")]
    Validation(String),

    /// A mutation the active policy (or the slot's shape) does not allow.
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// A computed definition failed; re-reads deliver the same error until a
    /// dependency changes.
    #[error("derivation failed: {0}")]
    Derivation(#[from] DerivationError),

    /// Dispatch to an action name that was never attached.
    #[error("unknown action: {0}")]
    UnknownAction(String),
}
