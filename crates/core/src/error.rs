//! Domain error model.

use thiserror::Error;

use crate::status::WorkChunkStatus;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// These are structural failures: malformed input, references to steps that do
/// not exist, cyclic chunk hierarchies and illegal status edges. Expected races
/// (dequeue of an already claimed chunk, enqueue of a chunk that is not ready)
/// are not errors and never surface through this type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A chunk referenced a step that its job definition does not declare.
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// A producer emitted a self-referential chunk hierarchy.
    #[error("cyclic chunk hierarchy detected at {0}")]
    CyclicHierarchy(String),

    /// A status change outside the legal edge set was requested.
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: WorkChunkStatus,
        to: WorkChunkStatus,
    },

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unknown_step(step: impl Into<String>) -> Self {
        Self::UnknownStep(step.into())
    }

    pub fn cyclic(at: impl Into<String>) -> Self {
        Self::CyclicHierarchy(at.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }
}
