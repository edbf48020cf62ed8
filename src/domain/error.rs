//! Domain-level errors (no external dependencies)

use thiserror::Error;
use uuid::Uuid;

/// Coarse classification used by callers that map errors onto transport codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    Conflict,
}

/// Domain errors represent business rule violations.
/// These are independent of infrastructure concerns.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid node type: {0}")]
    InvalidNodeType(String),

    #[error("invalid data type: {0}")]
    InvalidDataType(String),

    #[error("invalid node name {0:?}: sanitized name must not be empty")]
    EmptyName(String),

    #[error("invalid impact: {0}")]
    InvalidImpact(String),

    #[error("unsafe formula: forbidden token {token:?}")]
    UnsafeFormula { token: String },

    #[error("malformed formula at position {position}: {message}")]
    MalformedFormula { position: usize, message: String },

    #[error("missing variable in formula: {0}")]
    MissingVariable(String),

    #[error("variable {name} is not numeric: {value}")]
    NonNumericVariable { name: String, value: String },

    #[error("division by zero in formula")]
    DivisionByZero,

    #[error("formula produced a non-finite result: {0}")]
    NonFiniteResult(String),

    #[error("malformed rule: {0}")]
    MalformedRule(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("reparenting {node} under {new_parent} would create a cycle")]
    CycleDetected { node: Uuid, new_parent: Uuid },

    #[error("parent {parent} of node {node} belongs to another manufacturing type")]
    ForeignParent { node: String, parent: Uuid },

    #[error("node {node} references parent {parent} which is not in the node set")]
    BrokenParentLink { node: String, parent: String },

    #[error("sibling name already exists at this level: {name}")]
    DuplicateSibling { name: String },

    #[error("node {id} has {count} children; delete with cascade to remove the subtree")]
    HasChildren { id: Uuid, count: usize },

    #[error("node {id} is referenced by configuration {configuration}")]
    NodeInUse { id: Uuid, configuration: Uuid },

    #[error("configuration {id} was modified concurrently (expected version {expected}, found {actual}); retry")]
    ConcurrentModification {
        id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("configuration {0} is snapshotted and can no longer change")]
    Snapshotted(Uuid),
}

impl DomainError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::NotFound { .. } => ErrorKind::NotFound,
            DomainError::DuplicateSibling { .. }
            | DomainError::HasChildren { .. }
            | DomainError::NodeInUse { .. }
            | DomainError::ConcurrentModification { .. }
            | DomainError::Snapshotted(_) => ErrorKind::Conflict,
            // cycles are a validation subtype
            _ => ErrorKind::Validation,
        }
    }

    /// True for conflicts that a caller may resolve by reloading and retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DomainError::ConcurrentModification { .. })
    }
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
