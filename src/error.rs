//error.rs
//! Error types for the scorenet incremental evaluation engine

use thiserror::Error;

/// Result type alias for scorenet operations
pub type Result<T> = std::result::Result<T, ScorenetError>;

/// Main error type for scorenet operations
#[derive(Debug, Error)]
pub enum ScorenetError {
    #[error("Fact with handle {0} not found")]
    FactNotFound(u64),

    #[error("No from node registered for type {type_name}")]
    UnregisteredType { type_name: String },

    #[error("Resource limit exceeded: {limit_type} - {details}")]
    ResourceLimit {
        limit_type: String,
        details: String,
    },

    #[error("Operation cascade exceeded maximum iterations ({max_iterations}). Possible infinite loop detected")]
    InfiniteLoop { max_iterations: usize },

    #[error("Invalid tuple index: {reason}")]
    InvalidIndex { reason: String },

    #[error("Network configuration error: {details}")]
    Configuration { details: String },

    #[error("State corruption detected: {details}")]
    StateCorruption { details: String },

    #[error("User function '{operation}' failed on facts {facts}: {message}")]
    UserCode {
        operation: String,
        facts: String,
        message: String,
    },

    #[error("Invalid tuple arity: expected {expected}, got {actual}")]
    InvalidArity { expected: usize, actual: usize },

    #[error("Type mismatch: {details}")]
    TypeMismatch { details: String },

    #[error("Consistency check failed: {details}")]
    ConsistencyViolation { details: String },

    #[error("Session is poisoned by an earlier failed mutation: {details}")]
    Poisoned { details: String },

    #[error("Constraint '{0}' not found")]
    ConstraintNotFound(String),

    #[error("Constraint match tracking is disabled for this session")]
    MatchTrackingDisabled,

    #[error("Integer overflow in {operation}: {details}")]
    Overflow { operation: String, details: String },
}

impl ScorenetError {
    pub fn fact_not_found(handle: u64) -> Self {
        Self::FactNotFound(handle)
    }

    pub fn unregistered_type(type_name: impl Into<String>) -> Self {
        Self::UnregisteredType {
            type_name: type_name.into(),
        }
    }

    pub fn resource_limit(limit_type: impl Into<String>, details: impl Into<String>) -> Self {
        Self::ResourceLimit {
            limit_type: limit_type.into(),
            details: details.into(),
        }
    }

    pub fn infinite_loop(max_iterations: usize) -> Self {
        Self::InfiniteLoop { max_iterations }
    }

    pub fn invalid_index(reason: impl Into<String>) -> Self {
        Self::InvalidIndex {
            reason: reason.into(),
        }
    }

    pub fn configuration(details: impl Into<String>) -> Self {
        Self::Configuration {
            details: details.into(),
        }
    }

    pub fn corruption(details: impl Into<String>) -> Self {
        Self::StateCorruption {
            details: details.into(),
        }
    }

    pub fn user_code(
        operation: impl Into<String>,
        facts: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::UserCode {
            operation: operation.into(),
            facts: facts.into(),
            message: message.into(),
        }
    }

    pub fn invalid_arity(expected: usize, actual: usize) -> Self {
        Self::InvalidArity { expected, actual }
    }

    pub fn type_mismatch(details: impl Into<String>) -> Self {
        Self::TypeMismatch {
            details: details.into(),
        }
    }

    pub fn consistency_violation(details: impl Into<String>) -> Self {
        Self::ConsistencyViolation {
            details: details.into(),
        }
    }

    pub fn poisoned(details: impl Into<String>) -> Self {
        Self::Poisoned {
            details: details.into(),
        }
    }

    pub fn overflow(operation: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Overflow {
            operation: operation.into(),
            details: details.into(),
        }
    }

    /// Build-time defects: bad network shape, missing functions, arity overflow.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. } | Self::InvalidArity { .. })
    }

    /// Protocol violations that would otherwise corrupt counts or indexes.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::StateCorruption { .. } | Self::InvalidIndex { .. } | Self::ConsistencyViolation { .. }
        )
    }

    pub fn is_user_code(&self) -> bool {
        matches!(self, Self::UserCode { .. })
    }
}
