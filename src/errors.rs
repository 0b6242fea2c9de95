//! Error taxonomy for the engine.
//!
//! Validation and authorization failures are returned to the caller
//! synchronously. External-dependency failures (judge, chain) and
//! set-once violations are absorbed by the components that see them and
//! never reach this type.

use thiserror::Error;

use crate::condensation::CondensationError;
use crate::store::StoreError;
use crate::types::Dimension;

/// Batch or field shape violations. Never persisted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// The request body could not be interpreted at all.
    #[error("invalid request shape: {0}")]
    InvalidShape(String),

    #[error("batch must contain between {min} and {max} fragments, got {got}")]
    BatchSize { got: usize, min: usize, max: usize },

    #[error("unknown dimension '{0}'")]
    UnknownDimension(String),

    #[error("dimension '{0}' appears more than once in the batch")]
    DuplicateDimension(Dimension),

    #[error("content for '{dimension}' must be between {min} and {max} characters, got {length}")]
    ContentLength {
        dimension: Dimension,
        length: usize,
        min: usize,
        max: usize,
    },

    /// A single scalar field (handle, name, address, hash) is malformed.
    #[error("invalid {field}: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::InvalidShape(_) => "invalid_shape",
            ValidationError::BatchSize { .. } => "batch_size",
            ValidationError::UnknownDimension(_) => "unknown_dimension",
            ValidationError::DuplicateDimension(_) => "duplicate_dimension",
            ValidationError::ContentLength { .. } => "content_length",
            ValidationError::InvalidField { .. } => "invalid_field",
        }
    }

    pub(crate) fn field(field: &'static str, message: impl Into<String>) -> Self {
        ValidationError::InvalidField {
            field,
            message: message.into(),
        }
    }
}

/// Rate limit and ceiling violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    #[error("batch cooldown not elapsed, retry in {retry_after_secs}s")]
    Cooldown { retry_after_secs: i64 },

    #[error("wallet has already minted the maximum of {limit} souls")]
    MintCeiling { limit: u32 },
}

/// Top-level error returned by [`crate::service::Ensoul`] operations.
#[derive(Debug, Error)]
pub enum EnsoulError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("contributor has not been claimed by a wallet yet")]
    NotClaimed,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Quota(#[from] QuotaError),

    /// Endpoint or operation permanently withdrawn.
    #[error("{0}")]
    Retired(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EnsoulError {
    /// Stable snake_case identifier for response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            EnsoulError::Validation(e) => e.code(),
            EnsoulError::Unauthenticated(_) => "unauthenticated",
            EnsoulError::NotClaimed => "not_claimed",
            EnsoulError::Forbidden(_) => "forbidden",
            EnsoulError::NotFound(_) => "not_found",
            EnsoulError::Conflict(_) => "conflict",
            EnsoulError::Quota(QuotaError::Cooldown { .. }) => "cooldown",
            EnsoulError::Quota(QuotaError::MintCeiling { .. }) => "mint_ceiling",
            EnsoulError::Retired(_) => "retired",
            EnsoulError::Internal(_) => "internal",
        }
    }
}

impl From<StoreError> for EnsoulError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => EnsoulError::Conflict(msg),
            StoreError::NotFound(msg) => EnsoulError::NotFound(msg),
            StoreError::Quota(q) => EnsoulError::Quota(q),
            StoreError::VersionConflict { .. } => EnsoulError::Conflict(err.to_string()),
            other => EnsoulError::Internal(other.to_string()),
        }
    }
}

impl From<CondensationError> for EnsoulError {
    fn from(err: CondensationError) -> Self {
        match err {
            CondensationError::SoulNotFound(id) => EnsoulError::NotFound(format!("soul {}", id)),
            CondensationError::Contended { .. } => EnsoulError::Conflict(err.to_string()),
            CondensationError::Store(e) => e.into(),
            CondensationError::Template(e) => EnsoulError::Internal(e.to_string()),
        }
    }
}

/// Result alias used across the service layer.
pub type Result<T, E = EnsoulError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_distinct_per_kind() {
        let errors = vec![
            EnsoulError::Validation(ValidationError::InvalidShape("x".into())),
            EnsoulError::Validation(ValidationError::BatchSize { got: 7, min: 3, max: 6 }),
            EnsoulError::Validation(ValidationError::UnknownDimension("x".into())),
            EnsoulError::Validation(ValidationError::DuplicateDimension(Dimension::Style)),
            EnsoulError::Unauthenticated("x".into()),
            EnsoulError::NotClaimed,
            EnsoulError::Conflict("x".into()),
            EnsoulError::Quota(QuotaError::Cooldown { retry_after_secs: 1 }),
        ];
        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_store_conflict_maps_to_conflict() {
        let err: EnsoulError = StoreError::Conflict("handle taken".into()).into();
        assert!(matches!(err, EnsoulError::Conflict(_)));

        let err: EnsoulError = StoreError::Quota(QuotaError::MintCeiling { limit: 3 }).into();
        assert_eq!(err.code(), "mint_ceiling");
    }
}
