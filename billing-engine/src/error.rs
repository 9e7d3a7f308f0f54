//! Error taxonomy for the billing core.

use service_core::error::AppError;
use thiserror::Error;

/// SQLSTATE raised when a serializable transaction loses a conflict.
const SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE for unique constraint violations.
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Serialization failure: concurrent transaction invalidated this one")]
    SerializationFailure,

    #[error("Transaction retry limit reached after {attempts} attempts")]
    RetryLimitExceeded { attempts: u32 },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(anyhow::Error),
}

impl BillingError {
    pub fn validation(msg: impl Into<String>) -> Self {
        BillingError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        BillingError::NotFound(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        BillingError::Configuration(msg.into())
    }

    /// Only storage-level write conflicts are worth replaying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::SerializationFailure)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, BillingError::Conflict(_))
    }

    /// Label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BillingError::Validation(_) => "validation",
            BillingError::NotFound(_) => "not_found",
            BillingError::Conflict(_) => "conflict",
            BillingError::SerializationFailure => "serialization_failure",
            BillingError::RetryLimitExceeded { .. } => "retry_limit",
            BillingError::Configuration(_) => "configuration",
            BillingError::Cancelled => "cancelled",
            BillingError::Database(_) => "database",
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        let (code, constraint) = match &err {
            sqlx::Error::RowNotFound => {
                return BillingError::NotFound("record not found".to_string());
            }
            sqlx::Error::Database(db_err) => (
                db_err.code().map(|c| c.into_owned()),
                db_err.constraint().map(str::to_string),
            ),
            _ => (None, None),
        };

        match code.as_deref() {
            Some(SERIALIZATION_FAILURE) => BillingError::SerializationFailure,
            Some(UNIQUE_VIOLATION) => BillingError::Conflict(
                constraint
                    .map(|c| format!("unique constraint {} violated", c))
                    .unwrap_or_else(|| "unique constraint violated".to_string()),
            ),
            _ => BillingError::Database(anyhow::Error::new(err)),
        }
    }
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Validation(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            BillingError::NotFound(msg) => AppError::NotFound(anyhow::anyhow!(msg)),
            BillingError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            BillingError::Database(err) => AppError::DatabaseError(err),
            BillingError::Configuration(msg) => AppError::ConfigError(anyhow::anyhow!(msg)),
            BillingError::Cancelled => AppError::ServiceUnavailable,
            other @ (BillingError::SerializationFailure
            | BillingError::RetryLimitExceeded { .. }) => {
                AppError::InternalError(anyhow::Error::new(other))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_serialization_failures_are_retryable() {
        assert!(BillingError::SerializationFailure.is_retryable());
        assert!(!BillingError::validation("amount must be positive").is_retryable());
        assert!(!BillingError::RetryLimitExceeded { attempts: 3 }.is_retryable());
        assert!(!BillingError::Conflict("dup".into()).is_retryable());
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err: BillingError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn validation_becomes_bad_request() {
        let app: AppError = BillingError::validation("invalid payment method").into();
        assert!(matches!(app, AppError::BadRequest(_)));
    }

    #[test]
    fn retry_limit_is_surfaced_as_internal() {
        let app: AppError = BillingError::RetryLimitExceeded { attempts: 3 }.into();
        assert!(matches!(app, AppError::InternalError(_)));
    }
}
