//! Coordinator error taxonomy.

use scrivener_db::DbError;
use scrivener_protocol::PayloadError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Run, provider or model configuration is absent.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed job. Retrying cannot fix it.
    #[error("Invalid job payload: {0}")]
    InvalidPayload(#[from] PayloadError),

    /// Model or provider administratively deactivated.
    #[error("Model '{0}' is disabled")]
    ProviderDisabled(String),

    /// Provider error, failed sanity check, or prompt over the context window.
    #[error("Generation failed: {0}")]
    Generation(String),

    /// Store or sink unavailable mid-update.
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// Tenant cannot pay for the run at submission.
    #[error("{0}")]
    InsufficientCredits(String),
}

impl CoordinatorError {
    pub fn generation(msg: impl Into<String>) -> Self {
        Self::Generation(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Errors that fail the job at once instead of spending retries.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::InvalidPayload(_))
    }
}

impl From<DbError> for CoordinatorError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => Self::NotFound(what),
            err @ DbError::InsufficientCredits { .. } => Self::InsufficientCredits(err.to_string()),
            other => Self::Persistence(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_errors_map_into_taxonomy() {
        let err: CoordinatorError = DbError::not_found("Run r-1").into();
        assert!(matches!(err, CoordinatorError::NotFound(_)));

        let err: CoordinatorError = DbError::invalid_state("bad status").into();
        assert!(matches!(err, CoordinatorError::Persistence(_)));
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_payload_errors_are_permanent() {
        let err: CoordinatorError = PayloadError::MissingTenant.into();
        assert!(err.is_permanent());
        assert_eq!(
            err.to_string(),
            "Invalid job payload: job payload is missing a tenant id"
        );
    }
}
