use pageinfra_common::{ConfigError, UnknownMarketplace};
use pageinfra_store::StoreError;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, InfraError>;

#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    #[error(transparent)]
    UnknownMarketplace(#[from] UnknownMarketplace),

    /// Nothing could be read or written because the backend is unreachable.
    /// Retryable.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl InfraError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, InfraError::BackendUnavailable(_))
    }
}

impl From<StoreError> for InfraError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => InfraError::BackendUnavailable(msg),
            other => InfraError::Store(other),
        }
    }
}
