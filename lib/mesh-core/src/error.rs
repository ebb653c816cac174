use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Invalid registry key: {0}")]
    InvalidKey(String),

    #[error("Coordination store error: {0}")]
    Store(String),

    #[error("Coordination store timed out after {0:?}")]
    StoreTimeout(std::time::Duration),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}
