use mesh_core::CoreError;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RpcError>;

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Broker is blocked")]
    Blocked,

    #[error("Transport error: {0}")]
    Transport(#[from] BrokerError),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<bincode::Error> for RpcError {
    fn from(err: bincode::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}

/// Errors reported by broker adapters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Broker operation timed out")]
    Timeout,

    #[error("No responders on {0}")]
    NoResponders(String),

    #[error("Broker connection closed: {0}")]
    Closed(String),

    #[error("Broker channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("Broker I/O error: {0}")]
    Io(String),
}
