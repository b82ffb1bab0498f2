use thiserror::Error;

use crate::models::ValidationError;
use crate::queue::OperationStatus;
use crate::remote::RemoteError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Invalid payload: {0}")]
    Validation(#[from] ValidationError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache TTL must be greater than zero")]
    InvalidTtl,

    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    #[error("Operation {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: OperationStatus,
        to: OperationStatus,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
