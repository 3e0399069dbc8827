use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Serialization/deserialization error: {0}")]
    Serialization(String),

    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Database backend error: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("Database operation error: {0}")]
    Database(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
