use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("property already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid operation: {0}")]
    Invalid(String),
}
