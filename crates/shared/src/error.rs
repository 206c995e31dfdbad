//! Error types for Dealflow

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DealflowError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DealflowResult<T> = Result<T, DealflowError>;
