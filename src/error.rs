//! Error types for the data layer

use thiserror::Error;

/// Errors that can occur while building or executing statements
#[derive(Debug, Error)]
pub enum DbError {
    /// The caller broke the `prepare` contract (bad template, argument
    /// count mismatch, identifier/value conflict). No statement is built.
    #[error("Prepare error: {0}")]
    Prepare(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    /// One or more values could not be represented in their column charset.
    #[error("Invalid data for field(s): {}", fields.join(", "))]
    InvalidFieldData { fields: Vec<String> },

    #[error("Query error: {0}")]
    Query(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl DbError {
    pub fn prepare(msg: impl Into<String>) -> Self {
        Self::Prepare(msg.into())
    }

    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::Metadata(msg.into())
    }

    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether the error means the server went away, so a reconnect may help
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Sql(err) => matches!(
                err,
                sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
