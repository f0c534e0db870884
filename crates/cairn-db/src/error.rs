//! Database-specific error types and conversions.

use cairn_core::error::CairnError;

/// Database-layer error type.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SurrealDB error: {0}")]
    Surreal(#[from] surrealdb::Error),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Record not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Concurrent modification of {entity} {id}")]
    Conflict { entity: String, id: String },
}

impl From<DbError> for CairnError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { entity, id } => CairnError::NotFound { entity, id },
            DbError::Conflict { entity, id } => CairnError::Conflict { entity, id },
            DbError::Migration(message) => CairnError::Internal(message),
            other => CairnError::upstream("database", other),
        }
    }
}
