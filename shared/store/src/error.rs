use orchestra_core::OrchestraError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("stored JSON was invalid: {0}")]
    Json(#[from] serde_json::Error),

    #[error("stored value was invalid: {0}")]
    Corrupt(String),
}

impl From<StoreError> for OrchestraError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(_) | StoreError::Migrate(_) | StoreError::Cache(_) => {
                OrchestraError::Unavailable(err.to_string())
            }
            StoreError::Json(_) | StoreError::Corrupt(_) => {
                OrchestraError::Internal(err.to_string())
            }
        }
    }
}
