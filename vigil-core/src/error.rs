use thiserror::Error;
use vigil_model::ModelError;

#[derive(Error, Debug)]
pub enum VigilError {
    /// Bad schedule expression, conflicting target selection and the like.
    /// Rejected synchronously at policy create/update.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Lost an optimistic concurrency race.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VigilError {
    /// Errors worth retrying locally with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VigilError::Dispatch(_)
                | VigilError::Queue(_)
                | VigilError::Storage(_)
                | VigilError::Conflict(_)
        )
    }

    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        VigilError::NotFound(format!("{kind} {id}"))
    }
}

impl From<ModelError> for VigilError {
    fn from(err: ModelError) -> Self {
        VigilError::Configuration(err.to_string())
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for VigilError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => {
                VigilError::NotFound("row not found".into())
            }
            other => VigilError::Storage(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, VigilError>;
