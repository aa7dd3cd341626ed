use std::fmt;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;
use vigil_core::VigilError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));

        (self.status, body).into_response()
    }
}

impl From<VigilError> for AppError {
    fn from(err: VigilError) -> Self {
        match err {
            VigilError::Configuration(msg) => Self::bad_request(msg),
            VigilError::NotFound(msg) => Self::not_found(msg),
            VigilError::InvalidTransition(msg) | VigilError::Conflict(msg) => {
                Self::conflict(msg)
            }
            other if other.is_transient() => {
                error!(error = %other, "transient backend failure");
                Self::unavailable(other.to_string())
            }
            other => {
                error!(error = %other, "request failed");
                Self::internal(other.to_string())
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_http_statuses() {
        let cases = [
            (VigilError::Configuration("bad cron".into()), StatusCode::BAD_REQUEST),
            (VigilError::NotFound("policy".into()), StatusCode::NOT_FOUND),
            (VigilError::InvalidTransition("late".into()), StatusCode::CONFLICT),
            (VigilError::Conflict("raced".into()), StatusCode::CONFLICT),
            (VigilError::Queue("down".into()), StatusCode::SERVICE_UNAVAILABLE),
            (VigilError::Storage("gone".into()), StatusCode::SERVICE_UNAVAILABLE),
            (VigilError::Internal("bug".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }
}
