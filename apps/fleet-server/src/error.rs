use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::remote::RemoteError;

/// Domain failures raised by the orchestration services.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// The command ran but wrote to stderr.
    #[error("remote command failed: {}", .0.join("; "))]
    CommandFailed(Vec<String>),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl FleetError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

pub type FleetResult<T> = Result<T, FleetError>;

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

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

/// Error bodies use the same `{status, msg, data}` envelope as successful responses,
/// with `status` carrying the HTTP code.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "status": self.status.as_u16(),
            "msg": self.message,
            "data": serde_json::Value::Null,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<FleetError> for AppError {
    fn from(err: FleetError) -> Self {
        match err {
            FleetError::Validation(message) => Self::new(StatusCode::BAD_REQUEST, message),
            FleetError::Conflict(message) => Self::new(StatusCode::CONFLICT, message),
            FleetError::Unauthorized(message) => Self::new(StatusCode::UNAUTHORIZED, message),
            FleetError::NotFound(message) => Self::new(StatusCode::NOT_FOUND, message),
            FleetError::Remote(err) => {
                tracing::warn!(error = %err, "remote execution failed");
                Self::new(StatusCode::BAD_GATEWAY, err.to_string())
            }
            err @ FleetError::CommandFailed(_) => {
                tracing::warn!(error = %err, "remote command reported errors");
                Self::new(StatusCode::BAD_GATEWAY, err.to_string())
            }
            FleetError::Internal(err) => {
                if let Some(db) = err.downcast_ref::<sqlx::Error>() {
                    let (status, message) = map_db_error(db);
                    tracing::error!(error = %format!("{err:#}"), "request failed");
                    return Self::new(status, message);
                }
                tracing::error!(error = %format!("{err:#}"), "internal error");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

pub fn map_db_error(err: &sqlx::Error) -> (StatusCode, String) {
    let status = match err {
        sqlx::Error::RowNotFound => StatusCode::NOT_FOUND,
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") => StatusCode::CONFLICT,    // unique_violation
            Some("23503") => StatusCode::BAD_REQUEST, // foreign_key_violation
            Some("23502") => StatusCode::BAD_REQUEST, // not_null_violation
            Some("22P02") => StatusCode::BAD_REQUEST, // invalid_text_representation
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let message = match status {
        StatusCode::NOT_FOUND => "Resource not found",
        StatusCode::CONFLICT => "Resource already exists",
        StatusCode::BAD_REQUEST => "Invalid request",
        _ => "Database error",
    };

    (status, message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn taxonomy_maps_to_status_codes() {
        let cases = [
            (FleetError::validation("bad ip"), StatusCode::BAD_REQUEST),
            (FleetError::conflict("already deploying"), StatusCode::CONFLICT),
            (
                FleetError::Unauthorized("unknown host".to_string()),
                StatusCode::UNAUTHORIZED,
            ),
            (FleetError::not_found("no server"), StatusCode::NOT_FOUND),
            (
                FleetError::Remote(RemoteError::Timeout(Duration::from_secs(3))),
                StatusCode::BAD_GATEWAY,
            ),
            (
                FleetError::CommandFailed(vec!["no such container".to_string()]),
                StatusCode::BAD_GATEWAY,
            ),
            (
                FleetError::Internal(anyhow::anyhow!("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn validation_messages_are_verbatim() {
        let err = AppError::from(FleetError::validation("public_ip is not a valid IP address"));
        assert_eq!(err.message, "public_ip is not a valid IP address");
    }

    #[test]
    fn internal_errors_hide_details() {
        let err = AppError::from(FleetError::Internal(anyhow::anyhow!("password=hunter2")));
        assert_eq!(err.message, "Internal server error");
    }

    #[test]
    fn row_not_found_maps_to_404() {
        let (status, _) = map_db_error(&sqlx::Error::RowNotFound);
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
