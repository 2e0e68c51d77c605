//! OpenAI-compatible error responses: a small typed enum, rendered into the
//! same `{"error": {message, type, code}}` envelope every OpenAI-compatible
//! surface uses, so clients don't need a proxy-specific error parser.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid request: {0}")]
    Classification(String),
    #[error("no slot available")]
    Capacity,
    #[error("backend error: {0}")]
    BackendTransport(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: &'static str,
    code: Option<&'static str>,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Classification(_) => StatusCode::BAD_REQUEST,
            AppError::Capacity => StatusCode::SERVICE_UNAVAILABLE,
            AppError::BackendTransport(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            AppError::Classification(_) => "invalid_request_error",
            AppError::Capacity => "capacity_error",
            AppError::BackendTransport(_) => "backend_error",
            AppError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorEnvelope {
            error: ErrorBody {
                message: self.to_string(),
                error_type: self.error_type(),
                code: None,
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Renders an error envelope directly, for call sites that already have a
/// status code and message from a backend response rather than an `AppError`
/// (e.g. a drained non-2xx streaming preflight body).
pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ErrorEnvelope {
        error: ErrorBody {
            message: message.into(),
            error_type: "backend_error",
            code: None,
        },
    };
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_error_maps_to_503() {
        let err = AppError::Capacity;
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn backend_transport_maps_to_502() {
        let err = AppError::BackendTransport("timeout".into());
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }
}
