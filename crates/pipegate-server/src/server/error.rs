//! Error to HTTP response mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use pipegate_core::{Error, ErrorKind};

/// Wraps [`pipegate_core::Error`] so handlers can return it with `?`.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl<E> From<E> for ApiError
where
    E: Into<Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status =
            StatusCode::from_u16(kind.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // Internal details stay in the log.
        let message = if kind == ErrorKind::InternalFailure {
            error!(error = %self.0, "Request failed");
            "Internal server error".to_string()
        } else {
            self.0.to_string()
        };

        let body = json!({
            "error": {
                "kind": kind.as_str(),
                "message": message,
            }
        });
        (status, Json(body)).into_response()
    }
}
