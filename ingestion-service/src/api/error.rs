//! Error type for the query API, rendered as a JSON `{error, status}` body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use telemetry_engine::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// A query parameter was missing or malformed.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            Self::Engine(
                EngineError::UnsupportedWindow(_) | EngineError::InvalidReading(_) | EngineError::UnknownMeter(_),
            ) => StatusCode::BAD_REQUEST,
            Self::Engine(EngineError::Cancelled) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Engine(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "query api request failed");
        }

        let body = serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}
