//! Typed errors for the historical query surface

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors a historical query can surface to the client
#[derive(Debug, Error)]
pub enum QueryError {
    /// `from` or `to` was not numeric
    #[error("missing interval")]
    MissingInterval,

    /// A point-format query spans more bars than the configured limit
    #[error("too many bars requested ({0})")]
    TooManyBars(u64),

    /// The storage produced nothing for the range
    #[error("no data")]
    NotFound,

    /// The API is disabled or no storage is configured
    #[error("historical api is unavailable")]
    Disabled,

    /// The storage failed to serve the query
    #[error("storage error: {0}")]
    Storage(String),
}

impl QueryError {
    fn status(&self) -> StatusCode {
        match self {
            Self::MissingInterval | Self::TooManyBars(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Disabled => StatusCode::NOT_IMPLEMENTED,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
