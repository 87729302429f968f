use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::router::RouteError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Internal(String),
}

impl From<RouteError> for AppError {
    fn from(error: RouteError) -> Self {
        match error {
            RouteError::Cancelled => Self::Internal("request cancelled".to_owned()),
            RouteError::Exhausted(failures) => Self::Upstream(format!(
                "all {} backends failed to serve the request",
                failures.len()
            )),
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiErrorEnvelope {
    error: OpenAiError,
}

#[derive(Debug, Serialize)]
struct OpenAiError {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

impl AppError {
    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            AppError::Upstream(_) | AppError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error")
            }
        }
    }

    /// Error body as a JSON string, for frames inside an event stream.
    pub fn to_json(&self) -> String {
        let (_, error_type) = self.status_and_type();
        serde_json::to_string(&envelope(error_type, self.to_string())).unwrap_or_default()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();
        (status, Json(envelope(error_type, self.to_string()))).into_response()
    }
}

fn envelope(error_type: &str, message: String) -> OpenAiErrorEnvelope {
    OpenAiErrorEnvelope {
        error: OpenAiError {
            message,
            error_type: error_type.to_owned(),
        },
    }
}
