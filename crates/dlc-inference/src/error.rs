//! Handler errors and their HTTP rendering

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

/// An error surfaced to the invoking client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{status} {reason}: {message}")]
pub struct InferenceError {
    pub status: StatusCode,
    pub reason: String,
    pub message: String,
}

impl InferenceError {
    pub fn new(status: StatusCode, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// 400 "Invalid Request"
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "Invalid Request", message)
    }

    /// 500 "Internal Server Error"
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error", message)
    }

    /// 502 for failures of the model server behind the handler
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "Model Server Error", message)
    }
}

impl IntoResponse for InferenceError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "code": self.status.as_u16(),
            "type": self.reason,
            "message": self.message,
        }));
        (self.status, body).into_response()
    }
}

/// Result type for handler operations
pub type InferenceResult<T> = Result<T, InferenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = InferenceError::invalid_request("text_prompts missing");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(
            err.to_string(),
            "400 Bad Request Invalid Request: text_prompts missing"
        );
    }

    #[test]
    fn test_into_response_status() {
        let response = InferenceError::upstream("connection refused").into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
