//! HTTP mapping for token manager errors

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fxiaoke_token::Error as TokenError;
use thiserror::Error;

/// Error returned by the token routes.
///
/// Upstream rejections surface as 502 with the gateway code; exhausted
/// budgets and cancellation as 503 so callers know a retry may succeed.
#[derive(Error, Debug)]
#[error(transparent)]
pub struct ApiError(#[from] pub TokenError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            TokenError::UpstreamAuth { .. } | TokenError::Transport(_) => StatusCode::BAD_GATEWAY,
            TokenError::AuthExhausted { .. }
            | TokenError::RetryExhausted { .. }
            | TokenError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            TokenError::Store(_) | TokenError::InvalidDestination(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Gateway error code, when the failure carries one.
    pub fn upstream_code(&self) -> Option<i64> {
        match &self.0 {
            TokenError::UpstreamAuth { code, .. }
            | TokenError::AuthExhausted { code, .. }
            | TokenError::RetryExhausted { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({ "error": self.0.to_string() });
        if let Some(code) = self.upstream_code() {
            body["code"] = code.into();
        }
        (self.status(), Json(body)).into_response()
    }
}
