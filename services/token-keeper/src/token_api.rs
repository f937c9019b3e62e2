//! Token routes
//!
//! Endpoints:
//! - GET    /token                - cached or freshly exchanged token
//! - GET    /token?validate=true  - same, after a probe against the live gateway
//! - DELETE /token                - drop the cached token so the next call refreshes
//!
//! Each request runs under a child of the shutdown token, so a SIGTERM aborts
//! validation waits instead of holding the drain open.

use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{info, warn};

use crate::AppState;
use crate::error::ApiError;
use crate::metrics;

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    #[serde(default)]
    pub validate: bool,
}

/// GET /token: returns `{appId, corpId, corpAccessToken, expiresIn}`.
pub async fn get_token(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Response {
    let started = Instant::now();
    let request_id = request_id();
    let cancel = state.shutdown.child_token();

    let result = if query.validate {
        state
            .manager
            .get_validated_token(&state.credential, &cancel)
            .await
    } else {
        state.manager.get_token(&state.credential, &cancel).await
    };

    let response = match result {
        Ok(token) => {
            info!(
                request_id = %request_id,
                app_id = %token.app_id,
                validate = query.validate,
                "token served"
            );
            (StatusCode::OK, Json(token)).into_response()
        }
        Err(e) => {
            warn!(
                request_id = %request_id,
                validate = query.validate,
                error = %e,
                "token request failed"
            );
            ApiError(e).into_response()
        }
    };
    finish(&state, "get_token", response, started)
}

/// DELETE /token: returns `{removed: n}`.
pub async fn delete_token(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    let request_id = request_id();
    let cancel = state.shutdown.child_token();

    let response = match state
        .manager
        .invalidate(&state.credential.app_id, &cancel)
        .await
    {
        Ok(removed) => {
            info!(request_id = %request_id, removed, "cached token dropped on request");
            (
                StatusCode::OK,
                Json(serde_json::json!({ "removed": removed })),
            )
                .into_response()
        }
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "token invalidation failed");
            ApiError(e).into_response()
        }
    };
    finish(&state, "delete_token", response, started)
}

fn request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

fn finish(state: &AppState, route: &'static str, response: Response, started: Instant) -> Response {
    let status = response.status();
    state.stats.requests_total.fetch_add(1, Ordering::Relaxed);
    if !status.is_success() {
        state.stats.errors_total.fetch_add(1, Ordering::Relaxed);
    }
    metrics::record_request(route, status.as_u16(), started.elapsed().as_secs_f64());
    response
}
