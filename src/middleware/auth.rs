//! Admin API authentication
//!
//! Thin static-token check for the REST surface. When no admin token is
//! configured the middleware passes everything through; otherwise the
//! request must carry `Authorization: Bearer <token>`.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::warn;

use crate::state::AppState;

pub async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.config.server.admin_token else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.strip_prefix("Bearer ").unwrap_or(value));

    if presented == Some(expected.as_str()) {
        next.run(request).await
    } else {
        warn!(path = %request.uri().path(), "admin API request rejected");
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "success": false, "error": "unauthorized" })),
        )
            .into_response()
    }
}
