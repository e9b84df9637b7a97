//! HTTP/WebSocket/SSE transport (§4.7, §4.8).

pub mod auth;
pub mod http;
pub mod sse;
pub mod ws;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use sd_domain::error::Error;

use crate::state::AppState;

/// Wraps a domain error so handlers can just `?` their way to a response;
/// status and `code` follow the same taxonomy as `turn.error` (§6).
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "code": self.0.turn_error_code(),
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Assemble the full router: the unauthenticated liveness probe at
/// `/health`, and every `/v3/*` route (REST + WS + SSE) behind the bearer
/// token middleware (§4.7, §6 "Auth").
pub fn build(state: AppState) -> Router {
    let protected = Router::new()
        .merge(http::protected_routes())
        .merge(ws::routes())
        .merge(sse::routes())
        .route_layer(axum::middleware::from_fn_with_state(
            state.token.clone(),
            auth::require_bearer_token,
        ))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(|| async { (StatusCode::OK, "ok") }))
        .nest("/v3", protected)
        .layer(crate::cors::layer(&state.config.server.cors))
}
