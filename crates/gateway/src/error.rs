//! Maps `ProxyError` (§7) onto an axum HTTP response. Lives here rather
//! than in `proxy-core` since the core crate doesn't depend on axum.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use proxy_core::error::ProxyError;
use serde_json::json;

pub struct ApiError(pub ProxyError);

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "error": self.0.body() }))).into_response()
    }
}
