pub mod health;
pub mod pipeline;
pub mod webhooks;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

/// API error mapped onto an HTTP response.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<crate::domains::pipeline::error::StoreError> for ApiError {
    fn from(e: crate::domains::pipeline::error::StoreError) -> Self {
        use crate::domains::pipeline::error::StoreError;
        match e {
            StoreError::JobNotFound(id) => ApiError::NotFound(format!("job {id} not found")),
            StoreError::InvalidStateTransition { .. } => ApiError::BadRequest(e.to_string()),
            StoreError::Database(e) => ApiError::Internal(e.to_string()),
        }
    }
}

/// Tenant scoping for the pipeline surfaces. Auth itself happens upstream;
/// by the time a request reaches this service the tenant id is a header.
pub fn tenant_id(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    let raw = headers
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing x-tenant-id header".to_string()))?;
    raw.parse()
        .map_err(|_| ApiError::BadRequest("x-tenant-id is not a valid uuid".to_string()))
}

/// Like [`tenant_id`], but absent header means unscoped (ops dashboards).
pub fn optional_tenant_id(headers: &HeaderMap) -> Result<Option<Uuid>, ApiError> {
    match headers.get("x-tenant-id") {
        None => Ok(None),
        Some(_) => tenant_id(headers).map(Some),
    }
}
