//! HTTP surface — public check-in confirmation, trustee access, and the
//! administrative overrides.

pub mod admin;
pub mod checkin;
pub mod trustee;

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use secrecy::SecretString;
use serde_json::json;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::queue::QueueBackend;
use crate::store::Store;

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn QueueBackend>,
    pub clock: Arc<dyn Clock>,
    /// Admin endpoints are disabled when unset.
    pub admin_token: Option<SecretString>,
}

/// Authenticated session identity, installed as a request extension by the
/// (external) session middleware.
#[derive(Debug, Clone, Copy)]
pub struct SessionUser(pub Uuid);

/// Build the full router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(checkin::routes())
        .merge(trustee::routes())
        .merge(admin::routes())
        .with_state(state)
}

/// API error taxonomy → HTTP mapping. Internal details never leak to
/// untrusted callers.
#[derive(Debug)]
pub enum ApiError {
    /// Malformed input.
    Validation(String),
    NotFound,
    /// Acting on an already-resolved or terminal entity.
    Conflict(String),
    /// Time-bounded artifact used after its deadline.
    Expired,
    Unauthorized,
    /// Store or queue unavailable; the caller should retry.
    Unavailable,
    Internal,
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => ApiError::NotFound,
            StoreError::AlreadyResolved => ApiError::Conflict("already_resolved".into()),
            StoreError::Expired => ApiError::Expired,
            StoreError::Conflict(reason) => ApiError::Conflict(reason),
            StoreError::Unavailable(_) => ApiError::Unavailable,
            e => {
                tracing::error!("Store failure surfaced to HTTP: {e}");
                ApiError::Internal
            }
        }
    }
}

impl From<crate::error::QueueError> for ApiError {
    fn from(e: crate::error::QueueError) -> Self {
        tracing::error!("Queue failure surfaced to HTTP: {e}");
        ApiError::Unavailable
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Validation(message) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "invalid_request", "message": message }),
            ),
            ApiError::NotFound => (StatusCode::NOT_FOUND, json!({ "error": "not_found" })),
            ApiError::Conflict(reason) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "conflict", "reason": reason }),
            ),
            ApiError::Expired => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "expired", "expired": true }),
            ),
            ApiError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, json!({ "error": "unauthorized" }))
            }
            ApiError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "unavailable" }),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "internal" }),
            ),
        };
        (status, axum::Json(body)).into_response()
    }
}
