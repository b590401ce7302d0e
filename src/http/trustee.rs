//! Trustee endpoints — email verification and post-release vault access.

use axum::Router;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::clock::Clock as _;
use crate::http::{ApiError, AppState};
use crate::model::TrusteeStatus;
use crate::store::Store as _;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/trustee/access", get(access_info).post(access_vault))
        .route("/trustee/verify", get(verify_info).post(verify))
}

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

/// GET /trustee/access?token=A
///
/// Read-only grant lookup for the access page.
async fn access_info(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if query.token.is_empty() {
        return Err(ApiError::Validation("token is required".into()));
    }

    let trustee = state
        .store
        .get_trustee_by_access_token(&query.token)
        .await?
        .ok_or(ApiError::NotFound)?;

    let now = state.clock.now();
    if !trustee.access_is_live(now) {
        return Err(ApiError::Expired);
    }

    let user_name = state
        .store
        .get_user(trustee.user_id)
        .await?
        .map(|u| u.display_name)
        .unwrap_or_default();

    Ok(Json(json!({
        "trustee_name": trustee.name,
        "user_name": user_name,
        "access_expires_at": trustee.access_expires_at,
    })))
}

#[derive(Deserialize)]
struct AccessBody {
    access_token: String,
}

/// POST /trustee/access {access_token}
///
/// Hands over the opaque vault payload while the grant is live. The core
/// never decrypts any of it.
async fn access_vault(
    State(state): State<AppState>,
    Json(body): Json<AccessBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.access_token.is_empty() {
        return Err(ApiError::Validation("access_token is required".into()));
    }

    let trustee = state
        .store
        .get_trustee_by_access_token(&body.access_token)
        .await?
        .ok_or(ApiError::NotFound)?;

    let now = state.clock.now();
    if !trustee.access_is_live(now) {
        return Err(ApiError::Expired);
    }

    let vault = state
        .store
        .get_vault_snapshot(trustee.user_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(json!({
        "vault": vault,
        "access_expires_at": trustee.access_expires_at,
    })))
}

/// GET /trustee/verify?token=V
///
/// Read-only lookup for the verification page.
async fn verify_info(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if query.token.is_empty() {
        return Err(ApiError::Validation("token is required".into()));
    }

    let trustee = state
        .store
        .get_trustee_by_verification_token(&query.token)
        .await?
        .ok_or(ApiError::NotFound)?;

    if trustee.status != TrusteeStatus::Pending {
        return Err(ApiError::Conflict("already_verified".into()));
    }

    let user_name = state
        .store
        .get_user(trustee.user_id)
        .await?
        .map(|u| u.display_name)
        .unwrap_or_default();

    Ok(Json(json!({
        "trustee_name": trustee.name,
        "user_name": user_name,
    })))
}

#[derive(Deserialize)]
struct VerifyBody {
    token: String,
}

/// POST /trustee/verify {token}
///
/// Single-use: the token is cleared in the same commit that verifies, so a
/// replay is indistinguishable from an unknown token.
async fn verify(
    State(state): State<AppState>,
    Json(body): Json<VerifyBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.token.is_empty() {
        return Err(ApiError::Validation("token is required".into()));
    }

    let now = state.clock.now();
    let trustee = state.store.verify_trustee(&body.token, now).await?;

    Ok(Json(json!({
        "trustee_id": trustee.id,
        "status": trustee.status,
        "verified_at": trustee.verified_at,
    })))
}
