//! Check-in endpoints — the public token paths and the authenticated
//! manual confirmation.

use axum::Router;
use axum::extract::{Extension, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use std::time::Duration as StdDuration;

use crate::clock::Clock as _;
use crate::error::StoreError;
use crate::http::{ApiError, AppState, SessionUser};
use crate::model::{CheckInStatus, Observer};
use crate::store::Store as _;

/// Wall-clock budget for the confirmation path; beyond it the caller gets a
/// retriable error.
const CONFIRM_TIMEOUT: StdDuration = StdDuration::from_secs(10);

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/checkin/status", get(status))
        .route("/checkin/confirm", post(confirm))
        .route("/checkin", post(confirm_session))
}

fn observer_from(headers: &HeaderMap) -> Observer {
    Observer {
        ip: headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(',').next().unwrap_or(s).trim().to_string()),
        user_agent: headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

/// GET /checkin/status?token=T
///
/// Public, read-only. Feeds the check-in page's
/// pending / confirmed / expired / invalid display.
async fn status(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if query.token.is_empty() {
        return Err(ApiError::Validation("token is required".into()));
    }

    let check_in = state
        .store
        .get_check_in_by_token(&query.token)
        .await?
        .ok_or(ApiError::NotFound)?;

    let user_name = state
        .store
        .get_user(check_in.user_id)
        .await?
        .map(|u| u.display_name)
        .unwrap_or_default();

    let now = state.clock.now();
    Ok(Json(json!({
        "status": check_in.status,
        "expires_at": check_in.expires_at,
        "is_expired": check_in.is_expired(now),
        "user_name": user_name,
    })))
}

#[derive(Deserialize)]
struct ConfirmBody {
    token: String,
}

/// POST /checkin/confirm {token}
///
/// Public, idempotent at the token level: confirming an already-confirmed
/// check-in returns the current state without side effects.
async fn confirm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ConfirmBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.token.is_empty() {
        return Err(ApiError::Validation("token is required".into()));
    }

    let observer = observer_from(&headers);
    let now = state.clock.now();

    let outcome = tokio::time::timeout(
        CONFIRM_TIMEOUT,
        state.store.confirm_check_in(&body.token, now, &observer),
    )
    .await
    .map_err(|_| ApiError::Unavailable)?;

    match outcome {
        Ok(confirmed) => Ok(Json(confirm_response(confirmed.config.next_check_in_due))),
        Err(StoreError::AlreadyResolved) => {
            // Repeated confirmation of a confirmed token is a success.
            let check_in = state
                .store
                .get_check_in_by_token(&body.token)
                .await?
                .ok_or(ApiError::NotFound)?;
            if check_in.status == CheckInStatus::Confirmed {
                let config = state
                    .store
                    .get_polling_config(check_in.user_id)
                    .await?
                    .ok_or(ApiError::NotFound)?;
                Ok(Json(confirm_response(config.next_check_in_due)))
            } else {
                Err(ApiError::Conflict("already_resolved".into()))
            }
        }
        Err(e) => Err(e.into()),
    }
}

fn confirm_response(next_check_in_due: DateTime<Utc>) -> serde_json::Value {
    json!({ "next_check_in_due": next_check_in_due })
}

/// POST /checkin (session cookie)
///
/// Confirms every pending check-in of the session user and resets their
/// polling config.
async fn confirm_session(
    State(state): State<AppState>,
    session: Option<Extension<SessionUser>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let Some(Extension(SessionUser(user_id))) = session else {
        return Err(ApiError::Unauthorized);
    };

    let observer = observer_from(&headers);
    let now = state.clock.now();

    let config = tokio::time::timeout(
        CONFIRM_TIMEOUT,
        state.store.confirm_latest_for_user(user_id, now, &observer),
    )
    .await
    .map_err(|_| ApiError::Unavailable)??;

    Ok(Json(json!({
        "status": config.status,
        "current_missed_check_ins": config.current_missed,
        "next_check_in_due": config.next_check_in_due,
    })))
}
