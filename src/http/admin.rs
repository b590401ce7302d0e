//! Administrative overrides — force check-in and manual trigger.
//!
//! Gated by `ADMIN_API_TOKEN` via the `x-admin-token` header; the endpoints
//! are disabled entirely when no token is configured.

use axum::Router;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Json;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::clock::Clock as _;
use crate::http::{ApiError, AppState};
use crate::queue::{JobSpec, QueueBackend as _};
use crate::store::Store as _;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/admin/checkin", post(force_check_in))
        .route("/admin/trigger", post(trigger))
}

/// Constant-time byte comparison for the admin token.
fn tokens_match(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(ref expected) = state.admin_token else {
        return Err(ApiError::Unauthorized);
    };
    let presented = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    if tokens_match(presented.as_bytes(), expected.expose_secret().as_bytes()) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

#[derive(Deserialize)]
struct UserBody {
    user_id: Uuid,
}

/// POST /admin/checkin {user_id}
///
/// Forces a confirmation: cancels pending prompts and resets the config,
/// from any non-terminal state including paused.
async fn force_check_in(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UserBody>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;

    let now = state.clock.now();
    let config = state.store.admin_force_check_in(body.user_id, now).await?;

    Ok(Json(json!({
        "status": config.status,
        "current_missed_check_ins": config.current_missed,
        "next_check_in_due": config.next_check_in_due,
    })))
}

/// POST /admin/trigger {user_id}
///
/// Requests the death protocol with zero delay. The release worker owns the
/// actual transition; the idempotency key makes repeated requests harmless.
async fn trigger(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UserBody>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;

    let now = state.clock.now();
    state.store.admin_trigger(body.user_id, now).await?;

    let enqueued = state
        .queue
        .enqueue(JobSpec::release(body.user_id, now), now)
        .await?;

    Ok(Json(json!({
        "enqueued": true,
        "job_id": enqueued.id(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_comparison_rejects_prefixes_and_case() {
        assert!(tokens_match(b"secret", b"secret"));
        assert!(!tokens_match(b"secret", b"secre"));
        assert!(!tokens_match(b"secret", b"secret2"));
        assert!(!tokens_match(b"secret", b"Secret"));
        assert!(!tokens_match(b"", b"secret"));
    }
}
