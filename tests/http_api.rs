//! Integration tests for the HTTP surface.
//!
//! Each test binds the real axum router on a random port over an in-memory
//! store and drives it with reqwest.

use std::sync::Arc;

use axum::extract::Extension;
use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use eternal_sentinel::clock::{Clock as _, ManualClock};
use eternal_sentinel::http::{AppState, SessionUser, router};
use eternal_sentinel::model::{PollingInterval, Trustee, User, Vault};
use eternal_sentinel::queue::{LibSqlQueue, QueueBackend, QueueName};
use eternal_sentinel::store::{LibSqlStore, Store};
use eternal_sentinel::token::OsRngTokens;

fn t0() -> DateTime<Utc> {
    "2025-01-01T00:00:00Z".parse().unwrap()
}

struct TestApp {
    base: String,
    client: reqwest::Client,
    store: Arc<dyn Store>,
    queue: Arc<dyn QueueBackend>,
    clock: Arc<ManualClock>,
}

impl TestApp {
    /// Start a server. `session_user` installs the (normally external)
    /// session middleware's extension for the authenticated route.
    async fn start(session_user: Option<uuid::Uuid>) -> Self {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let queue: Arc<dyn QueueBackend> = Arc::new(LibSqlQueue::new_memory().await.unwrap());
        let clock = Arc::new(ManualClock::new(t0()));

        let state = AppState {
            store: Arc::clone(&store),
            queue: Arc::clone(&queue),
            clock: clock.clone(),
            admin_token: Some(SecretString::from("admin-secret")),
        };

        let mut app = router(state);
        if let Some(user_id) = session_user {
            app = app.layer(Extension(SessionUser(user_id)));
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://127.0.0.1:{port}"),
            client: reqwest::Client::new(),
            store,
            queue,
            clock,
        }
    }

    async fn create_user(&self, email: &str) -> User {
        let user = User::new(email, "Holly", t0());
        self.store
            .create_user(&user, PollingInterval::Monthly, t0())
            .await
            .unwrap();
        user
    }

    /// Issue the user's due check-in directly through the store.
    async fn issue_check_in(&self) -> eternal_sentinel::model::CheckIn {
        let issued = self
            .store
            .issue_due_check_ins(self.clock.now(), 10, &OsRngTokens)
            .await
            .unwrap();
        issued.into_iter().next().expect("a due check-in")
    }
}

#[tokio::test]
async fn status_of_unknown_token_is_not_found() {
    let app = TestApp::start(None).await;

    let response = app
        .client
        .get(format!("{}/checkin/status?token=bogus", app.base))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn confirm_flow_is_idempotent_at_the_token_level() {
    let app = TestApp::start(None).await;
    app.create_user("confirm@example.com").await;

    app.clock.set(t0() + Duration::days(30));
    let check_in = app.issue_check_in().await;

    // Status page shows a live pending check-in.
    let body: Value = app
        .client
        .get(format!(
            "{}/checkin/status?token={}",
            app.base, check_in.token
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "pending");
    assert_eq!(body["is_expired"], false);
    assert_eq!(body["user_name"], "Holly");

    // First confirmation succeeds and reports the next due date.
    app.clock.advance(Duration::hours(1));
    let response = app
        .client
        .post(format!("{}/checkin/confirm", app.base))
        .json(&json!({ "token": check_in.token }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    let next_due: DateTime<Utc> = body["next_check_in_due"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(next_due, app.clock.now() + Duration::days(30));

    // A repeat is a success with the same state, not an error.
    let response = app
        .client
        .post(format!("{}/checkin/confirm", app.base))
        .json(&json!({ "token": check_in.token }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    let repeat_due: DateTime<Utc> = body["next_check_in_due"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(repeat_due, next_due);
}

#[tokio::test]
async fn confirming_after_the_deadline_reports_expired() {
    let app = TestApp::start(None).await;
    app.create_user("late@example.com").await;

    app.clock.set(t0() + Duration::days(30));
    let check_in = app.issue_check_in().await;

    app.clock.set(check_in.expires_at + Duration::seconds(1));
    let response = app
        .client
        .post(format!("{}/checkin/confirm", app.base))
        .json(&json!({ "token": check_in.token }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["expired"], true);
}

#[tokio::test]
async fn empty_token_is_rejected_as_validation_error() {
    let app = TestApp::start(None).await;

    let response = app
        .client
        .post(format!("{}/checkin/confirm", app.base))
        .json(&json!({ "token": "" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "invalid_request");
}

#[tokio::test]
async fn session_confirm_requires_the_session_extension() {
    let app = TestApp::start(None).await;
    let response = app
        .client
        .post(format!("{}/checkin", app.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn session_confirm_resets_the_config() {
    let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
    let user = User::new("session@example.com", "Sess", t0());
    store
        .create_user(&user, PollingInterval::Monthly, t0())
        .await
        .unwrap();

    // Rebuild the app around the pre-created user so the session extension
    // carries a real id.
    let base = {
        let queue: Arc<dyn QueueBackend> = Arc::new(LibSqlQueue::new_memory().await.unwrap());
        let state = AppState {
            store: Arc::clone(&store),
            queue,
            clock: Arc::new(ManualClock::new(t0())),
            admin_token: None,
        };
        let router = router(state).layer(Extension(SessionUser(user.id)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://127.0.0.1:{port}")
    };

    let response = reqwest::Client::new()
        .post(format!("{base}/checkin"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "active");
    assert_eq!(body["current_missed_check_ins"], 0);
}

#[tokio::test]
async fn admin_endpoints_reject_missing_or_wrong_tokens() {
    let app = TestApp::start(None).await;
    let user = app.create_user("admin-target@example.com").await;

    let response = app
        .client
        .post(format!("{}/admin/checkin", app.base))
        .json(&json!({ "user_id": user.id }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = app
        .client
        .post(format!("{}/admin/checkin", app.base))
        .header("x-admin-token", "wrong")
        .json(&json!({ "user_id": user.id }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn admin_trigger_enqueues_the_release_job() {
    let app = TestApp::start(None).await;
    let user = app.create_user("trigger@example.com").await;

    let response = app
        .client
        .post(format!("{}/admin/trigger", app.base))
        .header("x-admin-token", "admin-secret")
        .json(&json!({ "user_id": user.id }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["enqueued"], true);

    assert_eq!(app.queue.pending_count(QueueName::Release).await.unwrap(), 1);

    // A second trigger coalesces onto the same job.
    let response = app
        .client
        .post(format!("{}/admin/trigger", app.base))
        .header("x-admin-token", "admin-secret")
        .json(&json!({ "user_id": user.id }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(app.queue.pending_count(QueueName::Release).await.unwrap(), 1);
}

#[tokio::test]
async fn trustee_verification_is_single_use() {
    let app = TestApp::start(None).await;
    let user = app.create_user("owner@example.com").await;

    let trustee = Trustee::new(user.id, "Tess", "tess@example.com", "sister", "vtoken", t0());
    app.store.create_trustee(&trustee).await.unwrap();

    let response = app
        .client
        .post(format!("{}/trustee/verify", app.base))
        .json(&json!({ "token": "vtoken" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "verified");

    // The token died with the first use.
    let response = app
        .client
        .post(format!("{}/trustee/verify", app.base))
        .json(&json!({ "token": "vtoken" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn trustee_access_serves_the_vault_until_expiry() {
    let app = TestApp::start(None).await;
    let user = app.create_user("vault-owner@example.com").await;

    let trustee = Trustee::new(user.id, "Tess", "tess@example.com", "sister", "vtoken", t0());
    app.store.create_trustee(&trustee).await.unwrap();
    app.store.verify_trustee("vtoken", t0()).await.unwrap();

    let vault = Vault {
        id: uuid::Uuid::new_v4(),
        user_id: user.id,
        encrypted_master_key: "bWFzdGVy".into(),
        master_key_salt: "c2FsdA".into(),
        master_key_nonce: "bm9uY2U".into(),
        created_at: t0(),
    };
    app.store.upsert_vault(&vault).await.unwrap();

    // Release through the store; the HTTP layer only serves the grant.
    app.store
        .run_release(user.id, app.clock.now(), &OsRngTokens)
        .await
        .unwrap();
    let access_token = app.store.list_trustees(user.id).await.unwrap()[0]
        .access_token
        .clone()
        .unwrap();

    let body: Value = app
        .client
        .get(format!(
            "{}/trustee/access?token={access_token}",
            app.base
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["trustee_name"], "Tess");
    assert_eq!(body["user_name"], "Holly");

    let response = app
        .client
        .post(format!("{}/trustee/access", app.base))
        .json(&json!({ "access_token": access_token }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["vault"]["encrypted_master_key"], "bWFzdGVy");
    assert!(body["vault"]["items"].as_array().unwrap().is_empty());

    // Thirty-one days on, the grant is gone.
    app.clock.advance(Duration::days(31));
    let response = app
        .client
        .post(format!("{}/trustee/access", app.base))
        .json(&json!({ "access_token": access_token }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["expired"], true);
}
