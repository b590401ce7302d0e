//! End-to-end scenario tests for the liveness-and-release pipeline.
//!
//! Each test drives the real sweep, queue, and workers over an in-memory
//! store with a manually advanced clock, stepping the dispatcher
//! deterministically instead of running the background loops.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use eternal_sentinel::clock::{Clock as _, ManualClock};
use eternal_sentinel::error::TransportError;
use eternal_sentinel::model::{
    AuditKind, CheckInStatus, FinalLetter, LetterStatus, Observer, PollingInterval, PollingStatus,
    Trustee, TrusteeStatus, User, Vault,
};
use eternal_sentinel::queue::{
    Dispatcher, Enqueued, JobSpec, LibSqlQueue, QueueBackend, QueueName,
};
use eternal_sentinel::scheduler::Sweeper;
use eternal_sentinel::store::{LibSqlStore, Store};
use eternal_sentinel::token::OsRngTokens;
use eternal_sentinel::transport::{
    EmailTransport, OutboundEmail, OutboundSms, SmsTransport,
};
use eternal_sentinel::workers::{
    CheckinWorker, EscalationWorker, NotifyWorker, ReleaseWorker, WorkerDeps,
};

fn t0() -> DateTime<Utc> {
    "2025-01-01T00:00:00Z".parse().unwrap()
}

/// Records outbound messages instead of sending them.
#[derive(Default)]
struct RecordingOutbox {
    emails: Mutex<Vec<OutboundEmail>>,
    texts: Mutex<Vec<OutboundSms>>,
}

impl RecordingOutbox {
    fn emails(&self) -> Vec<OutboundEmail> {
        self.emails.lock().unwrap().clone()
    }

    fn texts(&self) -> Vec<OutboundSms> {
        self.texts.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmailTransport for RecordingOutbox {
    async fn send(&self, email: &OutboundEmail) -> Result<(), TransportError> {
        if email.to.is_empty() {
            return Err(TransportError::NoRecipient { channel: "email" });
        }
        self.emails.lock().unwrap().push(email.clone());
        Ok(())
    }
}

#[async_trait]
impl SmsTransport for RecordingOutbox {
    async fn send(&self, sms: &OutboundSms) -> Result<(), TransportError> {
        if sms.to.is_empty() {
            return Err(TransportError::NoRecipient { channel: "sms" });
        }
        self.texts.lock().unwrap().push(sms.clone());
        Ok(())
    }
}

struct Harness {
    store: Arc<dyn Store>,
    queue: Arc<dyn QueueBackend>,
    clock: Arc<ManualClock>,
    sweeper: Sweeper,
    dispatcher: Dispatcher,
    outbox: Arc<RecordingOutbox>,
}

impl Harness {
    async fn new() -> Self {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let queue: Arc<dyn QueueBackend> = Arc::new(LibSqlQueue::new_memory().await.unwrap());
        let clock = Arc::new(ManualClock::new(t0()));
        let tokens = Arc::new(OsRngTokens);
        let outbox = Arc::new(RecordingOutbox::default());

        let deps = WorkerDeps {
            store: Arc::clone(&store),
            queue: Arc::clone(&queue),
            clock: clock.clone(),
            tokens: tokens.clone(),
            base_url: "https://sentinel.test".to_string(),
        };

        let dispatcher = Dispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&store),
            clock.clone(),
            CheckinWorker::new(deps.clone()),
            EscalationWorker::new(deps.clone()),
            ReleaseWorker::new(deps.clone()),
            NotifyWorker::new(outbox.clone(), outbox.clone()),
        );

        let sweeper = Sweeper::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            clock.clone(),
            tokens,
            100,
        );

        Self {
            store,
            queue,
            clock,
            sweeper,
            dispatcher,
            outbox,
        }
    }

    async fn create_user(&self, email: &str) -> User {
        let user = User::new(email, "Test User", self.clock.now());
        self.store
            .create_user(&user, PollingInterval::Monthly, self.clock.now())
            .await
            .unwrap();
        user
    }

    /// Sweep once, then run every due job to completion.
    async fn tick(&self) {
        self.sweeper.run_once().await.unwrap();
        self.dispatcher.process_available().await.unwrap();
    }

    async fn config(&self, user: &User) -> eternal_sentinel::model::PollingConfig {
        self.store
            .get_polling_config(user.id)
            .await
            .unwrap()
            .unwrap()
    }

    async fn audit_kinds(&self, user: &User) -> Vec<AuditKind> {
        self.store
            .recent_audit(user.id, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect()
    }

    /// The single pending check-in of the user.
    async fn pending_check_in(&self, user: &User) -> eternal_sentinel::model::CheckIn {
        // Walk audit for issued ids would be roundabout; scan tokens via the
        // recent audit detail instead.
        let entries = self.store.recent_audit(user.id, 100).await.unwrap();
        for entry in entries {
            if let Some(id) = entry.detail.get("check_in_id").and_then(|v| v.as_str()) {
                let id = id.parse().unwrap();
                if let Some(check_in) = self.store.get_check_in(id).await.unwrap()
                    && check_in.status == CheckInStatus::Pending
                {
                    return check_in;
                }
            }
        }
        panic!("no pending check-in for user");
    }
}

// ── S1: happy confirm ───────────────────────────────────────────────

#[tokio::test]
async fn confirm_in_time_keeps_user_active() {
    let h = Harness::new().await;
    let user = h.create_user("s1@example.com").await;

    // First check-in comes due one period after signup.
    h.clock.set(t0() + Duration::days(30));
    h.tick().await;

    let check_in = h.pending_check_in(&user).await;
    assert_eq!(check_in.expires_at, h.clock.now() + Duration::days(7));
    // The notification went out over email.
    let emails = h.outbox.emails();
    assert_eq!(emails.len(), 1);
    assert!(emails[0].text.contains(&check_in.token));

    // Confirm an hour later.
    h.clock.advance(Duration::hours(1));
    let confirmed = h
        .store
        .confirm_check_in(&check_in.token, h.clock.now(), &Observer::default())
        .await
        .unwrap();

    assert_eq!(
        confirmed.config.next_check_in_due,
        h.clock.now() + Duration::days(30)
    );

    let config = h.config(&user).await;
    assert_eq!(config.status, PollingStatus::Active);
    assert_eq!(config.current_missed, 0);
    assert_eq!(config.last_check_in_at, Some(h.clock.now()));

    let check_in = h.store.get_check_in(check_in.id).await.unwrap().unwrap();
    assert_eq!(check_in.status, CheckInStatus::Confirmed);

    let kinds = h.audit_kinds(&user).await;
    assert!(kinds.contains(&AuditKind::CheckInConfirmed));
}

// ── S2: single miss escalates ───────────────────────────────────────

#[tokio::test]
async fn missed_check_in_escalates_to_first_grace_period() {
    let h = Harness::new().await;
    let user = h.create_user("s2@example.com").await;

    h.clock.set(t0() + Duration::days(30));
    h.tick().await;
    let first = h.pending_check_in(&user).await;

    // Expiry passes unacknowledged.
    h.clock.set(first.expires_at + Duration::seconds(1));
    h.tick().await;

    let config = h.config(&user).await;
    assert_eq!(config.status, PollingStatus::Grace1);
    assert_eq!(config.current_missed, 1);

    let first = h.store.get_check_in(first.id).await.unwrap().unwrap();
    assert_eq!(first.status, CheckInStatus::Missed);

    // A fresh grace-period check-in exists, expiring one grace window out.
    let second = h.pending_check_in(&user).await;
    assert_eq!(second.expires_at, h.clock.now() + Duration::days(7));

    let kinds = h.audit_kinds(&user).await;
    assert!(kinds.contains(&AuditKind::CheckInMissed));
    assert!(kinds.contains(&AuditKind::EscalationLevel1));
}

// ── S3: race-cancel ─────────────────────────────────────────────────

#[tokio::test]
async fn confirmation_cancels_stale_escalation() {
    let h = Harness::new().await;
    let user = h.create_user("s3@example.com").await;

    h.clock.set(t0() + Duration::days(30));
    h.tick().await;
    let first = h.pending_check_in(&user).await;
    h.clock.set(first.expires_at + Duration::seconds(1));
    h.tick().await;

    // The user confirms the grace check-in a day later.
    let grace = h.pending_check_in(&user).await;
    h.clock.advance(Duration::days(1));
    h.store
        .confirm_check_in(&grace.token, h.clock.now(), &Observer::default())
        .await
        .unwrap();
    let config = h.config(&user).await;
    assert_eq!(config.status, PollingStatus::Active);
    assert_eq!(config.current_missed, 0);

    // A delayed escalation carrying the pre-confirmation counter fires later.
    h.queue
        .enqueue(
            JobSpec::escalation(user.id, 2, 1, h.clock.now() + Duration::days(2)),
            h.clock.now(),
        )
        .await
        .unwrap();
    h.clock.advance(Duration::days(2));
    h.dispatcher.process_available().await.unwrap();

    // No transition happened.
    let config = h.config(&user).await;
    assert_eq!(config.status, PollingStatus::Active);
    assert_eq!(config.current_missed, 0);

    let kinds = h.audit_kinds(&user).await;
    assert!(kinds.contains(&AuditKind::EscalationSkippedStale));
}

// ── S4: full escalation to release ──────────────────────────────────

#[tokio::test]
async fn unanswered_escalation_chain_releases_the_vault() {
    let h = Harness::new().await;
    let user = h.create_user("s4@example.com").await;

    // Two eligible trustees, one with a phone for SMS.
    let trustee_a = Trustee::new(user.id, "Ada", "ada@example.com", "sister", "verify-a", t0());
    let trustee_b =
        Trustee::new(user.id, "Ben", "ben@example.com", "friend", "verify-b", t0())
            .with_phone("+15550001111");
    h.store.create_trustee(&trustee_a).await.unwrap();
    h.store.create_trustee(&trustee_b).await.unwrap();
    h.store.verify_trustee("verify-a", t0()).await.unwrap();
    h.store.verify_trustee("verify-b", t0()).await.unwrap();

    // One ready letter, one draft that must not be delivered.
    let ready = FinalLetter::new(
        user.id,
        "Cara",
        "cara@example.com",
        "For you",
        "Y2lwaGVydGV4dA",
        "bm9uY2U",
        t0(),
    );
    h.store.create_letter(&ready).await.unwrap();
    h.store.mark_letter_ready(ready.id, t0()).await.unwrap();
    let draft = FinalLetter::new(
        user.id,
        "Dan",
        "dan@example.com",
        "Unfinished",
        "ZHJhZnQ",
        "bm9uY2Uy",
        t0(),
    );
    h.store.create_letter(&draft).await.unwrap();

    let vault = Vault {
        id: uuid::Uuid::new_v4(),
        user_id: user.id,
        encrypted_master_key: "bWFzdGVy".into(),
        master_key_salt: "c2FsdA".into(),
        master_key_nonce: "a2Vk".into(),
        created_at: t0(),
    };
    h.store.upsert_vault(&vault).await.unwrap();

    // Timeline (monthly interval, grace periods 7/14/7):
    //   t0+30d  check-in issued, expires +7d
    //   t0+37d  missed → grace 1, next expires +7d
    //   t0+44d  missed → grace 2, next expires +14d
    //   t0+58d  missed → grace 3, next expires +7d, release due +7d
    //   t0+65d  release fires
    for day in [30, 37, 44, 58] {
        h.clock.set(t0() + Duration::days(day) + Duration::seconds(1));
        h.tick().await;
    }

    let config = h.config(&user).await;
    assert_eq!(config.status, PollingStatus::Grace3);
    assert_eq!(config.current_missed, 3);

    let release_at = t0() + Duration::days(65) + Duration::seconds(1);
    h.clock.set(release_at + Duration::seconds(1));
    h.tick().await;

    let config = h.config(&user).await;
    assert_eq!(config.status, PollingStatus::Triggered);
    let triggered_at = config.triggered_at.expect("triggered_at must be set");
    assert!(triggered_at <= h.clock.now());

    // Both eligible trustees hold fresh, distinct, 30-day grants.
    let trustees = h.store.list_trustees(user.id).await.unwrap();
    assert_eq!(trustees.len(), 2);
    let mut tokens = Vec::new();
    for trustee in &trustees {
        assert_eq!(trustee.status, TrusteeStatus::Active);
        let token = trustee.access_token.clone().expect("access token minted");
        assert_eq!(token.len(), 64);
        assert_eq!(
            trustee.access_expires_at.unwrap(),
            trustee.access_granted_at.unwrap() + Duration::days(30)
        );
        tokens.push(token);
    }
    tokens.dedup();
    assert_eq!(tokens.len(), 2);

    // The ready letter went out and is terminal; the draft is untouched.
    let letters = h.store.list_letters(user.id).await.unwrap();
    let ready_after = letters.iter().find(|l| l.id == ready.id).unwrap();
    assert_eq!(ready_after.status, LetterStatus::Delivered);
    assert!(ready_after.delivered_at.is_some());
    let draft_after = letters.iter().find(|l| l.id == draft.id).unwrap();
    assert_eq!(draft_after.status, LetterStatus::Draft);

    let emails = h.outbox.emails();
    assert!(emails.iter().any(|e| e.to == "cara@example.com"));
    assert!(emails.iter().any(|e| e.to == "ada@example.com"));
    assert!(emails.iter().any(|e| e.to == "ben@example.com"));
    assert!(!emails.iter().any(|e| e.to == "dan@example.com"));
    let texts = h.outbox.texts();
    assert!(texts.iter().any(|s| s.to == "+15550001111"));

    let kinds = h.audit_kinds(&user).await;
    assert!(kinds.contains(&AuditKind::DeathProtocolTriggered));

    // A duplicate release request right after coalesces; nothing is re-minted.
    let emails_before = h.outbox.emails().len();
    let dup = h
        .queue
        .enqueue(JobSpec::release(user.id, h.clock.now()), h.clock.now())
        .await
        .unwrap();
    assert!(matches!(dup, Enqueued::Coalesced(_)));
    h.dispatcher.process_available().await.unwrap();

    let after = h.store.list_trustees(user.id).await.unwrap();
    let tokens_after: Vec<_> = after.iter().map(|t| t.access_token.clone()).collect();
    assert_eq!(
        tokens_after,
        trustees
            .iter()
            .map(|t| t.access_token.clone())
            .collect::<Vec<_>>()
    );
    assert_eq!(h.outbox.emails().len(), emails_before);
}

// ── S5: paused during escalation ────────────────────────────────────

#[tokio::test]
async fn paused_user_misses_without_escalating() {
    let h = Harness::new().await;
    let user = h.create_user("s5@example.com").await;

    h.clock.set(t0() + Duration::days(30));
    h.tick().await;
    let first = h.pending_check_in(&user).await;
    h.clock.set(first.expires_at + Duration::seconds(1));
    h.tick().await;
    assert_eq!(h.config(&user).await.status, PollingStatus::Grace1);

    // Admin pauses mid-escalation.
    h.store.pause(user.id, h.clock.now()).await.unwrap();
    let grace = h.pending_check_in(&user).await;

    // The grace check-in expires while paused: marked missed, no escalation.
    h.clock.set(grace.expires_at + Duration::seconds(1));
    h.tick().await;

    let grace = h.store.get_check_in(grace.id).await.unwrap().unwrap();
    assert_eq!(grace.status, CheckInStatus::Missed);
    let config = h.config(&user).await;
    assert_eq!(config.status, PollingStatus::Paused);
    // Pause froze the counter where escalation left it.
    assert_eq!(config.current_missed, 1);
    assert_eq!(
        h.queue.pending_count(QueueName::Escalation).await.unwrap(),
        0
    );

    // Resume resets and reschedules from the resume instant.
    h.clock.advance(Duration::days(3));
    let resumed = h.store.resume(user.id, h.clock.now()).await.unwrap();
    assert_eq!(resumed.status, PollingStatus::Active);
    assert_eq!(resumed.current_missed, 0);
    assert_eq!(resumed.next_check_in_due, h.clock.now() + Duration::days(30));
}

// ── S6: trustee eligibility ─────────────────────────────────────────

#[tokio::test]
async fn release_grants_access_only_to_eligible_trustees() {
    let h = Harness::new().await;
    let user = h.create_user("s6@example.com").await;

    let mut pending = Trustee::new(user.id, "P", "p@example.com", "friend", "vp", t0());
    pending.status = TrusteeStatus::Pending;
    let mut verified = Trustee::new(user.id, "V", "v@example.com", "friend", "vv", t0());
    verified.status = TrusteeStatus::Verified;
    let mut active = Trustee::new(user.id, "A", "a@example.com", "friend", "va", t0());
    active.status = TrusteeStatus::Active;
    let mut revoked = Trustee::new(user.id, "R", "r@example.com", "friend", "vr", t0());
    revoked.status = TrusteeStatus::Revoked;

    for trustee in [&pending, &verified, &active, &revoked] {
        h.store.create_trustee(trustee).await.unwrap();
    }

    // Admin trigger: audit, then an immediate release job.
    h.store.admin_trigger(user.id, h.clock.now()).await.unwrap();
    h.queue
        .enqueue(JobSpec::release(user.id, h.clock.now()), h.clock.now())
        .await
        .unwrap();
    h.dispatcher.process_available().await.unwrap();

    let trustees = h.store.list_trustees(user.id).await.unwrap();
    for trustee in &trustees {
        let granted = trustee.access_token.is_some();
        let eligible = trustee.email == "v@example.com" || trustee.email == "a@example.com";
        assert_eq!(granted, eligible, "trustee {}", trustee.email);
    }

    let grants = h
        .store
        .recent_audit(user.id, 100)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == AuditKind::AccessGranted)
        .count();
    assert_eq!(grants, 2);

    let kinds = h.audit_kinds(&user).await;
    assert!(kinds.contains(&AuditKind::AdminTrigger));
    assert!(kinds.contains(&AuditKind::DeathProtocolTriggered));
}

// ── Convergence: batch size does not change the outcome ─────────────

#[tokio::test]
async fn tiny_sweep_batches_converge_to_the_same_state() {
    let h = Harness::new().await;
    let small_sweeper = Sweeper::new(
        Arc::clone(&h.store),
        Arc::clone(&h.queue),
        h.clock.clone(),
        Arc::new(OsRngTokens),
        1,
    );

    let mut users = Vec::new();
    for i in 0..4 {
        users.push(h.create_user(&format!("bulk{i}@example.com")).await);
    }

    h.clock.set(t0() + Duration::days(30));
    // Batch bound 1 per pass: repeat until the backlog drains.
    for _ in 0..users.len() {
        small_sweeper.run_once().await.unwrap();
    }
    h.dispatcher.process_available().await.unwrap();

    for user in &users {
        let config = h.config(user).await;
        assert_eq!(config.next_check_in_due, h.clock.now() + Duration::days(30));
        let kinds = h.audit_kinds(user).await;
        assert!(kinds.contains(&AuditKind::CheckInIssued));
    }
}

// ── Admin force check-in from a grace state ─────────────────────────

#[tokio::test]
async fn admin_force_check_in_resets_and_cancels_prompts() {
    let h = Harness::new().await;
    let user = h.create_user("admin@example.com").await;

    h.clock.set(t0() + Duration::days(30));
    h.tick().await;
    let first = h.pending_check_in(&user).await;
    h.clock.set(first.expires_at + Duration::seconds(1));
    h.tick().await;
    assert_eq!(h.config(&user).await.status, PollingStatus::Grace1);

    let grace = h.pending_check_in(&user).await;
    let config = h
        .store
        .admin_force_check_in(user.id, h.clock.now())
        .await
        .unwrap();
    assert_eq!(config.status, PollingStatus::Active);
    assert_eq!(config.current_missed, 0);

    let grace = h.store.get_check_in(grace.id).await.unwrap().unwrap();
    assert_eq!(grace.status, CheckInStatus::Cancelled);

    let kinds = h.audit_kinds(&user).await;
    assert!(kinds.contains(&AuditKind::AdminForceCheckIn));
}
