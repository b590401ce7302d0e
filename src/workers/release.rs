//! Release worker — the death protocol.
//!
//! Consumes the `release` queue, which is capped at one concurrent job
//! globally. The provisioning transaction (trustee access tokens, letter
//! selection, the `Triggered` flip, audit) commits atomically in the store;
//! the `Triggered` pre-check there makes the whole procedure at-most-once.
//! Notification fan-out happens after commit: a crash between commit and
//! fan-out re-enters here, observes `Triggered`, and exits without minting
//! anything again.

use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock as _;
use crate::error::{Error, Result, StoreError};
use crate::model::{FinalLetter, Trustee, User};
use crate::queue::{JobSpec, QueueBackend as _};
use crate::store::{ReleaseOutcome, Store as _};
use crate::workers::WorkerDeps;

pub struct ReleaseWorker {
    deps: WorkerDeps,
}

impl ReleaseWorker {
    pub fn new(deps: WorkerDeps) -> Self {
        Self { deps }
    }

    pub async fn handle(&self, user_id: Uuid) -> Result<()> {
        let now = self.deps.clock.now();

        let outcome = match self
            .deps
            .store
            .run_release(user_id, now, self.deps.tokens.as_ref())
            .await
        {
            Ok(outcome) => outcome,
            // The owner was deleted while the job sat in the queue.
            Err(StoreError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(Error::Store(e)),
        };

        let (trustees, letters) = match outcome {
            ReleaseOutcome::AlreadyTriggered => {
                info!(user_id = %user_id, "Release already committed; nothing to do");
                return Ok(());
            }
            ReleaseOutcome::Released {
                trustees, letters, ..
            } => (trustees, letters),
        };

        let user = self.deps.store.get_user(user_id).await?;
        let user_name = user
            .as_ref()
            .map(|u| u.display_name.clone())
            .unwrap_or_else(|| "the account owner".to_string());

        for trustee in &trustees {
            self.notify_trustee(trustee, &user_name, now).await?;
        }

        for letter in &letters {
            self.deliver_letter(letter, user.as_ref(), now).await?;
        }

        info!(
            user_id = %user_id,
            trustees = trustees.len(),
            letters = letters.len(),
            "Death protocol completed"
        );
        Ok(())
    }

    async fn notify_trustee(
        &self,
        trustee: &Trustee,
        user_name: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        let Some(ref access_token) = trustee.access_token else {
            warn!(trustee_id = %trustee.id, "Released trustee carries no access token");
            return Ok(());
        };

        let url = format!("{}/trustee/access?token={access_token}", self.deps.base_url);
        let expires = trustee
            .access_expires_at
            .map(|t| t.format("%Y-%m-%d").to_string())
            .unwrap_or_default();

        let subject = format!("{user_name} has granted you access to their vault");
        let text = format!(
            "Hello {name},\n\n\
             {user_name} designated you as a trustee. Their vault is now available to you \
             until {expires}:\n\n{url}\n\n\
             This link is personal and single-purpose. Do not share it.\n",
            name = trustee.name,
        );
        let html = format!(
            "<p>Hello {name},</p>\
             <p>{user_name} designated you as a trustee. Their vault is now available to you \
             until <b>{expires}</b>.</p>\
             <p><a href=\"{url}\">Open the vault</a></p>\
             <p>This link is personal and single-purpose. Do not share it.</p>",
            name = trustee.name,
        );

        self.deps
            .queue
            .enqueue(
                JobSpec::email(
                    format!("trustee-access-email:{}", trustee.id),
                    trustee.email.clone(),
                    subject,
                    html,
                    text,
                    None,
                    now,
                ),
                now,
            )
            .await?;

        if let Some(ref phone) = trustee.phone {
            self.deps
                .queue
                .enqueue(
                    JobSpec::sms(
                        format!("trustee-access-sms:{}", trustee.id),
                        phone.clone(),
                        format!(
                            "{user_name} granted you vault access (expires {expires}): {url}"
                        ),
                        now,
                    ),
                    now,
                )
                .await?;
        }

        Ok(())
    }

    async fn deliver_letter(
        &self,
        letter: &FinalLetter,
        user: Option<&User>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        let sender = user
            .map(|u| u.display_name.as_str())
            .unwrap_or("someone who cared about you");

        // The body stays ciphertext end to end; the recipient's client holds
        // the key material.
        let text = format!(
            "Dear {name},\n\n\
             {sender} left this letter for you.\n\n\
             ---BEGIN ENCRYPTED LETTER---\n{body}\n---END ENCRYPTED LETTER---\n\
             Nonce: {nonce}\n\
             Letter reference: {id}\n",
            name = letter.recipient_name,
            body = letter.encrypted_body,
            nonce = letter.nonce,
            id = letter.id,
        );
        let html = format!(
            "<p>Dear {name},</p>\
             <p>{sender} left this letter for you.</p>\
             <pre>{body}</pre>\
             <p>Nonce: <code>{nonce}</code><br>Letter reference: <code>{id}</code></p>",
            name = letter.recipient_name,
            body = letter.encrypted_body,
            nonce = letter.nonce,
            id = letter.id,
        );

        self.deps
            .queue
            .enqueue(
                JobSpec::email(
                    format!("letter:{}", letter.id),
                    letter.recipient_email.clone(),
                    letter.subject.clone(),
                    html,
                    text,
                    Some(letter.id),
                    now,
                ),
                now,
            )
            .await?;

        // Follow-up commit, idempotent on the letter id.
        self.deps.store.mark_letter_delivered(letter.id, now).await?;

        Ok(())
    }
}
