//! Check-in worker — materializes liveness prompts into channel messages.
//!
//! Consumes the `checkin` queue. Renders the notification for each enabled
//! channel and hands it to the `email`/`sms` queues; never blocks on a
//! transport and never mutates polling state (confirmations arrive out of
//! band through the HTTP path).

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock as _;
use crate::error::Result;
use crate::model::{CheckIn, CheckInStatus, PollingConfig, PollingStatus, SendChannel, User};
use crate::queue::{JobSpec, QueueBackend as _};
use crate::store::Store as _;
use crate::workers::WorkerDeps;

pub struct CheckinWorker {
    deps: WorkerDeps,
}

impl CheckinWorker {
    pub fn new(deps: WorkerDeps) -> Self {
        Self { deps }
    }

    pub async fn handle(&self, check_in_id: Uuid) -> Result<()> {
        let now = self.deps.clock.now();

        let Some(check_in) = self.deps.store.get_check_in(check_in_id).await? else {
            debug!(check_in_id = %check_in_id, "Check-in vanished; nothing to send");
            return Ok(());
        };

        if check_in.status != CheckInStatus::Pending {
            // Resolved between enqueue and execution. Idempotent no-op.
            debug!(check_in_id = %check_in_id, status = ?check_in.status, "Check-in already resolved");
            return Ok(());
        }

        let Some(config) = self
            .deps
            .store
            .get_polling_config(check_in.user_id)
            .await?
        else {
            return Ok(());
        };

        if !config.status.is_escalatable() {
            // Paused or triggered owners get no prompts.
            debug!(
                user_id = %check_in.user_id,
                status = config.status.as_str(),
                "Suppressing notification"
            );
            return Ok(());
        }

        let Some(user) = self.deps.store.get_user(check_in.user_id).await? else {
            return Ok(());
        };

        // Link to the GET landing page; confirmation itself is a POST from
        // there, mirroring the trustee access link.
        let url = format!(
            "{}/checkin/status?token={}",
            self.deps.base_url, check_in.token
        );

        let mut attempted = Vec::new();

        if config.email_enabled {
            let (subject, html, text) = render_email(&user, &config, &check_in, &url);
            self.deps
                .queue
                .enqueue(
                    JobSpec::email(
                        format!("checkin-email:{}", check_in.id),
                        user.email.clone(),
                        subject,
                        html,
                        text,
                        None,
                        now,
                    ),
                    now,
                )
                .await?;
            attempted.push(SendChannel::Email);
        }

        if config.sms_enabled {
            // A missing phone number is the transport's problem: the SMS job
            // fails retriably and the channel drops after max_attempts.
            let to = user.phone.clone().unwrap_or_default();
            self.deps
                .queue
                .enqueue(
                    JobSpec::sms(
                        format!("checkin-sms:{}", check_in.id),
                        to,
                        render_sms(&config, &url, check_in.expires_at),
                        now,
                    ),
                    now,
                )
                .await?;
            attempted.push(SendChannel::Sms);
        }

        self.deps
            .store
            .set_check_in_sent_via(check_in.id, &attempted)
            .await?;

        info!(
            check_in_id = %check_in.id,
            user_id = %check_in.user_id,
            channels = attempted.len(),
            "Check-in notification dispatched"
        );
        Ok(())
    }
}

fn urgency(config: &PollingConfig) -> Option<u8> {
    match config.status {
        PollingStatus::Grace1 => Some(1),
        PollingStatus::Grace2 => Some(2),
        PollingStatus::Grace3 => Some(3),
        _ => None,
    }
}

fn render_email(
    user: &User,
    config: &PollingConfig,
    check_in: &CheckIn,
    url: &str,
) -> (String, String, String) {
    let deadline = check_in.expires_at.format("%Y-%m-%d %H:%M UTC");

    let subject = match urgency(config) {
        None => "Time to check in".to_string(),
        Some(1) => "Reminder: please check in".to_string(),
        Some(2) => "Urgent: we haven't heard from you".to_string(),
        Some(_) => "Final notice: confirm you're okay".to_string(),
    };

    let text = format!(
        "Hi {name},\n\n\
         Please confirm you're okay by opening this link before {deadline}:\n\n\
         {url}\n\n\
         If you don't respond, your emergency contacts may eventually be notified.\n",
        name = user.display_name,
    );

    let html = format!(
        "<p>Hi {name},</p>\
         <p>Please confirm you're okay by clicking the button below before <b>{deadline}</b>.</p>\
         <p><a href=\"{url}\">I'm okay</a></p>\
         <p>If you don't respond, your emergency contacts may eventually be notified.</p>",
        name = user.display_name,
    );

    (subject, html, text)
}

fn render_sms(config: &PollingConfig, url: &str, expires_at: DateTime<Utc>) -> String {
    let deadline = expires_at.format("%b %d");
    match urgency(config) {
        None => format!("Check-in time. Confirm by {deadline}: {url}"),
        Some(_) => format!("We haven't heard from you. Please confirm by {deadline}: {url}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PollingInterval;
    use chrono::Duration;

    #[test]
    fn subject_escalates_with_grace_level() {
        let now = Utc::now();
        let user = User::new("u@example.com", "Ada", now);
        let mut config = PollingConfig::new(user.id, PollingInterval::Weekly, now);
        let check_in = CheckIn::new(user.id, "tok", now, now + Duration::days(3));

        let (subject, _, _) = render_email(&user, &config, &check_in, "https://s/x");
        assert_eq!(subject, "Time to check in");

        config.status = PollingStatus::Grace3;
        let (subject, html, text) = render_email(&user, &config, &check_in, "https://s/x");
        assert!(subject.starts_with("Final notice"));
        assert!(html.contains("https://s/x"));
        assert!(text.contains("https://s/x"));
        assert!(text.contains("Ada"));
    }
}
