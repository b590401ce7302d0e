//! Notification worker — drains the `email` and `sms` queues into transports.

use std::sync::Arc;

use crate::error::Result;
use crate::transport::{EmailTransport, OutboundEmail, OutboundSms, SmsTransport};

pub struct NotifyWorker {
    email: Arc<dyn EmailTransport>,
    sms: Arc<dyn SmsTransport>,
}

impl NotifyWorker {
    pub fn new(email: Arc<dyn EmailTransport>, sms: Arc<dyn SmsTransport>) -> Self {
        Self { email, sms }
    }

    pub async fn handle_email(
        &self,
        to: &str,
        subject: &str,
        html: &str,
        text: &str,
    ) -> Result<()> {
        let message = OutboundEmail {
            to: to.to_string(),
            subject: subject.to_string(),
            html: html.to_string(),
            text: text.to_string(),
        };
        self.email.send(&message).await?;
        Ok(())
    }

    pub async fn handle_sms(&self, to: &str, message: &str) -> Result<()> {
        let message = OutboundSms {
            to: to.to_string(),
            message: message.to_string(),
        };
        self.sms.send(&message).await?;
        Ok(())
    }
}
