//! Outbound transports — pluggable email and SMS delivery.
//!
//! Transports are fire-and-forget from the core's perspective: the `email`
//! and `sms` queues own retries and dead-lettering, so a transport just
//! reports success or a retriable error.

pub mod sms;
pub mod smtp;

use async_trait::async_trait;

use crate::error::TransportError;

pub use sms::WebhookSmsTransport;
pub use smtp::SmtpEmailTransport;

/// A rendered outbound email.
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// A rendered outbound SMS.
#[derive(Debug, Clone)]
pub struct OutboundSms {
    pub to: String,
    pub message: String,
}

/// Email delivery.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<(), TransportError>;
}

/// SMS delivery.
#[async_trait]
pub trait SmsTransport: Send + Sync {
    async fn send(&self, sms: &OutboundSms) -> Result<(), TransportError>;
}

/// Development fallback used when no real transport is configured: logs the
/// message and reports success so local runs don't dead-letter every job.
pub struct LogOnlyTransport;

#[async_trait]
impl EmailTransport for LogOnlyTransport {
    async fn send(&self, email: &OutboundEmail) -> Result<(), TransportError> {
        if email.to.is_empty() {
            return Err(TransportError::NoRecipient { channel: "email" });
        }
        tracing::info!(to = %email.to, subject = %email.subject, "Email (log-only transport)");
        Ok(())
    }
}

#[async_trait]
impl SmsTransport for LogOnlyTransport {
    async fn send(&self, sms: &OutboundSms) -> Result<(), TransportError> {
        if sms.to.is_empty() {
            return Err(TransportError::NoRecipient { channel: "sms" });
        }
        tracing::info!(to = %sms.to, "SMS (log-only transport)");
        Ok(())
    }
}
