//! SMS transport — JSON POST to a configurable gateway webhook.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::error::TransportError;
use crate::transport::{OutboundSms, SmsTransport};

/// SMS gateway configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub webhook_url: String,
    pub auth_token: Option<SecretString>,
    pub from_number: Option<String>,
}

impl SmsConfig {
    /// Build config from environment variables.
    /// Returns `None` if `SMS_WEBHOOK_URL` is not set (transport disabled).
    pub fn from_env() -> Option<Self> {
        let webhook_url = std::env::var("SMS_WEBHOOK_URL").ok()?;
        let auth_token = std::env::var("SMS_AUTH_TOKEN").ok().map(SecretString::from);
        let from_number = std::env::var("SMS_FROM_NUMBER").ok();

        Some(Self {
            webhook_url,
            auth_token,
            from_number,
        })
    }
}

/// SMS transport that hands messages to an HTTP gateway.
pub struct WebhookSmsTransport {
    config: SmsConfig,
    client: reqwest::Client,
}

impl WebhookSmsTransport {
    pub fn new(config: SmsConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SmsTransport for WebhookSmsTransport {
    async fn send(&self, sms: &OutboundSms) -> Result<(), TransportError> {
        if sms.to.is_empty() {
            return Err(TransportError::NoRecipient { channel: "sms" });
        }

        let body = serde_json::json!({
            "to": sms.to,
            "from": self.config.from_number,
            "message": sms.message,
        });

        let mut request = self.client.post(&self.config.webhook_url).json(&body);
        if let Some(ref token) = self.config.auth_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::SendFailed {
                channel: "sms",
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(TransportError::SendFailed {
                channel: "sms",
                reason: format!("gateway returned {status}: {detail}"),
            });
        }

        Ok(())
    }
}
