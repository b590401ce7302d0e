//! SMTP email transport via lettre.

use async_trait::async_trait;
use lettre::message::{MultiPart, SinglePart, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};

use crate::error::TransportError;
use crate::transport::{EmailTransport, OutboundEmail};

/// SMTP configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    /// Build config from environment variables.
    /// Returns `None` if `SMTP_HOST` is not set (transport disabled).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("SMTP_HOST").ok()?;

        let port: u16 = std::env::var("SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("SMTP_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("SMTP_PASSWORD").unwrap_or_default());
        let from_address = std::env::var("SMTP_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            host,
            port,
            username,
            password,
            from_address,
        })
    }
}

/// Email transport over SMTP. lettre's `SmtpTransport` is blocking, so sends
/// run on the blocking pool.
pub struct SmtpEmailTransport {
    config: SmtpConfig,
}

impl SmtpEmailTransport {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn send_blocking(config: &SmtpConfig, email: &OutboundEmail) -> Result<(), TransportError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&config.host)
            .map_err(|e| TransportError::SendFailed {
                channel: "email",
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(config.port)
            .credentials(creds)
            .build();

        let message = Message::builder()
            .from(config.from_address.parse().map_err(|e| {
                TransportError::SendFailed {
                    channel: "email",
                    reason: format!("Invalid from address: {e}"),
                }
            })?)
            .to(email.to.parse().map_err(|e| TransportError::SendFailed {
                channel: "email",
                reason: format!("Invalid to address: {e}"),
            })?)
            .subject(&email.subject)
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(email.text.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(email.html.clone()),
                    ),
            )
            .map_err(|e| TransportError::SendFailed {
                channel: "email",
                reason: format!("Failed to build message: {e}"),
            })?;

        transport
            .send(&message)
            .map_err(|e| TransportError::SendFailed {
                channel: "email",
                reason: e.to_string(),
            })?;

        Ok(())
    }
}

#[async_trait]
impl EmailTransport for SmtpEmailTransport {
    async fn send(&self, email: &OutboundEmail) -> Result<(), TransportError> {
        if email.to.is_empty() {
            return Err(TransportError::NoRecipient { channel: "email" });
        }

        let config = self.config.clone();
        let email = email.clone();

        tokio::task::spawn_blocking(move || Self::send_blocking(&config, &email))
            .await
            .map_err(|e| TransportError::SendFailed {
                channel: "email",
                reason: format!("send task panicked: {e}"),
            })?
    }
}
