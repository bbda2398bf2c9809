//! SMTP Transport Service

use std::time::Duration;

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::transport::{SendReceipt, Transport, TransportError};
use crate::models::{EmailAddress, OutboundMessage};

/// SMTP transport error
#[derive(Debug, thiserror::Error)]
pub enum SmtpError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Send error: {0}")]
    Send(String),
    #[error("Invalid email: {0}")]
    InvalidEmail(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<SmtpError> for TransportError {
    fn from(err: SmtpError) -> Self {
        match err {
            SmtpError::Connection(e) => Self::Connection(e),
            SmtpError::Send(e) => Self::Rejected(e),
            SmtpError::InvalidEmail(e) => Self::InvalidMessage(e),
            SmtpError::Configuration(e) => Self::NotConfigured(e),
        }
    }
}

/// SMTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// SMTP host
    pub host: String,
    /// SMTP port
    pub port: u16,
    /// Username
    pub username: Option<String>,
    /// Password
    pub password: Option<String>,
    /// Use TLS
    pub tls: TlsMode,
    /// Connection timeout
    pub timeout_secs: u64,
    /// Domain used for Message-ID headers; defaults to the sender's domain
    pub message_id_domain: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// No TLS
    None,
    /// STARTTLS (upgrade connection)
    StartTls,
    /// TLS from start (implicit)
    Tls,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 25,
            username: None,
            password: None,
            tls: TlsMode::StartTls,
            timeout_secs: 30,
            message_id_domain: None,
        }
    }
}

impl SmtpConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn with_tls(mut self, mode: TlsMode) -> Self {
        self.tls = mode;
        self
    }

    pub fn with_message_id_domain(mut self, domain: &str) -> Self {
        self.message_id_domain = Some(domain.to_string());
        self
    }

    /// Common configurations
    pub fn gmail(username: &str, password: &str) -> Self {
        Self::new("smtp.gmail.com", 587)
            .with_credentials(username, password)
            .with_tls(TlsMode::StartTls)
    }

    pub fn outlook(username: &str, password: &str) -> Self {
        Self::new("smtp.office365.com", 587)
            .with_credentials(username, password)
            .with_tls(TlsMode::StartTls)
    }

    /// SendGrid relay; its event webhook posts back the message token
    pub fn sendgrid(api_key: &str) -> Self {
        Self::new("smtp.sendgrid.net", 587)
            .with_credentials("apikey", api_key)
            .with_tls(TlsMode::StartTls)
    }

    pub fn ses(username: &str, password: &str, region: &str) -> Self {
        Self::new(&format!("email-smtp.{}.amazonaws.com", region), 587)
            .with_credentials(username, password)
            .with_tls(TlsMode::StartTls)
    }
}

fn mailbox(address: &EmailAddress) -> Result<Mailbox, SmtpError> {
    address
        .formatted()
        .parse()
        .map_err(|e: lettre::address::AddressError| SmtpError::InvalidEmail(e.to_string()))
}

/// Build the lettre message. The Message-ID carries the message token so
/// provider callbacks and reply headers can be correlated.
pub fn build_message(message: &OutboundMessage, message_id_domain: Option<&str>) -> Result<Message, SmtpError> {
    let domain = message_id_domain
        .map(str::to_string)
        .or_else(|| message.from.parts().map(|(_, domain)| domain.to_string()))
        .ok_or_else(|| SmtpError::InvalidEmail(format!("No domain in sender {}", message.from.email)))?;

    Message::builder()
        .from(mailbox(&message.from)?)
        .to(mailbox(&message.to)?)
        .subject(message.subject.as_str())
        .message_id(Some(message.message_id(&domain)))
        .header(ContentType::TEXT_HTML)
        .body(message.html.clone())
        .map_err(|e| SmtpError::InvalidEmail(e.to_string()))
}

/// SMTP transport service
pub struct SmtpTransport {
    config: SmtpConfig,
    transport: RwLock<Option<AsyncSmtpTransport<Tokio1Executor>>>,
}

impl SmtpTransport {
    pub fn new(config: SmtpConfig) -> Self {
        Self {
            config,
            transport: RwLock::new(None),
        }
    }

    /// Connect to SMTP server
    pub async fn connect(&self) -> Result<(), SmtpError> {
        let builder = match self.config.tls {
            TlsMode::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.config.host),
            TlsMode::StartTls => {
                let tls = TlsParameters::builder(self.config.host.clone())
                    .build()
                    .map_err(|e| SmtpError::Configuration(e.to_string()))?;

                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.host)
                    .map_err(|e| SmtpError::Connection(e.to_string()))?
                    .tls(Tls::Required(tls))
            }
            TlsMode::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&self.config.host)
                .map_err(|e| SmtpError::Connection(e.to_string()))?,
        };

        let mut builder = builder
            .port(self.config.port)
            .timeout(Some(Duration::from_secs(self.config.timeout_secs)));

        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        let transport = builder.build();

        transport
            .test_connection()
            .await
            .map_err(|e| SmtpError::Connection(e.to_string()))?;

        tracing::info!(host = %self.config.host, port = self.config.port, "SMTP transport connected");
        *self.transport.write().await = Some(transport);
        Ok(())
    }

    /// Send one message and return the Message-ID it was sent with
    pub async fn send_message(&self, message: &OutboundMessage) -> Result<String, SmtpError> {
        let guard = self.transport.read().await;
        let transport = guard
            .as_ref()
            .ok_or_else(|| SmtpError::Connection("Not connected".to_string()))?;

        let email = build_message(message, self.config.message_id_domain.as_deref())?;

        let response = transport
            .send(email)
            .await
            .map_err(|e| SmtpError::Send(e.to_string()))?;

        if !response.is_positive() {
            return Err(SmtpError::Send(response.message().collect::<Vec<&str>>().join(" ")));
        }

        Ok(message.message_token.clone())
    }

    /// Test connection
    pub async fn test_connection(&self) -> Result<bool, SmtpError> {
        let guard = self.transport.read().await;
        let transport = guard
            .as_ref()
            .ok_or_else(|| SmtpError::Connection("Not connected".to_string()))?;

        transport
            .test_connection()
            .await
            .map_err(|e| SmtpError::Connection(e.to_string()))
    }

    /// Get configuration
    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    /// Check if connected
    pub async fn is_connected(&self) -> bool {
        self.transport.read().await.is_some()
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, TransportError> {
        let message_id = self.send_message(message).await?;
        Ok(SendReceipt { message_id })
    }

    fn name(&self) -> &str {
        "smtp"
    }
}
