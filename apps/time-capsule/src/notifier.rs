use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use maud::{DOCTYPE, html};
use serde::Serialize;

#[cfg(test)]
pub use recording::{RecordingNotifier, SentMessage};

pub const OPEN_NOTIFICATION_SUBJECT: &str = "Time Capsule Opened!";
pub const DEFAULT_MAIL_RELAY_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SMTP_PORT: u16 = 587;

#[derive(Debug, thiserror::Error)]
pub enum NotifierError {
    #[error("no recipients")]
    NoRecipients,
    #[error("invalid mail address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("mail transport setup failed: {0}")]
    Setup(String),
    #[error("mail transport failed: {0}")]
    Transport(String),
    #[error("mail relay rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Outbound email transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        subject: &str,
        html_body: &str,
        recipients: &[String],
    ) -> Result<(), NotifierError>;

    fn driver_name(&self) -> &'static str;
}

#[derive(Clone, Debug)]
pub struct MailRelayConfig {
    pub url: String,
    pub auth_token: Option<String>,
    pub from: String,
    pub timeout_ms: u64,
}

#[derive(Serialize)]
struct RelayMessage<'a> {
    from: &'a str,
    to: &'a [String],
    subject: &'a str,
    html: &'a str,
}

/// Posts messages as JSON to an HTTP mail relay.
pub struct HttpMailNotifier {
    client: reqwest::Client,
    config: MailRelayConfig,
}

impl HttpMailNotifier {
    pub fn new(config: MailRelayConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl Notifier for HttpMailNotifier {
    async fn send(
        &self,
        subject: &str,
        html_body: &str,
        recipients: &[String],
    ) -> Result<(), NotifierError> {
        if recipients.is_empty() {
            return Err(NotifierError::NoRecipients);
        }
        let mut request = self
            .client
            .post(self.config.url.as_str())
            .timeout(Duration::from_millis(self.config.timeout_ms.max(1)))
            .json(&RelayMessage {
                from: &self.config.from,
                to: recipients,
                subject,
                html: html_body,
            });
        if let Some(token) = self.config.auth_token.as_deref() {
            request = request.header("authorization", format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|error| NotifierError::Transport(error.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(NotifierError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    fn driver_name(&self) -> &'static str {
        "http"
    }
}

/// How the SMTP connection is secured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmtpTls {
    /// Plain connection upgraded with STARTTLS (submission port 587).
    StartTls,
    /// TLS from the first byte (port 465).
    Implicit,
    /// No encryption. Local mail catchers only.
    None,
}

impl SmtpTls {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartTls => "starttls",
            Self::Implicit => "tls",
            Self::None => "none",
        }
    }
}

#[derive(Clone, Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: SmtpTls,
    pub from: String,
    pub timeout_ms: u64,
}

/// Delivers HTML messages through an SMTP server.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpNotifier {
    pub fn new(config: SmtpConfig) -> Result<Self, NotifierError> {
        let builder = match config.tls {
            SmtpTls::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|error| NotifierError::Setup(error.to_string()))?,
            SmtpTls::Implicit => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|error| NotifierError::Setup(error.to_string()))?,
            SmtpTls::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host),
        };
        let mut builder = builder
            .port(config.port)
            .timeout(Some(Duration::from_millis(config.timeout_ms.max(1))));
        if let (Some(username), Some(password)) = (config.username, config.password) {
            builder = builder.credentials(Credentials::new(username, password));
        }
        Ok(Self {
            transport: builder.build(),
            from: parse_mailbox(&config.from)?,
        })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(
        &self,
        subject: &str,
        html_body: &str,
        recipients: &[String],
    ) -> Result<(), NotifierError> {
        if recipients.is_empty() {
            return Err(NotifierError::NoRecipients);
        }
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(subject)
            .header(ContentType::TEXT_HTML);
        for recipient in recipients {
            builder = builder.to(parse_mailbox(recipient)?);
        }
        let message = builder
            .body(html_body.to_string())
            .map_err(|error| NotifierError::Setup(error.to_string()))?;

        self.transport
            .send(message)
            .await
            .map_err(|error| NotifierError::Transport(error.to_string()))?;
        Ok(())
    }

    fn driver_name(&self) -> &'static str {
        "smtp"
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, NotifierError> {
    address
        .parse::<Mailbox>()
        .map_err(|error| NotifierError::InvalidAddress {
            address: address.to_string(),
            reason: error.to_string(),
        })
}

/// Writes messages to the log instead of delivering them. Used when no mail
/// transport is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        subject: &str,
        html_body: &str,
        recipients: &[String],
    ) -> Result<(), NotifierError> {
        if recipients.is_empty() {
            return Err(NotifierError::NoRecipients);
        }
        tracing::info!(
            subject,
            recipients = %recipients.join(","),
            body_bytes = html_body.len(),
            "notification logged (no mail transport configured)"
        );
        Ok(())
    }

    fn driver_name(&self) -> &'static str {
        "log"
    }
}

const PARAGRAPH_STYLE: &str = "color: #333333; font-size: 18px; line-height: 1.5;";

pub fn render_open_notification(username: &str) -> String {
    let markup = html! {
        (DOCTYPE)
        html {
            body style="font-family: Arial, sans-serif; background-color: #f7f7f7; margin: 0; padding: 0;" {
                table align="center" border="0" cellpadding="0" cellspacing="0" width="100%"
                    style="max-width: 600px; margin: 20px auto; border-collapse: collapse;" {
                    tr {
                        td style="background-color: #000000; padding: 40px 20px; text-align: center;" {
                            h1 style="color: #ffffff; font-size: 28px;" { "Your time capsule is open" }
                        }
                    }
                    tr {
                        td style="background-color: #ffffff; padding: 40px;" {
                            p style=(PARAGRAPH_STYLE) { "Hi " (username) "," }
                            p style=(PARAGRAPH_STYLE) {
                                "The opening time you chose has arrived. Sign in to read the message and see the pictures you sealed away."
                            }
                        }
                    }
                }
            }
        }
    };
    markup.into_string()
}

#[cfg(test)]
mod recording {
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::{Notifier, NotifierError};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SentMessage {
        pub subject: String,
        pub html_body: String,
        pub recipients: Vec<String>,
    }

    /// Records every message; can be told to fail the next N sends.
    #[derive(Default)]
    pub struct RecordingNotifier {
        sent: Mutex<Vec<SentMessage>>,
        failures_remaining: Mutex<usize>,
    }

    impl RecordingNotifier {
        pub fn shared() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub async fn fail_next(&self, count: usize) {
            *self.failures_remaining.lock().await = count;
        }

        pub async fn sent(&self) -> Vec<SentMessage> {
            self.sent.lock().await.clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(
            &self,
            subject: &str,
            html_body: &str,
            recipients: &[String],
        ) -> Result<(), NotifierError> {
            {
                let mut failures = self.failures_remaining.lock().await;
                if *failures > 0 {
                    *failures -= 1;
                    return Err(NotifierError::Transport("injected failure".to_string()));
                }
            }
            self.sent.lock().await.push(SentMessage {
                subject: subject.to_string(),
                html_body: html_body.to_string(),
                recipients: recipients.to_vec(),
            });
            Ok(())
        }

        fn driver_name(&self) -> &'static str {
            "recording"
        }
    }
}
