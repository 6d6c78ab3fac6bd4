use async_trait::async_trait;
use lettre::address::AddressError;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Error: {0}")]
    Other(String),
    #[error("Invalid Address: {0}")]
    InvalidEmailAddress(String),
    #[error("Send error: {0}")]
    SendError(String),
}

impl From<lettre::transport::smtp::Error> for MailError {
    fn from(err: lettre::transport::smtp::Error) -> Self {
        MailError::SendError(err.to_string())
    }
}

impl From<lettre::error::Error> for MailError {
    fn from(err: lettre::error::Error) -> Self {
        MailError::SendError(err.to_string())
    }
}

impl From<AddressError> for MailError {
    fn from(e: AddressError) -> Self {
        MailError::InvalidEmailAddress(e.to_string())
    }
}

/// Outbound account notifications. Plain text only.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_subscription_welcome_email(&self, to: &str) -> Result<(), MailError>;
    async fn send_payment_failed_email(&self, to: &str) -> Result<(), MailError>;
    async fn send_trial_ending_email(&self, to: &str, days_left: i64) -> Result<(), MailError>;
    async fn send_email_generic(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), MailError>;
}

mod mock_mailer;
mod smtp_impl;

pub use mock_mailer::MockMailer;
pub use smtp_impl::SmtpMailer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub tls_disabled: bool,
}

/// Used when no SMTP relay is configured. Every message is logged and dropped.
#[derive(Debug, Default)]
pub struct DisabledMailer;

#[async_trait]
impl Mailer for DisabledMailer {
    async fn send_subscription_welcome_email(&self, to: &str) -> Result<(), MailError> {
        self.send_email_generic(to, "welcome", "").await
    }

    async fn send_payment_failed_email(&self, to: &str) -> Result<(), MailError> {
        self.send_email_generic(to, "payment failed", "").await
    }

    async fn send_trial_ending_email(&self, to: &str, _days_left: i64) -> Result<(), MailError> {
        self.send_email_generic(to, "trial ending", "").await
    }

    async fn send_email_generic(
        &self,
        to: &str,
        subject: &str,
        _body: &str,
    ) -> Result<(), MailError> {
        info!(%to, %subject, "mail delivery disabled; dropping message");
        Ok(())
    }
}

pub(crate) fn trial_ending_body(days_left: i64, frontend_origin: &str) -> (String, String) {
    let subject = match days_left {
        0 => "Your trial ends today".to_string(),
        1 => "Your trial ends tomorrow".to_string(),
        n => format!("Your trial ends in {} days", n),
    };
    let body = format!(
        "{}.\n\nChoose a plan to keep access:\n{}/pricing",
        subject, frontend_origin
    );
    (subject, body)
}
