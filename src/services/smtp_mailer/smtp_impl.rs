use async_trait::async_trait;
use lettre::{
    address::AddressError,
    message::Mailbox,
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::sync::Arc;

use crate::services::smtp_mailer::{trial_ending_body, Mailer, SmtpSettings};

use super::MailError;

#[derive(Clone)]
pub struct SmtpMailer {
    transport: Arc<AsyncSmtpTransport<Tokio1Executor>>,
    sender: Mailbox,
    frontend_origin: String,
}

impl SmtpMailer {
    pub fn new(settings: &SmtpSettings, frontend_origin: &str) -> Result<Self, MailError> {
        let sender: Mailbox = settings.from.parse()?;

        let transport = if settings.tls_disabled {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
                .port(settings.port)
                .build()
        } else {
            let tls = TlsParameters::new(settings.host.clone())?;
            let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)?
                .port(settings.port)
                .tls(Tls::Required(tls));
            if let (Some(username), Some(password)) =
                (settings.username.as_ref(), settings.password.as_ref())
            {
                builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
            }
            builder.build()
        };

        Ok(Self {
            transport: Arc::new(transport),
            sender,
            frontend_origin: frontend_origin.trim_end_matches('/').to_string(),
        })
    }

    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        let email = Message::builder()
            .from(self.sender.clone())
            .to(to
                .parse()
                .map_err(|e: AddressError| MailError::InvalidEmailAddress(e.to_string()))?)
            .subject(subject)
            .body(body.to_string())?;

        self.transport
            .send(email)
            .await
            .map(|_| ())
            .map_err(|e| e.into())
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_subscription_welcome_email(&self, to: &str) -> Result<(), MailError> {
        let body = format!(
            "Thanks for subscribing! Your account now has full access.\n\nManage billing here:\n{}/settings/billing",
            self.frontend_origin
        );
        self.send_email(to, "Your subscription is active", &body).await
    }

    async fn send_payment_failed_email(&self, to: &str) -> Result<(), MailError> {
        let body = format!(
            "We could not process your latest payment. Your access continues while the payment is retried.\n\nUpdate your payment method here:\n{}/settings/billing",
            self.frontend_origin
        );
        self.send_email(to, "Payment failed", &body).await
    }

    async fn send_trial_ending_email(&self, to: &str, days_left: i64) -> Result<(), MailError> {
        let (subject, body) = trial_ending_body(days_left, &self.frontend_origin);
        self.send_email(to, &subject, &body).await
    }

    async fn send_email_generic(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), MailError> {
        self.send_email(to, subject, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_settings() -> SmtpSettings {
        SmtpSettings {
            host: "smtp.example.com".to_string(),
            port: 587,
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            from: "billing@example.com".to_string(),
            tls_disabled: false,
        }
    }

    #[tokio::test]
    async fn builds_tls_transport() {
        assert!(SmtpMailer::new(&base_settings(), "https://app.test/").is_ok());
    }

    #[tokio::test]
    async fn rejects_invalid_sender() {
        let mut settings = base_settings();
        settings.from = "not an address".to_string();
        assert!(matches!(
            SmtpMailer::new(&settings, "https://app.test"),
            Err(MailError::InvalidEmailAddress(_))
        ));
    }
}
