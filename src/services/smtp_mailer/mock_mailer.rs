use crate::services::smtp_mailer::{MailError, Mailer};
use async_trait::async_trait;
use std::sync::Mutex;

/// A mock mailer that records sent emails for testing purposes.
#[derive(Debug, Default)]
pub struct MockMailer {
    pub sent_welcome_emails: Mutex<Vec<String>>,
    pub sent_payment_failed_emails: Mutex<Vec<String>>,
    pub sent_trial_ending_emails: Mutex<Vec<(String, i64)>>,
    pub sent_generic_emails: Mutex<Vec<(String, String)>>,
    pub fail_send: bool,
}

impl MockMailer {
    fn fail(&self) -> Result<(), MailError> {
        if self.fail_send {
            Err(MailError::Other("mock fail".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Mailer for MockMailer {
    async fn send_subscription_welcome_email(&self, to: &str) -> Result<(), MailError> {
        self.sent_welcome_emails.lock().unwrap().push(to.to_string());
        self.fail()
    }

    async fn send_payment_failed_email(&self, to: &str) -> Result<(), MailError> {
        self.sent_payment_failed_emails
            .lock()
            .unwrap()
            .push(to.to_string());
        self.fail()
    }

    async fn send_trial_ending_email(&self, to: &str, days_left: i64) -> Result<(), MailError> {
        self.sent_trial_ending_emails
            .lock()
            .unwrap()
            .push((to.to_string(), days_left));
        self.fail()
    }

    async fn send_email_generic(
        &self,
        to: &str,
        subject: &str,
        _body: &str,
    ) -> Result<(), MailError> {
        self.sent_generic_emails
            .lock()
            .unwrap()
            .push((to.to_string(), subject.to_string()));
        self.fail()
    }
}
