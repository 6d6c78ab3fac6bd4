pub mod abuse;
pub mod billing_webhooks;
pub mod smtp_mailer;
pub mod stripe;
