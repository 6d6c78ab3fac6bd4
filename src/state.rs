use std::sync::Arc;

use crate::config::Config;
use crate::db::{
    account_repository::AccountRepository,
    subscription_history_repository::SubscriptionHistoryRepository,
    webhook_event_repository::WebhookEventRepository,
};
use crate::services::{
    abuse::AbuseDetector,
    billing_webhooks::{WebhookProcessor, WebhookSettings},
    smtp_mailer::Mailer,
    stripe::StripeService,
};
use crate::utils::jwt::{JwtKeyProvider, JwtKeys};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn AccountRepository>,
    pub webhook_events: Arc<dyn WebhookEventRepository>,
    pub stripe: Arc<dyn StripeService>,
    pub mailer: Arc<dyn Mailer>,
    pub webhooks: Arc<WebhookProcessor>,
    pub abuse: Arc<AbuseDetector>,
    pub config: Arc<Config>,
    pub jwt_keys: Arc<JwtKeys>,
}

impl AppState {
    /// Wires the webhook processor and abuse detector over the given stores.
    pub fn assemble(
        config: Config,
        jwt_keys: JwtKeys,
        db: Arc<dyn AccountRepository>,
        webhook_events: Arc<dyn WebhookEventRepository>,
        history: Arc<dyn SubscriptionHistoryRepository>,
        stripe: Arc<dyn StripeService>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let webhooks = WebhookProcessor::new(
            db.clone(),
            webhook_events.clone(),
            stripe.clone(),
            mailer.clone(),
            WebhookSettings {
                signing_secret: config.stripe.webhook_secret.clone(),
                tolerance_secs: config.webhook_tolerance_secs,
                stale_processing_after: chrono::Duration::seconds(
                    config.webhook_stale_processing_secs,
                ),
            },
        );
        let abuse = AbuseDetector::new(db.clone(), history, config.abuse.clone());

        AppState {
            db,
            webhook_events,
            stripe,
            mailer,
            webhooks: Arc::new(webhooks),
            abuse: Arc::new(abuse),
            config: Arc::new(config),
            jwt_keys: Arc::new(jwt_keys),
        }
    }
}

impl JwtKeyProvider for AppState {
    fn jwt_keys(&self) -> &JwtKeys {
        self.jwt_keys.as_ref()
    }

    fn jwt_issuer(&self) -> &str {
        &self.config.jwt_issuer
    }

    fn jwt_audience(&self) -> &str {
        &self.config.jwt_audience
    }
}
