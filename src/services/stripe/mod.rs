// NOTE: async-stripe is compiled with runtime-tokio-hyper, billing and checkout only.
// Deliveries are verified by `signature`, not the crate's webhook module.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod signature;

#[derive(Debug, thiserror::Error)]
pub enum StripeServiceError {
    #[error("stripe api error: {0}")]
    Api(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("other error: {0}")]
    Other(String),
}

impl From<stripe::StripeError> for StripeServiceError {
    fn from(err: stripe::StripeError) -> Self {
        StripeServiceError::Api(err.to_string())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateCheckoutSessionRequest {
    pub success_url: String,
    pub cancel_url: String,
    pub price: String,
    pub client_reference_id: Option<String>,
    pub customer: Option<String>,
    pub metadata: Option<std::collections::BTreeMap<String, String>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CreateBillingPortalSessionRequest {
    pub customer: String,
    pub return_url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionInfo {
    pub id: String,
    pub status: String,
    pub customer: Option<String>,
    /// Unix timestamp (seconds) when the current period started
    pub current_period_start: i64,
    /// Unix timestamp (seconds) when the current period ends
    pub current_period_end: i64,
    /// Unix timestamp (seconds) when the subscription will cancel, if set
    pub cancel_at: Option<i64>,
    pub cancel_at_period_end: bool,
}

#[async_trait]
pub trait StripeService: Send + Sync {
    async fn create_checkout_session(
        &self,
        req: CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession, StripeServiceError>;

    async fn create_customer(
        &self,
        email: &str,
        account_id: &str,
    ) -> Result<String, StripeServiceError>;

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionInfo, StripeServiceError>;

    async fn set_subscription_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> Result<SubscriptionInfo, StripeServiceError>;

    /// Hosted page where the customer updates cards and invoices. Returns its URL.
    async fn create_billing_portal_session(
        &self,
        req: CreateBillingPortalSessionRequest,
    ) -> Result<String, StripeServiceError>;
}

mod live;
mod mock;

pub use live::LiveStripeService;
pub use mock::MockStripeService;
