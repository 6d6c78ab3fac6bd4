use super::{
    CheckoutSession, CreateBillingPortalSessionRequest, CreateCheckoutSessionRequest,
    StripeService, StripeServiceError, SubscriptionInfo,
};
use async_trait::async_trait;

pub struct LiveStripeService {
    client: stripe::Client,
}

impl LiveStripeService {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            client: stripe::Client::new(secret_key),
        }
    }

    pub fn from_settings(settings: &crate::config::StripeSettings) -> Self {
        Self::new(settings.secret_key.clone())
    }
}

fn subscription_info(sub: &stripe::Subscription) -> SubscriptionInfo {
    SubscriptionInfo {
        id: sub.id.to_string(),
        status: sub.status.to_string(),
        customer: Some(sub.customer.id().to_string()),
        current_period_start: sub.current_period_start,
        current_period_end: sub.current_period_end,
        cancel_at: sub.cancel_at,
        cancel_at_period_end: sub.cancel_at_period_end,
    }
}

fn parse_customer_id(id: &str) -> Result<stripe::CustomerId, StripeServiceError> {
    id.parse::<stripe::CustomerId>()
        .map_err(|e| StripeServiceError::Other(e.to_string()))
}

fn parse_subscription_id(id: &str) -> Result<stripe::SubscriptionId, StripeServiceError> {
    id.parse::<stripe::SubscriptionId>()
        .map_err(|e| StripeServiceError::Other(e.to_string()))
}

#[async_trait]
impl StripeService for LiveStripeService {
    async fn create_checkout_session(
        &self,
        req: CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession, StripeServiceError> {
        let mut params = stripe::CreateCheckoutSession::new();
        params.mode = Some(stripe::CheckoutSessionMode::Subscription);
        params.success_url = Some(&req.success_url);
        params.cancel_url = Some(&req.cancel_url);
        if let Some(ref id) = req.client_reference_id {
            params.client_reference_id = Some(id);
        }
        if let Some(ref customer) = req.customer {
            params.customer = Some(parse_customer_id(customer)?);
        }
        if let Some(ref meta) = req.metadata {
            params.metadata = Some(meta.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
        }
        params.line_items = Some(vec![stripe::CreateCheckoutSessionLineItems {
            price: Some(req.price.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);

        let session = stripe::CheckoutSession::create(&self.client, params).await?;
        Ok(CheckoutSession {
            id: session.id.to_string(),
            url: session.url.clone(),
        })
    }

    async fn create_customer(
        &self,
        email: &str,
        account_id: &str,
    ) -> Result<String, StripeServiceError> {
        let mut params = stripe::CreateCustomer::new();
        params.email = Some(email);
        params.metadata = Some(
            [("account_id".to_string(), account_id.to_string())]
                .into_iter()
                .collect(),
        );
        let customer = stripe::Customer::create(&self.client, params).await?;
        Ok(customer.id.to_string())
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionInfo, StripeServiceError> {
        let sub_id = parse_subscription_id(subscription_id)?;
        let sub = stripe::Subscription::retrieve(&self.client, &sub_id, &[]).await?;
        Ok(subscription_info(&sub))
    }

    async fn set_subscription_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> Result<SubscriptionInfo, StripeServiceError> {
        let sub_id = parse_subscription_id(subscription_id)?;
        let mut params = stripe::UpdateSubscription::new();
        params.cancel_at_period_end = Some(cancel_at_period_end);
        let sub = stripe::Subscription::update(&self.client, &sub_id, params).await?;
        Ok(subscription_info(&sub))
    }

    async fn create_billing_portal_session(
        &self,
        req: CreateBillingPortalSessionRequest,
    ) -> Result<String, StripeServiceError> {
        let mut params = stripe::CreateBillingPortalSession::new(parse_customer_id(&req.customer)?);
        params.return_url = Some(&req.return_url);
        let session = stripe::BillingPortalSession::create(&self.client, params).await?;
        Ok(session.url)
    }
}
