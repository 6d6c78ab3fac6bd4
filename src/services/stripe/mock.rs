use super::{
    CheckoutSession, CreateBillingPortalSessionRequest, CreateCheckoutSessionRequest,
    StripeService, StripeServiceError, SubscriptionInfo,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Default)]
pub struct MockStripeService {
    pub created_sessions: Arc<Mutex<Vec<CheckoutSession>>>,
    pub last_create_requests: Arc<Mutex<Vec<CreateCheckoutSessionRequest>>>,
    pub created_customers: Arc<Mutex<Vec<(String, String)>>>,
    pub subscriptions: Arc<Mutex<HashMap<String, SubscriptionInfo>>>,
    pub cancel_requests: Arc<Mutex<Vec<(String, bool)>>>,
    pub portal_requests: Arc<Mutex<Vec<CreateBillingPortalSessionRequest>>>,
    pub fail_lookups: Arc<Mutex<bool>>,
}

impl MockStripeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscription(self, id: &str, period_start: i64, period_end: i64) -> Self {
        let sub = SubscriptionInfo {
            id: id.to_string(),
            status: "active".into(),
            customer: None,
            current_period_start: period_start,
            current_period_end: period_end,
            cancel_at: None,
            cancel_at_period_end: false,
        };
        self.subscriptions
            .lock()
            .unwrap()
            .insert(id.to_string(), sub);
        self
    }
}

fn make_id(prefix: &str) -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("{}_{}", prefix, ts)
}

#[async_trait]
impl StripeService for MockStripeService {
    async fn create_checkout_session(
        &self,
        req: CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession, StripeServiceError> {
        self.last_create_requests.lock().unwrap().push(req.clone());

        let session = CheckoutSession {
            id: make_id("cs_test"),
            url: Some("https://example.test/checkout".into()),
        };
        self.created_sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }

    async fn create_customer(
        &self,
        email: &str,
        account_id: &str,
    ) -> Result<String, StripeServiceError> {
        let id = make_id("cus_test");
        self.created_customers
            .lock()
            .unwrap()
            .push((email.to_string(), account_id.to_string()));
        Ok(id)
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionInfo, StripeServiceError> {
        if *self.fail_lookups.lock().unwrap() {
            return Err(StripeServiceError::Api("mock provider unavailable".into()));
        }
        self.subscriptions
            .lock()
            .unwrap()
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| {
                StripeServiceError::NotFound(format!("subscription {} not found", subscription_id))
            })
    }

    async fn set_subscription_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> Result<SubscriptionInfo, StripeServiceError> {
        self.cancel_requests
            .lock()
            .unwrap()
            .push((subscription_id.to_string(), cancel_at_period_end));

        let mut subs = self.subscriptions.lock().unwrap();
        let sub = subs
            .entry(subscription_id.to_string())
            .or_insert_with(|| SubscriptionInfo {
                id: subscription_id.to_string(),
                status: "active".into(),
                customer: None,
                current_period_start: 0,
                current_period_end: 0,
                cancel_at: None,
                cancel_at_period_end: false,
            });
        sub.cancel_at_period_end = cancel_at_period_end;
        if cancel_at_period_end {
            if sub.cancel_at.is_none() && sub.current_period_end > 0 {
                sub.cancel_at = Some(sub.current_period_end);
            }
        } else {
            sub.cancel_at = None;
        }
        Ok(sub.clone())
    }

    async fn create_billing_portal_session(
        &self,
        req: CreateBillingPortalSessionRequest,
    ) -> Result<String, StripeServiceError> {
        let url = format!("https://example.test/portal/{}", make_id("bps_test"));
        self.portal_requests.lock().unwrap().push(req);
        Ok(url)
    }
}
