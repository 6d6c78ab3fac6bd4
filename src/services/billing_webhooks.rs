//! Billing-provider webhook processing.
//!
//! Every delivery goes through the same pipeline: signature check, envelope
//! parse, ledger claim, dispatch, ledger completion. Only the holder of a
//! ledger claim may mutate the account, so duplicate and concurrent
//! deliveries apply their transition at most once.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    db::{account_repository::AccountRepository, webhook_event_repository::WebhookEventRepository},
    models::{
        account::{Account, BillingUpdate, SubscriptionStatus},
        webhook_event::ClaimOutcome,
    },
    services::{
        smtp_mailer::Mailer,
        stripe::{
            signature::{verify_signature, SignatureError},
            StripeService, StripeServiceError,
        },
    },
    utils::time::{from_unix, parse_timestamp},
};

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub signing_secret: String,
    pub tolerance_secs: i64,
    /// A `processing` ledger entry older than this is treated as abandoned.
    pub stale_processing_after: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventOutcome {
    Applied,
    /// Side effects only (notifications); the account is unchanged.
    Notified,
    Ignored { reason: String },
}

impl EventOutcome {
    fn ignored(reason: impl Into<String>) -> Self {
        EventOutcome::Ignored {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Duplicate,
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InvalidSignature,
    MalformedPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ProcessingResult {
    Processed {
        event_id: String,
        event_type: String,
        outcome: EventOutcome,
    },
    Skipped {
        event_id: String,
        reason: SkipReason,
    },
    Rejected {
        reason: RejectReason,
    },
    RetryableError {
        event_id: Option<String>,
        message: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("no account matches {0}")]
    AccountNotFound(String),
    #[error("event is missing {0}")]
    MissingField(&'static str),
    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),
    #[error("billing provider error: {0}")]
    Provider(#[from] StripeServiceError),
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created: Option<Value>,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: Value,
}

#[derive(Debug)]
struct BillingEvent {
    id: String,
    event_type: String,
    created: Option<DateTime<Utc>>,
    object: Value,
}

// Small helper: nested json lookup
fn jget<'a>(val: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = val;
    for key in path {
        cur = cur.get(*key)?;
    }
    Some(cur)
}

fn extract_str<'a>(val: &'a Value, path: &[&str]) -> Option<&'a str> {
    jget(val, path)?.as_str().filter(|s| !s.is_empty())
}

fn extract_i64(val: &Value, path: &[&str]) -> Option<i64> {
    jget(val, path)?.as_i64()
}

fn extract_bool(val: &Value, path: &[&str]) -> Option<bool> {
    jget(val, path)?.as_bool()
}

/// Unix seconds from the provider, or an ISO-8601 string from other senders.
fn to_time(val: &Value) -> Option<DateTime<Utc>> {
    match val {
        Value::Number(n) => n.as_i64().and_then(from_unix),
        Value::String(s) => parse_timestamp(s),
        _ => None,
    }
}

fn extract_time(val: &Value, path: &[&str]) -> Option<DateTime<Utc>> {
    jget(val, path).and_then(to_time)
}

/// Reference fields arrive either as a bare id or as an expanded object.
fn extract_ref(val: &Value, key: &str) -> Option<String> {
    match val.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(obj) => obj.get("id")?.as_str().map(str::to_string),
        _ => None,
    }
}

/// Provider subscription status to the account tag. `None` leaves the
/// account status alone.
pub fn map_provider_status(status: &str, cancel_at_period_end: bool) -> Option<SubscriptionStatus> {
    match status {
        "active" | "trialing" | "past_due" if cancel_at_period_end => {
            Some(SubscriptionStatus::Canceled)
        }
        "active" | "trialing" | "past_due" => Some(SubscriptionStatus::Active),
        "canceled" | "unpaid" | "incomplete_expired" => Some(SubscriptionStatus::Canceled),
        _ => None,
    }
}

pub struct WebhookProcessor {
    accounts: Arc<dyn AccountRepository>,
    ledger: Arc<dyn WebhookEventRepository>,
    stripe: Arc<dyn StripeService>,
    mailer: Arc<dyn Mailer>,
    settings: WebhookSettings,
}

impl WebhookProcessor {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        ledger: Arc<dyn WebhookEventRepository>,
        stripe: Arc<dyn StripeService>,
        mailer: Arc<dyn Mailer>,
        settings: WebhookSettings,
    ) -> Self {
        Self {
            accounts,
            ledger,
            stripe,
            mailer,
            settings,
        }
    }

    pub async fn handle_event(&self, raw_payload: &[u8], signature_header: &str) -> ProcessingResult {
        self.handle_event_at(raw_payload, signature_header, Utc::now())
            .await
    }

    pub async fn handle_event_at(
        &self,
        raw_payload: &[u8],
        signature_header: &str,
        now: DateTime<Utc>,
    ) -> ProcessingResult {
        if let Err(err) = verify_signature(
            raw_payload,
            signature_header,
            &self.settings.signing_secret,
            now.timestamp(),
            self.settings.tolerance_secs,
        ) {
            if err == SignatureError::MissingSecret {
                error!("webhook signing secret is empty; rejecting every delivery");
            } else {
                warn!(?err, "billing webhook signature rejected");
            }
            return ProcessingResult::Rejected {
                reason: RejectReason::InvalidSignature,
            };
        }

        let envelope: EventEnvelope = match serde_json::from_slice(raw_payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(?err, "billing webhook payload could not be parsed");
                return ProcessingResult::Rejected {
                    reason: RejectReason::MalformedPayload,
                };
            }
        };
        let event = BillingEvent {
            id: envelope.id,
            event_type: envelope.event_type,
            created: envelope.created.as_ref().and_then(to_time),
            object: envelope.data.object,
        };

        let stale_before = now - self.settings.stale_processing_after;
        let attempt = match self
            .ledger
            .claim(&event.id, &event.event_type, now, stale_before)
            .await
        {
            Ok(ClaimOutcome::Claimed { attempt }) => attempt,
            Ok(ClaimOutcome::AlreadyCompleted) => {
                info!(event_id = %event.id, "billing event already processed");
                return ProcessingResult::Skipped {
                    event_id: event.id,
                    reason: SkipReason::Duplicate,
                };
            }
            Ok(ClaimOutcome::InFlight) => {
                info!(event_id = %event.id, "billing event is being processed elsewhere");
                return ProcessingResult::Skipped {
                    event_id: event.id,
                    reason: SkipReason::InFlight,
                };
            }
            Err(err) => {
                error!(event_id = %event.id, ?err, "could not claim billing event");
                return ProcessingResult::RetryableError {
                    event_id: Some(event.id),
                    message: "idempotency ledger unavailable".into(),
                };
            }
        };

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            attempt,
            "processing billing event"
        );

        match self.dispatch(&event, now).await {
            Ok(outcome) => {
                if let Err(err) = self.ledger.mark_completed(&event.id, now).await {
                    // Release the claim so the redelivery can reclaim it and
                    // re-apply; handlers set absolute values.
                    error!(event_id = %event.id, ?err, "could not mark billing event completed");
                    if let Err(mark_err) = self
                        .ledger
                        .mark_failed(&event.id, "completion not recorded", now)
                        .await
                    {
                        error!(
                            event_id = %event.id,
                            ?mark_err,
                            "could not release billing event claim; it stays in flight until stale"
                        );
                    }
                    return ProcessingResult::RetryableError {
                        event_id: Some(event.id),
                        message: "could not record completion".into(),
                    };
                }
                ProcessingResult::Processed {
                    event_id: event.id,
                    event_type: event.event_type,
                    outcome,
                }
            }
            Err(err) => {
                let message = err.to_string();
                error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %message,
                    "billing event handler failed"
                );
                if let Err(mark_err) = self.ledger.mark_failed(&event.id, &message, now).await {
                    error!(event_id = %event.id, ?mark_err, "could not mark billing event failed");
                }
                ProcessingResult::RetryableError {
                    event_id: Some(event.id),
                    message,
                }
            }
        }
    }

    async fn dispatch(
        &self,
        event: &BillingEvent,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome, WebhookError> {
        match event.event_type.as_str() {
            "checkout.session.completed" => self.on_checkout_completed(event, now).await,
            "customer.subscription.created" | "customer.subscription.updated" => {
                self.on_subscription_changed(event).await
            }
            "customer.subscription.deleted" => self.on_subscription_deleted(event).await,
            "invoice.paid" | "invoice.payment_succeeded" => self.on_invoice_paid(event).await,
            "invoice.payment_failed" => self.on_invoice_failed(event).await,
            other => {
                info!(event_type = %other, "ignoring unhandled billing event type");
                Ok(EventOutcome::ignored("unhandled_event_type"))
            }
        }
    }

    async fn account_from_id_field(&self, object: &Value) -> Result<Option<Account>, WebhookError> {
        let candidate = extract_str(object, &["metadata", "account_id"])
            .or_else(|| extract_str(object, &["client_reference_id"]));
        let Some(account_id) = candidate.and_then(|raw| Uuid::parse_str(raw).ok()) else {
            return Ok(None);
        };
        Ok(self.accounts.find_account_by_id(account_id).await?)
    }

    async fn account_from_customer(&self, object: &Value) -> Result<Option<Account>, WebhookError> {
        match extract_ref(object, "customer") {
            Some(customer) => Ok(self
                .accounts
                .find_account_by_billing_customer_ref(&customer)
                .await?),
            None => Ok(None),
        }
    }

    /// Checkout sessions name the account directly; everything else is keyed
    /// by the provider customer.
    async fn resolve_account(&self, event: &BillingEvent) -> Result<Account, WebhookError> {
        let found = if event.event_type == "checkout.session.completed" {
            match self.account_from_id_field(&event.object).await? {
                Some(account) => Some(account),
                None => self.account_from_customer(&event.object).await?,
            }
        } else {
            match self.account_from_customer(&event.object).await? {
                Some(account) => Some(account),
                None => self.account_from_id_field(&event.object).await?,
            }
        };

        found.ok_or_else(|| {
            let subject = extract_ref(&event.object, "customer")
                .or_else(|| extract_str(&event.object, &["client_reference_id"]).map(str::to_string))
                .unwrap_or_else(|| "<no subject>".to_string());
            WebhookError::AccountNotFound(subject)
        })
    }

    fn is_stale(account: &Account, event: &BillingEvent) -> bool {
        match (event.created, account.last_billing_event_at) {
            (Some(created), Some(last_applied)) => created < last_applied,
            _ => false,
        }
    }

    async fn apply(
        &self,
        account: &Account,
        event: &BillingEvent,
        mut update: BillingUpdate,
    ) -> Result<EventOutcome, WebhookError> {
        update.last_billing_event_at = event.created;
        if update.is_empty() {
            return Ok(EventOutcome::ignored("no_changes"));
        }
        // The stale check above ran on a snapshot; the store re-checks it
        // atomically against whatever landed since.
        let Some(updated) = self
            .accounts
            .apply_billing_update(account.account_id, &update)
            .await?
        else {
            info!(
                account_id = %account.account_id,
                event_id = %event.id,
                "newer billing event already applied; skipping"
            );
            return Ok(EventOutcome::ignored("stale_event"));
        };

        info!(
            account_id = %updated.account_id,
            event_id = %event.id,
            from = %account.subscription_status,
            to = %updated.subscription_status,
            "applied billing event"
        );

        if account.subscription_status != SubscriptionStatus::Active
            && updated.subscription_status == SubscriptionStatus::Active
        {
            if let Some(email) = updated.email.as_deref() {
                if let Err(err) = self.mailer.send_subscription_welcome_email(email).await {
                    warn!(account_id = %updated.account_id, ?err, "welcome email failed");
                }
            }
        }
        Ok(EventOutcome::Applied)
    }

    async fn on_checkout_completed(
        &self,
        event: &BillingEvent,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome, WebhookError> {
        let object = &event.object;
        if extract_str(object, &["mode"]).is_some_and(|mode| mode != "subscription") {
            return Ok(EventOutcome::ignored("not_a_subscription_checkout"));
        }
        let account = self.resolve_account(event).await?;
        if Self::is_stale(&account, event) {
            return Ok(EventOutcome::ignored("stale_event"));
        }

        // Upgrading mid-trial ends the trial. Nothing from the trial window is
        // carried into the paid period.
        let update = BillingUpdate {
            subscription_status: Some(SubscriptionStatus::Active),
            billing_customer_ref: extract_ref(object, "customer"),
            subscription_ref: extract_ref(object, "subscription"),
            subscription_start: Some(event.created.unwrap_or(now)),
            ..Default::default()
        };
        self.apply(&account, event, update).await
    }

    async fn on_subscription_changed(&self, event: &BillingEvent) -> Result<EventOutcome, WebhookError> {
        let object = &event.object;
        let status = extract_str(object, &["status"]).ok_or(WebhookError::MissingField("status"))?;
        let cancel_at_period_end = extract_bool(object, &["cancel_at_period_end"]).unwrap_or(false);
        let Some(mapped) = map_provider_status(status, cancel_at_period_end) else {
            info!(event_id = %event.id, %status, "subscription status does not change access");
            return Ok(EventOutcome::ignored("unmapped_subscription_status"));
        };

        let account = self.resolve_account(event).await?;
        if Self::is_stale(&account, event) {
            return Ok(EventOutcome::ignored("stale_event"));
        }

        let period_end = extract_time(object, &["current_period_end"]);
        let subscription_end = match (&mapped, cancel_at_period_end) {
            (SubscriptionStatus::Canceled, true) => {
                extract_time(object, &["cancel_at"]).or(period_end)
            }
            (SubscriptionStatus::Canceled, false) => {
                period_end.or_else(|| extract_time(object, &["ended_at"]))
            }
            _ => period_end,
        };

        let update = BillingUpdate {
            subscription_status: Some(mapped),
            billing_customer_ref: extract_ref(object, "customer"),
            subscription_ref: extract_str(object, &["id"]).map(str::to_string),
            subscription_start: extract_time(object, &["start_date"])
                .or_else(|| extract_time(object, &["current_period_start"])),
            subscription_end,
            ..Default::default()
        };
        self.apply(&account, event, update).await
    }

    async fn on_subscription_deleted(&self, event: &BillingEvent) -> Result<EventOutcome, WebhookError> {
        let object = &event.object;
        let account = self.resolve_account(event).await?;
        if Self::is_stale(&account, event) {
            return Ok(EventOutcome::ignored("stale_event"));
        }

        // Paid-through date, not the moment of deletion.
        let update = BillingUpdate {
            subscription_status: Some(SubscriptionStatus::Canceled),
            subscription_ref: extract_str(object, &["id"]).map(str::to_string),
            subscription_end: extract_time(object, &["current_period_end"])
                .or_else(|| extract_time(object, &["ended_at"])),
            ..Default::default()
        };
        self.apply(&account, event, update).await
    }

    async fn on_invoice_paid(&self, event: &BillingEvent) -> Result<EventOutcome, WebhookError> {
        let object = &event.object;
        let Some(subscription_id) = extract_ref(object, "subscription") else {
            return Ok(EventOutcome::ignored("not_a_subscription_invoice"));
        };
        let account = self.resolve_account(event).await?;
        if Self::is_stale(&account, event) {
            return Ok(EventOutcome::ignored("stale_event"));
        }

        let period_end = match jget(object, &["lines", "data"])
            .and_then(Value::as_array)
            .and_then(|lines| lines.iter().filter_map(|l| extract_time(l, &["period", "end"])).max())
        {
            Some(end) => Some(end),
            None => {
                let info = self.stripe.get_subscription(&subscription_id).await?;
                from_unix(info.current_period_end)
            }
        };

        let status = match account.subscription_status {
            SubscriptionStatus::Trial | SubscriptionStatus::None => Some(SubscriptionStatus::Active),
            // A payment never revives a cancellation.
            _ => None,
        };
        let subscription_end = match (period_end, account.subscription_end) {
            (Some(new_end), Some(current)) if new_end <= current => None,
            (new_end, _) => new_end,
        };

        let update = BillingUpdate {
            subscription_status: status,
            billing_customer_ref: extract_ref(object, "customer"),
            subscription_ref: Some(subscription_id),
            subscription_end,
            ..Default::default()
        };
        self.apply(&account, event, update).await
    }

    async fn on_invoice_failed(&self, event: &BillingEvent) -> Result<EventOutcome, WebhookError> {
        let account = self.resolve_account(event).await?;
        warn!(
            account_id = %account.account_id,
            invoice = extract_str(&event.object, &["id"]).unwrap_or("<unknown>"),
            attempt_count = extract_i64(&event.object, &["attempt_count"]).unwrap_or(0),
            "invoice payment failed; access unchanged pending provider retries"
        );
        if let Some(email) = account.email.as_deref() {
            if let Err(err) = self.mailer.send_payment_failed_email(email).await {
                warn!(account_id = %account.account_id, ?err, "payment failed email failed");
            }
        }
        Ok(EventOutcome::Notified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{mock_db::MockDb, mock_webhook_event_repository::MockWebhookEventRepository},
        models::webhook_event::{ProcessingStatus, WebhookEventRecord},
        services::{smtp_mailer::MockMailer, stripe::signature::sign_payload, stripe::MockStripeService},
        utils::entitlement::{evaluate_access, AccessStatus},
    };
    use chrono::TimeZone;
    use serde_json::json;

    const SECRET: &str = "whsec_unit";

    struct Harness {
        db: Arc<MockDb>,
        ledger: MockWebhookEventRepository,
        mailer: Arc<MockMailer>,
        processor: Arc<WebhookProcessor>,
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn harness_with(accounts: Vec<Account>, mailer: MockMailer, stripe: MockStripeService) -> Harness {
        let db = Arc::new(MockDb::with_accounts(accounts));
        let ledger = MockWebhookEventRepository::default();
        let mailer = Arc::new(mailer);
        let processor = Arc::new(WebhookProcessor::new(
            db.clone(),
            Arc::new(ledger.clone()),
            Arc::new(stripe.clone()),
            mailer.clone(),
            WebhookSettings {
                signing_secret: SECRET.into(),
                tolerance_secs: 300,
                stale_processing_after: Duration::minutes(10),
            },
        ));
        Harness {
            db,
            ledger,
            mailer,
            processor,
        }
    }

    fn harness(accounts: Vec<Account>) -> Harness {
        harness_with(accounts, MockMailer::default(), MockStripeService::new())
    }

    fn trial_account(days_left: i64) -> Account {
        Account {
            account_id: Uuid::new_v4(),
            email: Some("user@example.com".into()),
            billing_customer_ref: Some("cus_123".into()),
            subscription_status: SubscriptionStatus::Trial,
            trial_start: Some(now() - Duration::days(7 - days_left)),
            trial_end: Some(now() + Duration::days(days_left)),
            ..Default::default()
        }
    }

    fn event(id: &str, event_type: &str, created: DateTime<Utc>, object: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": id,
            "type": event_type,
            "created": created.timestamp(),
            "data": { "object": object }
        }))
        .unwrap()
    }

    fn sign(body: &[u8]) -> String {
        sign_payload(body, SECRET, now().timestamp())
    }

    fn checkout(account: &Account) -> Value {
        json!({
            "id": "cs_test_1",
            "mode": "subscription",
            "client_reference_id": account.account_id.to_string(),
            "customer": "cus_123",
            "subscription": "sub_123"
        })
    }

    #[tokio::test]
    async fn invalid_signature_touches_nothing() {
        let account = trial_account(4);
        let h = harness(vec![account.clone()]);
        let body = event("evt_1", "checkout.session.completed", now(), checkout(&account));

        let result = h
            .processor
            .handle_event_at(&body, "t=1,v1=deadbeef", now())
            .await;
        assert_eq!(
            result,
            ProcessingResult::Rejected {
                reason: RejectReason::InvalidSignature
            }
        );
        assert_eq!(h.ledger.len(), 0);
        assert_eq!(*h.db.update_calls.lock().unwrap(), 0);
        assert_eq!(h.db.account(account.account_id).unwrap(), account);
    }

    #[tokio::test]
    async fn signed_garbage_is_rejected_as_malformed() {
        let h = harness(vec![]);
        let body = b"{\"not\":\"an event\"}".to_vec();
        let result = h.processor.handle_event_at(&body, &sign(&body), now()).await;
        assert_eq!(
            result,
            ProcessingResult::Rejected {
                reason: RejectReason::MalformedPayload
            }
        );
        assert_eq!(h.ledger.len(), 0);
    }

    #[tokio::test]
    async fn upgrade_from_trial_drops_remaining_trial_days() {
        let account = trial_account(4);
        let h = harness(vec![account.clone()]);
        let body = event("evt_up", "checkout.session.completed", now(), checkout(&account));

        let result = h.processor.handle_event_at(&body, &sign(&body), now()).await;
        assert!(matches!(
            result,
            ProcessingResult::Processed {
                outcome: EventOutcome::Applied,
                ..
            }
        ));

        let stored = h.db.account(account.account_id).unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Active);
        assert_eq!(stored.subscription_ref.as_deref(), Some("sub_123"));
        assert_eq!(stored.subscription_start, Some(now()));
        assert_eq!(stored.subscription_end, None);
        let decision = evaluate_access(&stored, now() + Duration::days(2));
        assert_eq!(decision.status, AccessStatus::Subscribed);
        assert_eq!(decision.days_left, 0);

        assert_eq!(
            h.mailer.sent_welcome_emails.lock().unwrap().as_slice(),
            ["user@example.com".to_string()]
        );
        assert_eq!(
            h.ledger.record("evt_up").unwrap().processing_status,
            ProcessingStatus::Completed
        );
    }

    #[tokio::test]
    async fn replay_is_applied_once() {
        let account = trial_account(4);
        let h = harness(vec![account.clone()]);
        let body = event("evt_replay", "checkout.session.completed", now(), checkout(&account));
        let sig = sign(&body);

        let first = h.processor.handle_event_at(&body, &sig, now()).await;
        assert!(matches!(first, ProcessingResult::Processed { .. }));
        let after_first = h.db.account(account.account_id).unwrap();

        let second = h.processor.handle_event_at(&body, &sig, now()).await;
        assert_eq!(
            second,
            ProcessingResult::Skipped {
                event_id: "evt_replay".into(),
                reason: SkipReason::Duplicate
            }
        );
        assert_eq!(*h.db.update_calls.lock().unwrap(), 1);
        assert_eq!(h.db.account(account.account_id).unwrap(), after_first);
        assert_eq!(h.mailer.sent_welcome_emails.lock().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_duplicates_apply_at_most_once() {
        let account = trial_account(4);
        let h = harness(vec![account.clone()]);
        let body = event("evt_race", "checkout.session.completed", now(), checkout(&account));
        let sig = sign(&body);

        let (p1, b1, s1) = (h.processor.clone(), body.clone(), sig.clone());
        let (p2, b2, s2) = (h.processor.clone(), body.clone(), sig.clone());
        let first = tokio::spawn(async move { p1.handle_event_at(&b1, &s1, now()).await });
        let second = tokio::spawn(async move { p2.handle_event_at(&b2, &s2, now()).await });
        let results = [first.await.unwrap(), second.await.unwrap()];

        let processed = results
            .iter()
            .filter(|r| matches!(r, ProcessingResult::Processed { .. }))
            .count();
        let skipped = results
            .iter()
            .filter(|r| matches!(r, ProcessingResult::Skipped { .. }))
            .count();
        assert_eq!((processed, skipped), (1, 1));
        assert_eq!(*h.db.update_calls.lock().unwrap(), 1);
        assert_eq!(
            h.ledger.record("evt_race").unwrap().processing_status,
            ProcessingStatus::Completed
        );
    }

    #[tokio::test]
    async fn deletion_keeps_paid_through_window() {
        let mut account = trial_account(0);
        account.subscription_status = SubscriptionStatus::Active;
        let h = harness(vec![account.clone()]);
        let period_end = now() + Duration::days(10);
        let body = event(
            "evt_del",
            "customer.subscription.deleted",
            now(),
            json!({
                "id": "sub_123",
                "customer": "cus_123",
                "status": "canceled",
                "current_period_end": period_end.timestamp(),
                "ended_at": now().timestamp()
            }),
        );

        h.processor.handle_event_at(&body, &sign(&body), now()).await;
        let stored = h.db.account(account.account_id).unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Canceled);
        assert_eq!(stored.subscription_end, Some(period_end));

        let decision = evaluate_access(&stored, now());
        assert_eq!(decision.status, AccessStatus::CanceledButActive);
        assert_eq!(decision.days_left, 10);
    }

    #[tokio::test]
    async fn scheduled_cancellation_uses_cancel_at() {
        let mut account = trial_account(0);
        account.subscription_status = SubscriptionStatus::Active;
        let h = harness(vec![account.clone()]);
        let cancel_at = now() + Duration::days(20);
        let body = event(
            "evt_upd",
            "customer.subscription.updated",
            now(),
            json!({
                "id": "sub_123",
                "customer": { "id": "cus_123" },
                "status": "active",
                "cancel_at_period_end": true,
                "cancel_at": cancel_at.timestamp(),
                "current_period_end": (now() + Duration::days(25)).timestamp()
            }),
        );

        h.processor.handle_event_at(&body, &sign(&body), now()).await;
        let stored = h.db.account(account.account_id).unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Canceled);
        assert_eq!(stored.subscription_end, Some(cancel_at));
        assert!(h.mailer.sent_welcome_emails.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invoice_paid_extends_but_never_revives() {
        let mut account = trial_account(0);
        account.subscription_status = SubscriptionStatus::Canceled;
        account.subscription_end = Some(now() + Duration::days(3));
        let h = harness(vec![account.clone()]);
        let line_end = now() + Duration::days(33);
        let body = event(
            "evt_inv",
            "invoice.paid",
            now(),
            json!({
                "id": "in_1",
                "customer": "cus_123",
                "subscription": "sub_123",
                "lines": { "data": [ { "period": { "start": now().timestamp(), "end": line_end.timestamp() } } ] }
            }),
        );

        h.processor.handle_event_at(&body, &sign(&body), now()).await;
        let stored = h.db.account(account.account_id).unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Canceled);
        assert_eq!(stored.subscription_end, Some(line_end));
    }

    #[tokio::test]
    async fn invoice_without_lines_asks_the_provider_for_the_period() {
        let mut account = trial_account(0);
        account.subscription_status = SubscriptionStatus::Active;
        let period_end = now() + Duration::days(30);
        let stripe = MockStripeService::new().with_subscription(
            "sub_123",
            now().timestamp(),
            period_end.timestamp(),
        );
        let h = harness_with(vec![account.clone()], MockMailer::default(), stripe);
        let body = event(
            "evt_inv2",
            "invoice.payment_succeeded",
            now(),
            json!({ "id": "in_2", "customer": "cus_123", "subscription": "sub_123" }),
        );

        h.processor.handle_event_at(&body, &sign(&body), now()).await;
        let stored = h.db.account(account.account_id).unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Active);
        assert_eq!(stored.subscription_end, Some(period_end));
    }

    #[tokio::test]
    async fn payment_failure_notifies_without_revoking() {
        let mut account = trial_account(0);
        account.subscription_status = SubscriptionStatus::Active;
        let h = harness(vec![account.clone()]);
        let body = event(
            "evt_fail",
            "invoice.payment_failed",
            now(),
            json!({ "id": "in_3", "customer": "cus_123", "attempt_count": 1 }),
        );

        let result = h.processor.handle_event_at(&body, &sign(&body), now()).await;
        assert!(matches!(
            result,
            ProcessingResult::Processed {
                outcome: EventOutcome::Notified,
                ..
            }
        ));
        assert_eq!(h.db.account(account.account_id).unwrap(), account);
        assert_eq!(h.mailer.sent_payment_failed_emails.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn handler_failure_is_recorded_and_retryable() {
        let account = trial_account(4);
        let h = harness(vec![account.clone()]);
        *h.db.fail_updates.lock().unwrap() = true;
        let body = event("evt_retry", "checkout.session.completed", now(), checkout(&account));
        let sig = sign(&body);

        let result = h.processor.handle_event_at(&body, &sig, now()).await;
        assert!(matches!(result, ProcessingResult::RetryableError { .. }));
        let record = h.ledger.record("evt_retry").unwrap();
        assert_eq!(record.processing_status, ProcessingStatus::Failed);
        assert!(record.error_message.unwrap().contains("persistence error"));

        *h.db.fail_updates.lock().unwrap() = false;
        let retried = h.processor.handle_event_at(&body, &sig, now()).await;
        assert!(matches!(retried, ProcessingResult::Processed { .. }));
        let record = h.ledger.record("evt_retry").unwrap();
        assert_eq!(record.processing_status, ProcessingStatus::Completed);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn unknown_subject_is_a_retryable_failure() {
        let h = harness(vec![]);
        let body = event(
            "evt_orphan",
            "customer.subscription.deleted",
            now(),
            json!({ "id": "sub_x", "customer": "cus_nobody", "current_period_end": now().timestamp() }),
        );
        let result = h.processor.handle_event_at(&body, &sign(&body), now()).await;
        assert!(matches!(result, ProcessingResult::RetryableError { .. }));
        let record = h.ledger.record("evt_orphan").unwrap();
        assert_eq!(record.processing_status, ProcessingStatus::Failed);
        assert!(record.error_message.unwrap().contains("cus_nobody"));
    }

    #[tokio::test]
    async fn older_events_do_not_override_newer_state() {
        let mut account = trial_account(0);
        account.subscription_status = SubscriptionStatus::Canceled;
        account.subscription_end = Some(now() + Duration::days(5));
        account.last_billing_event_at = Some(now());
        let h = harness(vec![account.clone()]);
        let body = event(
            "evt_old",
            "customer.subscription.updated",
            now() - Duration::hours(1),
            json!({ "id": "sub_123", "customer": "cus_123", "status": "active", "current_period_end": (now() + Duration::days(30)).timestamp() }),
        );

        let result = h.processor.handle_event_at(&body, &sign(&body), now()).await;
        assert_eq!(
            result,
            ProcessingResult::Processed {
                event_id: "evt_old".into(),
                event_type: "customer.subscription.updated".into(),
                outcome: EventOutcome::ignored("stale_event"),
            }
        );
        assert_eq!(h.db.account(account.account_id).unwrap(), account);
    }

    #[tokio::test]
    async fn unhandled_types_complete_as_ignored() {
        let h = harness(vec![]);
        let body = event("evt_other", "customer.created", now(), json!({ "id": "cus_1" }));
        let result = h.processor.handle_event_at(&body, &sign(&body), now()).await;
        assert!(matches!(
            result,
            ProcessingResult::Processed {
                outcome: EventOutcome::Ignored { .. },
                ..
            }
        ));
        assert_eq!(
            h.ledger.record("evt_other").unwrap().processing_status,
            ProcessingStatus::Completed
        );
    }

    #[tokio::test]
    async fn mail_failure_does_not_fail_the_event() {
        let account = trial_account(2);
        let mailer = MockMailer {
            fail_send: true,
            ..Default::default()
        };
        let h = harness_with(vec![account.clone()], mailer, MockStripeService::new());
        let body = event("evt_mail", "checkout.session.completed", now(), checkout(&account));
        let result = h.processor.handle_event_at(&body, &sign(&body), now()).await;
        assert!(matches!(result, ProcessingResult::Processed { .. }));
        assert_eq!(h.mailer.sent_welcome_emails.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn abandoned_processing_claims_are_reclaimed() {
        let account = trial_account(4);
        let h = harness(vec![account.clone()]);
        h.ledger.insert(WebhookEventRecord {
            id: Uuid::new_v4(),
            external_event_id: "evt_stuck".into(),
            event_type: "checkout.session.completed".into(),
            processing_status: ProcessingStatus::Processing,
            attempts: 1,
            created_at: now() - Duration::hours(1),
            updated_at: now() - Duration::hours(1),
            completed_at: None,
            error_message: None,
        });
        let body = event("evt_stuck", "checkout.session.completed", now(), checkout(&account));
        let result = h.processor.handle_event_at(&body, &sign(&body), now()).await;
        assert!(matches!(result, ProcessingResult::Processed { .. }));
        assert_eq!(h.ledger.record("evt_stuck").unwrap().attempts, 2);
    }

    /// Serves one fixed snapshot for customer lookups, the way a delivery
    /// that read the row before a concurrent write would see it.
    struct SnapshotReads {
        inner: Arc<MockDb>,
        snapshot: Account,
    }

    #[async_trait::async_trait]
    impl AccountRepository for SnapshotReads {
        async fn find_account_by_id(&self, _: Uuid) -> Result<Option<Account>, sqlx::Error> {
            Ok(Some(self.snapshot.clone()))
        }

        async fn find_account_by_billing_customer_ref(
            &self,
            _: &str,
        ) -> Result<Option<Account>, sqlx::Error> {
            Ok(Some(self.snapshot.clone()))
        }

        async fn apply_billing_update(
            &self,
            account_id: Uuid,
            update: &BillingUpdate,
        ) -> Result<Option<Account>, sqlx::Error> {
            self.inner.apply_billing_update(account_id, update).await
        }

        async fn set_billing_customer_ref(&self, account_id: Uuid, customer_ref: &str) -> Result<(), sqlx::Error> {
            self.inner.set_billing_customer_ref(account_id, customer_ref).await
        }

        async fn start_trial(
            &self,
            account_id: Uuid,
            trial_start: DateTime<Utc>,
            trial_end: DateTime<Utc>,
        ) -> Result<bool, sqlx::Error> {
            self.inner.start_trial(account_id, trial_start, trial_end).await
        }

        async fn count_recent_subscribers_with_fingerprint(
            &self,
            fingerprint: &str,
            exclude_account_id: Uuid,
            since: DateTime<Utc>,
        ) -> Result<i64, sqlx::Error> {
            self.inner
                .count_recent_subscribers_with_fingerprint(fingerprint, exclude_account_id, since)
                .await
        }

        async fn list_trials_ending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Account>, sqlx::Error> {
            self.inner.list_trials_ending_before(cutoff).await
        }
    }

    #[tokio::test]
    async fn older_event_read_before_a_newer_write_cannot_resurrect_access() {
        let mut account = trial_account(0);
        account.subscription_status = SubscriptionStatus::Active;
        account.last_billing_event_at = Some(now() - Duration::hours(2));
        let h = harness(vec![account.clone()]);
        let processor = WebhookProcessor::new(
            Arc::new(SnapshotReads {
                inner: h.db.clone(),
                snapshot: account.clone(),
            }),
            Arc::new(h.ledger.clone()),
            Arc::new(MockStripeService::new()),
            h.mailer.clone(),
            WebhookSettings {
                signing_secret: SECRET.into(),
                tolerance_secs: 300,
                stale_processing_after: Duration::minutes(10),
            },
        );

        let deleted = event(
            "evt_new_delete",
            "customer.subscription.deleted",
            now(),
            json!({ "id": "sub_123", "customer": "cus_123", "current_period_end": now().timestamp() }),
        );
        let updated = event(
            "evt_old_update",
            "customer.subscription.updated",
            now() - Duration::hours(1),
            json!({
                "id": "sub_123",
                "customer": "cus_123",
                "status": "active",
                "current_period_end": (now() + Duration::days(30)).timestamp()
            }),
        );

        processor.handle_event_at(&deleted, &sign(&deleted), now()).await;
        // Both deliveries read the same pre-deletion row.
        let result = processor.handle_event_at(&updated, &sign(&updated), now()).await;
        assert_eq!(
            result,
            ProcessingResult::Processed {
                event_id: "evt_old_update".into(),
                event_type: "customer.subscription.updated".into(),
                outcome: EventOutcome::ignored("stale_event"),
            }
        );

        let stored = h.db.account(account.account_id).unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Canceled);
        assert_eq!(stored.last_billing_event_at, Some(now()));
        assert_eq!(stored.subscription_end, Some(now()));
        assert!(!evaluate_access(&stored, now() + Duration::minutes(1)).is_allowed());
        assert_eq!(
            h.ledger.record("evt_old_update").unwrap().processing_status,
            ProcessingStatus::Completed
        );
    }

    #[tokio::test]
    async fn ledger_outage_is_retryable_and_touches_nothing() {
        let account = trial_account(4);
        let h = harness(vec![account.clone()]);
        *h.ledger.fail_claims.lock().unwrap() = true;
        let body = event("evt_down", "checkout.session.completed", now(), checkout(&account));

        let result = h.processor.handle_event_at(&body, &sign(&body), now()).await;
        assert_eq!(
            result,
            ProcessingResult::RetryableError {
                event_id: Some("evt_down".into()),
                message: "idempotency ledger unavailable".into(),
            }
        );
        assert_eq!(*h.db.update_calls.lock().unwrap(), 0);
        assert_eq!(h.db.account(account.account_id).unwrap(), account);
        assert!(h.ledger.record("evt_down").is_none());
    }

    #[tokio::test]
    async fn unrecorded_completion_releases_the_claim_for_redelivery() {
        let account = trial_account(4);
        let h = harness(vec![account.clone()]);
        *h.ledger.fail_completions.lock().unwrap() = true;
        let body = event("evt_unrecorded", "checkout.session.completed", now(), checkout(&account));
        let sig = sign(&body);

        let first = h.processor.handle_event_at(&body, &sig, now()).await;
        assert_eq!(
            first,
            ProcessingResult::RetryableError {
                event_id: Some("evt_unrecorded".into()),
                message: "could not record completion".into(),
            }
        );
        let record = h.ledger.record("evt_unrecorded").unwrap();
        assert_eq!(record.processing_status, ProcessingStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("completion not recorded"));

        *h.ledger.fail_completions.lock().unwrap() = false;
        let later = now() + Duration::minutes(1);
        let retried = h
            .processor
            .handle_event_at(&body, &sign_payload(&body, SECRET, later.timestamp()), later)
            .await;
        assert!(matches!(
            retried,
            ProcessingResult::Processed {
                outcome: EventOutcome::Applied,
                ..
            }
        ));
        let record = h.ledger.record("evt_unrecorded").unwrap();
        assert_eq!(record.processing_status, ProcessingStatus::Completed);
        assert_eq!(record.attempts, 2);
        assert_eq!(
            h.db.account(account.account_id).unwrap().subscription_status,
            SubscriptionStatus::Active
        );
        assert_eq!(h.mailer.sent_welcome_emails.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn iso_timestamps_are_accepted_alongside_unix_seconds() {
        let mut account = trial_account(0);
        account.subscription_status = SubscriptionStatus::Active;
        let h = harness(vec![account.clone()]);
        let body = serde_json::to_vec(&json!({
            "id": "evt_iso",
            "type": "customer.subscription.deleted",
            "created": "2024-06-01T14:00:00+02:00",
            "data": { "object": {
                "id": "sub_123",
                "customer": "cus_123",
                "current_period_end": "2024-06-11T12:00:00Z"
            } }
        }))
        .unwrap();

        h.processor.handle_event_at(&body, &sign(&body), now()).await;
        let stored = h.db.account(account.account_id).unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::Canceled);
        assert_eq!(stored.last_billing_event_at, Some(now()));
        assert_eq!(stored.subscription_end, Some(now() + Duration::days(10)));
    }

    #[tokio::test]
    async fn empty_patch_is_not_written() {
        let account = trial_account(3);
        let h = harness(vec![account.clone()]);
        let undated = BillingEvent {
            id: "evt_empty".into(),
            event_type: "invoice.paid".into(),
            created: None,
            object: json!({}),
        };

        let outcome = h
            .processor
            .apply(&account, &undated, BillingUpdate::default())
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::ignored("no_changes"));
        assert_eq!(*h.db.update_calls.lock().unwrap(), 0);
    }

    #[test]
    fn provider_status_mapping() {
        assert_eq!(map_provider_status("active", false), Some(SubscriptionStatus::Active));
        assert_eq!(map_provider_status("past_due", false), Some(SubscriptionStatus::Active));
        assert_eq!(map_provider_status("trialing", true), Some(SubscriptionStatus::Canceled));
        assert_eq!(map_provider_status("unpaid", false), Some(SubscriptionStatus::Canceled));
        assert_eq!(map_provider_status("incomplete", false), None);
    }
}
