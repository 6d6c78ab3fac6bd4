use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription tag persisted on the account row.
///
/// Parsing never fails: anything we do not recognise is kept verbatim so the
/// access check can deny it and the log can show what was stored.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Canceled,
    #[default]
    None,
    Unrecognized(String),
}

impl SubscriptionStatus {
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return SubscriptionStatus::None;
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "" => SubscriptionStatus::None,
            "trial" => SubscriptionStatus::Trial,
            "active" => SubscriptionStatus::Active,
            "canceled" | "cancelled" => SubscriptionStatus::Canceled,
            _ => SubscriptionStatus::Unrecognized(raw.to_string()),
        }
    }

    /// Column value; `None` maps to SQL NULL.
    pub fn as_db_value(&self) -> Option<&str> {
        match self {
            SubscriptionStatus::Trial => Some("trial"),
            SubscriptionStatus::Active => Some("active"),
            SubscriptionStatus::Canceled => Some("canceled"),
            SubscriptionStatus::None => None,
            SubscriptionStatus::Unrecognized(raw) => Some(raw.as_str()),
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_value().unwrap_or("none"))
    }
}

impl Serialize for SubscriptionStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.as_db_value() {
            Some(value) => serializer.serialize_some(value),
            None => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for SubscriptionStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(SubscriptionStatus::parse(raw.as_deref()))
    }
}

/// Snapshot of the external account record. Every timestamp is already UTC;
/// repositories normalize at read time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Account {
    pub account_id: Uuid,
    pub email: Option<String>,
    pub is_admin: bool,
    pub billing_customer_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub subscription_status: SubscriptionStatus,
    pub trial_start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub subscription_start: Option<DateTime<Utc>>,
    pub subscription_end: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub signup_fingerprint: Option<String>,
    /// `created` time of the newest billing event applied to this account.
    pub last_billing_event_at: Option<DateTime<Utc>>,
}

/// Set-if-present patch applied by webhook handlers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BillingUpdate {
    pub subscription_status: Option<SubscriptionStatus>,
    pub billing_customer_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub subscription_start: Option<DateTime<Utc>>,
    pub subscription_end: Option<DateTime<Utc>>,
    pub last_billing_event_at: Option<DateTime<Utc>>,
}

impl BillingUpdate {
    pub fn is_empty(&self) -> bool {
        self == &BillingUpdate::default()
    }

    /// Apply the patch to an in-memory snapshot. Mirrors the SQL `COALESCE`
    /// update so mocks and Postgres agree.
    pub fn apply_to(&self, account: &mut Account) {
        if let Some(status) = &self.subscription_status {
            account.subscription_status = status.clone();
        }
        if let Some(customer) = &self.billing_customer_ref {
            account.billing_customer_ref = Some(customer.clone());
        }
        if let Some(subscription) = &self.subscription_ref {
            account.subscription_ref = Some(subscription.clone());
        }
        if let Some(start) = self.subscription_start {
            account.subscription_start = Some(start);
        }
        if let Some(end) = self.subscription_end {
            account.subscription_end = Some(end);
        }
        if let Some(at) = self.last_billing_event_at {
            account.last_billing_event_at =
                Some(account.last_billing_event_at.map_or(at, |current| current.max(at)));
        }
    }
}
