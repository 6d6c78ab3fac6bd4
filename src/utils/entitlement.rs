//! Access decision for a single account at a single instant.
//!
//! `evaluate_access` is pure: it reads an [`Account`] snapshot and a clock
//! value and returns a decision. It never touches storage, never logs and
//! never panics on odd data; ambiguous or corrupt state is denied.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::account::{Account, SubscriptionStatus};

const MILLIS_PER_DAY: i64 = 86_400_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessStatus {
    Admin,
    Subscribed,
    CanceledButActive,
    Trial,
    Expired,
    TrialInvalid,
    Unknown,
}

impl AccessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessStatus::Admin => "admin",
            AccessStatus::Subscribed => "subscribed",
            AccessStatus::CanceledButActive => "canceled_but_active",
            AccessStatus::Trial => "trial",
            AccessStatus::Expired => "expired",
            AccessStatus::TrialInvalid => "trial_invalid",
            AccessStatus::Unknown => "unknown",
        }
    }

    /// Denials caused by broken account data rather than by the calendar.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, AccessStatus::TrialInvalid | AccessStatus::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Allowed,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub status: AccessStatus,
    pub access: Access,
    pub days_left: i64,
}

impl AccessDecision {
    fn allowed(status: AccessStatus, days_left: i64) -> Self {
        Self {
            status,
            access: Access::Allowed,
            days_left: days_left.max(0),
        }
    }

    fn denied(status: AccessStatus) -> Self {
        Self {
            status,
            access: Access::Denied,
            days_left: 0,
        }
    }

    /// What callers must use when evaluation could not run at all.
    pub fn fail_closed() -> Self {
        Self::denied(AccessStatus::Unknown)
    }

    pub fn is_allowed(&self) -> bool {
        self.access == Access::Allowed
    }
}

/// First matching rule wins: admin, active, canceled, trial, everything else.
///
/// Boundaries differ on purpose. A trial is still valid at exactly
/// `trial_end`; a canceled subscription is already over at exactly
/// `subscription_end`.
pub fn evaluate_access(account: &Account, now: DateTime<Utc>) -> AccessDecision {
    if account.is_admin {
        return AccessDecision::allowed(AccessStatus::Admin, 0);
    }

    match &account.subscription_status {
        SubscriptionStatus::Active => AccessDecision::allowed(AccessStatus::Subscribed, 0),
        SubscriptionStatus::Canceled => match account.subscription_end {
            Some(end) if now < end => {
                AccessDecision::allowed(AccessStatus::CanceledButActive, ceil_days(end - now))
            }
            _ => AccessDecision::denied(AccessStatus::Expired),
        },
        SubscriptionStatus::Trial => match account.trial_end {
            None => AccessDecision::denied(AccessStatus::TrialInvalid),
            Some(end) if now > end => AccessDecision::denied(AccessStatus::Expired),
            Some(end) => AccessDecision::allowed(AccessStatus::Trial, floor_days(end - now)),
        },
        SubscriptionStatus::None | SubscriptionStatus::Unrecognized(_) => {
            AccessDecision::denied(AccessStatus::Unknown)
        }
    }
}

/// Whole days remaining, rounded down, never negative.
pub fn floor_days(remaining: Duration) -> i64 {
    remaining
        .num_milliseconds()
        .div_euclid(MILLIS_PER_DAY)
        .max(0)
}

/// Whole days remaining, rounded up, never negative.
pub fn ceil_days(remaining: Duration) -> i64 {
    let millis = remaining.num_milliseconds();
    if millis <= 0 {
        return 0;
    }
    (millis + MILLIS_PER_DAY - 1) / MILLIS_PER_DAY
}

/// Trial window granted at signup.
pub fn trial_window(start: DateTime<Utc>, days: i64) -> (DateTime<Utc>, DateTime<Utc>) {
    (start, start + Duration::days(days.max(0)))
}
