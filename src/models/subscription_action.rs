use core::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Account actions that go through the billing provider on the user's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionActionKind {
    Create,
    Cancel,
    Reactivate,
}

impl SubscriptionActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionActionKind::Create => "create",
            SubscriptionActionKind::Cancel => "cancel",
            SubscriptionActionKind::Reactivate => "reactivate",
        }
    }
}

impl fmt::Display for SubscriptionActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(SubscriptionActionKind::Create),
            "cancel" => Ok(SubscriptionActionKind::Cancel),
            "reactivate" => Ok(SubscriptionActionKind::Reactivate),
            other => Err(format!("unknown subscription action: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSubscriptionAction {
    pub account_id: Uuid,
    pub kind: SubscriptionActionKind,
    pub payment_fingerprint: Option<String>,
    pub risk_score: i32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionActionRecord {
    pub account_id: Uuid,
    pub kind: SubscriptionActionKind,
    pub occurred_at: DateTime<Utc>,
}
