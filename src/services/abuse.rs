//! Advisory risk scoring for subscription actions.
//!
//! Checks are independent and additive. A check that cannot run because the
//! data it needs is not tracked reports `insufficient_data` and scores zero,
//! so the verdict never claims coverage it does not have. The detector is
//! never authoritative for access: callers decide what a verdict means.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    db::{
        account_repository::AccountRepository,
        subscription_history_repository::SubscriptionHistoryRepository,
    },
    models::{
        account::Account,
        subscription_action::{NewSubscriptionAction, SubscriptionActionKind},
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbuseSettings {
    pub cooldown_days: i64,
    pub cooldown_points_per_account: i32,
    pub cancellation_window_days: i64,
    pub max_cancellations: i64,
    pub cancellation_points: i32,
    pub max_trials_per_payment_method: i64,
    pub payment_reuse_points: i32,
    pub max_reactivation_cycles: i64,
    pub cycle_points: i32,
    pub quick_subscribe_days: i64,
    pub quick_cancel_days: i64,
    pub quick_pattern_points: i32,
    pub block_threshold: i32,
    pub flag_threshold: i32,
    pub warn_threshold: i32,
}

impl Default for AbuseSettings {
    fn default() -> Self {
        Self {
            cooldown_days: 7,
            cooldown_points_per_account: 40,
            cancellation_window_days: 30,
            max_cancellations: 3,
            cancellation_points: 60,
            max_trials_per_payment_method: 2,
            payment_reuse_points: 50,
            max_reactivation_cycles: 2,
            cycle_points: 30,
            quick_subscribe_days: 1,
            quick_cancel_days: 3,
            quick_pattern_points: 70,
            block_threshold: 150,
            flag_threshold: 100,
            warn_threshold: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AbuseAction {
    Allow,
    Warn,
    Flag,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckOutcome {
    Triggered { points: i32, indicator: String },
    Clear,
    InsufficientData { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub check: &'static str,
    #[serde(flatten)]
    pub outcome: CheckOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AbuseVerdict {
    pub action: AbuseAction,
    pub risk_score: i32,
    pub indicators: Vec<String>,
    pub checks: Vec<CheckReport>,
    /// The history store failed and the verdict fell back to `allow`.
    pub degraded: bool,
}

impl AbuseVerdict {
    fn degraded() -> Self {
        Self {
            action: AbuseAction::Allow,
            risk_score: 0,
            indicators: Vec::new(),
            checks: Vec::new(),
            degraded: true,
        }
    }
}

fn insufficient(reason: &str) -> CheckOutcome {
    CheckOutcome::InsufficientData {
        reason: reason.to_string(),
    }
}

pub struct AbuseDetector {
    accounts: Arc<dyn AccountRepository>,
    history: Arc<dyn SubscriptionHistoryRepository>,
    settings: AbuseSettings,
}

impl AbuseDetector {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        history: Arc<dyn SubscriptionHistoryRepository>,
        settings: AbuseSettings,
    ) -> Self {
        Self {
            accounts,
            history,
            settings,
        }
    }

    pub fn action_for_score(&self, score: i32) -> AbuseAction {
        if score >= self.settings.block_threshold {
            AbuseAction::Block
        } else if score >= self.settings.flag_threshold {
            AbuseAction::Flag
        } else if score >= self.settings.warn_threshold {
            AbuseAction::Warn
        } else {
            AbuseAction::Allow
        }
    }

    /// Score `action` for `account`. Store failures degrade to `allow`.
    pub async fn assess(
        &self,
        account: &Account,
        action: SubscriptionActionKind,
        payment_fingerprint: Option<&str>,
        now: DateTime<Utc>,
    ) -> AbuseVerdict {
        match self
            .run_checks(account, action, payment_fingerprint, now)
            .await
        {
            Ok(checks) => {
                let risk_score: i32 = checks
                    .iter()
                    .map(|c| match &c.outcome {
                        CheckOutcome::Triggered { points, .. } => *points,
                        _ => 0,
                    })
                    .fold(0, i32::saturating_add);
                let indicators = checks
                    .iter()
                    .filter_map(|c| match &c.outcome {
                        CheckOutcome::Triggered { indicator, .. } => Some(indicator.clone()),
                        _ => None,
                    })
                    .collect();
                let verdict = AbuseVerdict {
                    action: self.action_for_score(risk_score),
                    risk_score,
                    indicators,
                    checks,
                    degraded: false,
                };
                if verdict.action != AbuseAction::Allow {
                    info!(
                        account_id = %account.account_id,
                        action = %action,
                        risk_score,
                        verdict = ?verdict.action,
                        indicators = ?verdict.indicators,
                        "abuse check raised risk"
                    );
                }
                verdict
            }
            Err(err) => {
                warn!(
                    account_id = %account.account_id,
                    action = %action,
                    ?err,
                    "abuse check unavailable; allowing action"
                );
                AbuseVerdict::degraded()
            }
        }
    }

    /// Append the attempted action to the history. Failures are logged only.
    pub async fn record(
        &self,
        account: &Account,
        action: SubscriptionActionKind,
        payment_fingerprint: Option<&str>,
        verdict: &AbuseVerdict,
        now: DateTime<Utc>,
    ) {
        let entry = NewSubscriptionAction {
            account_id: account.account_id,
            kind: action,
            payment_fingerprint: payment_fingerprint.map(str::to_string),
            risk_score: verdict.risk_score,
            occurred_at: now,
        };
        if let Err(err) = self.history.record_action(&entry).await {
            warn!(account_id = %account.account_id, action = %action, ?err, "could not record subscription action");
        }
    }

    async fn run_checks(
        &self,
        account: &Account,
        action: SubscriptionActionKind,
        payment_fingerprint: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<CheckReport>, sqlx::Error> {
        let mut checks = Vec::new();
        match action {
            SubscriptionActionKind::Create => {
                checks.push(CheckReport {
                    check: "signup_fingerprint_cooldown",
                    outcome: self.check_fingerprint_cooldown(account, now).await?,
                });
                checks.push(CheckReport {
                    check: "payment_method_reuse",
                    outcome: self.check_payment_reuse(payment_fingerprint).await?,
                });
            }
            SubscriptionActionKind::Cancel => {
                checks.push(CheckReport {
                    check: "excessive_cancellations",
                    outcome: self.check_excessive_cancellations(account, now).await?,
                });
                checks.push(CheckReport {
                    check: "quick_trial_subscribe_cancel",
                    outcome: self.check_quick_cancel_pattern(account, now),
                });
                checks.push(CheckReport {
                    check: "reactivation_cycling",
                    outcome: self.check_cycling(account, now).await?,
                });
            }
            SubscriptionActionKind::Reactivate => {
                checks.push(CheckReport {
                    check: "reactivation_cycling",
                    outcome: self.check_cycling(account, now).await?,
                });
            }
        }
        Ok(checks)
    }

    async fn check_fingerprint_cooldown(
        &self,
        account: &Account,
        now: DateTime<Utc>,
    ) -> Result<CheckOutcome, sqlx::Error> {
        let Some(fingerprint) = account.signup_fingerprint.as_deref() else {
            return Ok(insufficient("account has no signup fingerprint"));
        };
        let since = now - Duration::days(self.settings.cooldown_days);
        let others = self
            .accounts
            .count_recent_subscribers_with_fingerprint(fingerprint, account.account_id, since)
            .await?;
        if others > 0 {
            let points = self
                .settings
                .cooldown_points_per_account
                .saturating_mul(i32::try_from(others).unwrap_or(i32::MAX));
            return Ok(CheckOutcome::Triggered {
                points,
                indicator: format!(
                    "{} other account(s) from the same signup fingerprint subscribed within {} days",
                    others, self.settings.cooldown_days
                ),
            });
        }
        Ok(CheckOutcome::Clear)
    }

    async fn check_payment_reuse(
        &self,
        payment_fingerprint: Option<&str>,
    ) -> Result<CheckOutcome, sqlx::Error> {
        let Some(fingerprint) = payment_fingerprint else {
            return Ok(insufficient("no payment method fingerprint supplied"));
        };
        match self
            .history
            .count_trials_for_payment_fingerprint(fingerprint)
            .await?
        {
            None => Ok(insufficient("payment method history is not tracked")),
            Some(trials) if trials > self.settings.max_trials_per_payment_method => {
                Ok(CheckOutcome::Triggered {
                    points: self.settings.payment_reuse_points,
                    indicator: format!("payment method used for {} trials", trials),
                })
            }
            Some(_) => Ok(CheckOutcome::Clear),
        }
    }

    async fn check_excessive_cancellations(
        &self,
        account: &Account,
        now: DateTime<Utc>,
    ) -> Result<CheckOutcome, sqlx::Error> {
        let since = now - Duration::days(self.settings.cancellation_window_days);
        match self
            .history
            .count_actions(account.account_id, SubscriptionActionKind::Cancel, since)
            .await?
        {
            None => Ok(insufficient("cancellation history is not tracked")),
            Some(count) if count >= self.settings.max_cancellations => Ok(CheckOutcome::Triggered {
                points: self.settings.cancellation_points,
                indicator: format!(
                    "{} cancellations in {} days",
                    count, self.settings.cancellation_window_days
                ),
            }),
            Some(_) => Ok(CheckOutcome::Clear),
        }
    }

    async fn check_cycling(
        &self,
        account: &Account,
        now: DateTime<Utc>,
    ) -> Result<CheckOutcome, sqlx::Error> {
        let since = now - Duration::days(self.settings.cancellation_window_days);
        let Some(actions) = self.history.list_actions(account.account_id, since).await? else {
            return Ok(insufficient("action history is not tracked"));
        };

        let mut pending_cancel = false;
        let mut cycles: i64 = 0;
        for record in &actions {
            match record.kind {
                SubscriptionActionKind::Cancel => pending_cancel = true,
                SubscriptionActionKind::Reactivate if pending_cancel => {
                    cycles += 1;
                    pending_cancel = false;
                }
                _ => {}
            }
        }

        if cycles > self.settings.max_reactivation_cycles {
            return Ok(CheckOutcome::Triggered {
                points: self.settings.cycle_points * cycles as i32,
                indicator: format!("{} cancel/reactivate cycles", cycles),
            });
        }
        Ok(CheckOutcome::Clear)
    }

    fn check_quick_cancel_pattern(&self, account: &Account, now: DateTime<Utc>) -> CheckOutcome {
        let (Some(trial_start), Some(subscribed_at)) =
            (account.trial_start, account.subscription_start)
        else {
            return CheckOutcome::Clear;
        };
        let subscribe_gap = subscribed_at - trial_start;
        let cancel_gap = now - subscribed_at;
        if subscribe_gap >= Duration::zero()
            && subscribe_gap <= Duration::days(self.settings.quick_subscribe_days)
            && cancel_gap <= Duration::days(self.settings.quick_cancel_days)
        {
            return CheckOutcome::Triggered {
                points: self.settings.quick_pattern_points,
                indicator: "subscribed right after trial start and canceled within days".into(),
            };
        }
        CheckOutcome::Clear
    }
}
