use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{error, warn};
use uuid::Uuid;

use crate::{
    db::account_repository::AccountRepository,
    models::account::SubscriptionStatus,
    services::smtp_mailer::Mailer,
    utils::entitlement::evaluate_access,
};

/// Day counts that get a reminder.
pub const REMINDER_DAYS: [i64; 3] = [3, 1, 0];
const LOOKAHEAD_DAYS: i64 = 4;

pub struct TrialNotifier {
    accounts: Arc<dyn AccountRepository>,
    mailer: Arc<dyn Mailer>,
    // (account, days_left) pairs already mailed by this process
    sent: DashMap<(Uuid, i64), DateTime<Utc>>,
}

impl TrialNotifier {
    pub fn new(accounts: Arc<dyn AccountRepository>, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            accounts,
            mailer,
            sent: DashMap::new(),
        }
    }

    /// One scan. Returns how many reminders went out.
    pub async fn run_once(&self, now: DateTime<Utc>) -> usize {
        let trials = match self
            .accounts
            .list_trials_ending_before(now + Duration::days(LOOKAHEAD_DAYS))
            .await
        {
            Ok(trials) => trials,
            Err(err) => {
                error!(?err, "failed to list ending trials");
                return 0;
            }
        };

        let mut sent = 0;
        for account in trials {
            if account.subscription_status != SubscriptionStatus::Trial {
                continue;
            }
            let decision = evaluate_access(&account, now);
            if !decision.is_allowed() || !REMINDER_DAYS.contains(&decision.days_left) {
                continue;
            }
            let Some(email) = account.email.as_deref() else {
                continue;
            };

            let key = (account.account_id, decision.days_left);
            if self.sent.insert(key, now).is_some() {
                continue;
            }
            match self
                .mailer
                .send_trial_ending_email(email, decision.days_left)
                .await
            {
                Ok(()) => sent += 1,
                Err(err) => {
                    warn!(account_id = %account.account_id, ?err, "trial reminder failed; will retry");
                    self.sent.remove(&key);
                }
            }
        }

        // Entries for trials long over are never needed again.
        let horizon = now - Duration::days(LOOKAHEAD_DAYS + 1);
        self.sent.retain(|_, at| *at > horizon);
        sent
    }
}
