use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::account_repository::AccountRepository;
use crate::db::subscription_history_repository::SubscriptionHistoryRepository;
use crate::models::account::{Account, BillingUpdate, SubscriptionStatus};
use crate::models::subscription_action::{
    NewSubscriptionAction, SubscriptionActionKind, SubscriptionActionRecord,
};

#[derive(Default)]
pub struct MockDb {
    pub accounts: Mutex<HashMap<Uuid, Account>>,
    pub should_fail: bool,
    pub fail_updates: Mutex<bool>,
    pub update_calls: Mutex<usize>,
    pub lookups: Mutex<usize>,
}

impl MockDb {
    pub fn with_accounts(accounts: impl IntoIterator<Item = Account>) -> Self {
        let db = MockDb::default();
        {
            let mut map = db.accounts.lock().unwrap();
            for account in accounts {
                map.insert(account.account_id, account);
            }
        }
        db
    }

    pub fn account(&self, account_id: Uuid) -> Option<Account> {
        self.accounts.lock().unwrap().get(&account_id).cloned()
    }

    pub fn upsert(&self, account: Account) {
        self.accounts
            .lock()
            .unwrap()
            .insert(account.account_id, account);
    }

    fn check(&self) -> Result<(), sqlx::Error> {
        if self.should_fail {
            return Err(sqlx::Error::Protocol("Mock DB failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AccountRepository for MockDb {
    async fn find_account_by_id(&self, account_id: Uuid) -> Result<Option<Account>, sqlx::Error> {
        self.check()?;
        *self.lookups.lock().unwrap() += 1;
        Ok(self.account(account_id))
    }

    async fn find_account_by_billing_customer_ref(
        &self,
        customer_ref: &str,
    ) -> Result<Option<Account>, sqlx::Error> {
        self.check()?;
        Ok(self
            .accounts
            .lock()
            .unwrap()
            .values()
            .find(|a| a.billing_customer_ref.as_deref() == Some(customer_ref))
            .cloned())
    }

    async fn apply_billing_update(
        &self,
        account_id: Uuid,
        update: &BillingUpdate,
    ) -> Result<Option<Account>, sqlx::Error> {
        self.check()?;
        *self.update_calls.lock().unwrap() += 1;
        if *self.fail_updates.lock().unwrap() {
            return Err(sqlx::Error::Protocol("Mock DB update failure".into()));
        }
        // Same check-and-set as the conditional UPDATE, under one lock.
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts
            .get_mut(&account_id)
            .ok_or(sqlx::Error::RowNotFound)?;
        if let (Some(incoming), Some(stored)) =
            (update.last_billing_event_at, account.last_billing_event_at)
        {
            if incoming < stored {
                return Ok(None);
            }
        }
        update.apply_to(account);
        Ok(Some(account.clone()))
    }

    async fn set_billing_customer_ref(
        &self,
        account_id: Uuid,
        customer_ref: &str,
    ) -> Result<(), sqlx::Error> {
        self.check()?;
        if let Some(account) = self.accounts.lock().unwrap().get_mut(&account_id) {
            account.billing_customer_ref = Some(customer_ref.to_string());
        }
        Ok(())
    }

    async fn start_trial(
        &self,
        account_id: Uuid,
        trial_start: DateTime<Utc>,
        trial_end: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        self.check()?;
        let mut accounts = self.accounts.lock().unwrap();
        let Some(account) = accounts.get_mut(&account_id) else {
            return Ok(false);
        };
        if account.trial_start.is_some() || account.subscription_status != SubscriptionStatus::None
        {
            return Ok(false);
        }
        account.subscription_status = SubscriptionStatus::Trial;
        account.trial_start = Some(trial_start);
        account.trial_end = Some(trial_end);
        Ok(true)
    }

    async fn count_recent_subscribers_with_fingerprint(
        &self,
        fingerprint: &str,
        exclude_account_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, sqlx::Error> {
        self.check()?;
        let count = self
            .accounts
            .lock()
            .unwrap()
            .values()
            .filter(|a| {
                a.account_id != exclude_account_id
                    && a.signup_fingerprint.as_deref() == Some(fingerprint)
                    && a.subscription_ref.is_some()
                    && a.last_billing_event_at.is_some_and(|at| at > since)
            })
            .count();
        Ok(count as i64)
    }

    async fn list_trials_ending_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Account>, sqlx::Error> {
        self.check()?;
        let mut trials: Vec<Account> = self
            .accounts
            .lock()
            .unwrap()
            .values()
            .filter(|a| {
                a.subscription_status == SubscriptionStatus::Trial
                    && a.trial_end.is_some_and(|end| end <= cutoff)
            })
            .cloned()
            .collect();
        trials.sort_by_key(|a| a.trial_end);
        Ok(trials)
    }
}

/// History store that keeps every action in memory.
#[derive(Default)]
pub struct MockSubscriptionHistory {
    pub actions: Mutex<Vec<NewSubscriptionAction>>,
    /// Trials per payment fingerprint, seeded by tests.
    pub fingerprint_trials: Mutex<HashMap<String, i64>>,
}

impl MockSubscriptionHistory {
    pub fn push(&self, account_id: Uuid, kind: SubscriptionActionKind, occurred_at: DateTime<Utc>) {
        self.actions.lock().unwrap().push(NewSubscriptionAction {
            account_id,
            kind,
            payment_fingerprint: None,
            risk_score: 0,
            occurred_at,
        });
    }
}

#[async_trait]
impl SubscriptionHistoryRepository for MockSubscriptionHistory {
    async fn record_action(&self, action: &NewSubscriptionAction) -> Result<(), sqlx::Error> {
        self.actions.lock().unwrap().push(action.clone());
        Ok(())
    }

    async fn count_actions(
        &self,
        account_id: Uuid,
        kind: SubscriptionActionKind,
        since: DateTime<Utc>,
    ) -> Result<Option<i64>, sqlx::Error> {
        let count = self
            .actions
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.account_id == account_id && a.kind == kind && a.occurred_at >= since)
            .count();
        Ok(Some(count as i64))
    }

    async fn count_trials_for_payment_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<i64>, sqlx::Error> {
        Ok(Some(
            self.fingerprint_trials
                .lock()
                .unwrap()
                .get(fingerprint)
                .copied()
                .unwrap_or(0),
        ))
    }

    async fn list_actions(
        &self,
        account_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Option<Vec<SubscriptionActionRecord>>, sqlx::Error> {
        let mut records: Vec<SubscriptionActionRecord> = self
            .actions
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.account_id == account_id && a.occurred_at >= since)
            .map(|a| SubscriptionActionRecord {
                account_id: a.account_id,
                kind: a.kind,
                occurred_at: a.occurred_at,
            })
            .collect();
        records.sort_by_key(|r| r.occurred_at);
        Ok(Some(records))
    }
}
