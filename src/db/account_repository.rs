use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::account::{Account, BillingUpdate};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn find_account_by_id(&self, account_id: Uuid) -> Result<Option<Account>, sqlx::Error>;

    async fn find_account_by_billing_customer_ref(
        &self,
        customer_ref: &str,
    ) -> Result<Option<Account>, sqlx::Error>;

    /// Applies the patch only if `update.last_billing_event_at` is not older
    /// than the stored one, checked and written in one step. `Ok(None)` means
    /// a newer event already landed; `sqlx::Error::RowNotFound` means the
    /// account is gone.
    async fn apply_billing_update(
        &self,
        account_id: Uuid,
        update: &BillingUpdate,
    ) -> Result<Option<Account>, sqlx::Error>;

    async fn set_billing_customer_ref(
        &self,
        account_id: Uuid,
        customer_ref: &str,
    ) -> Result<(), sqlx::Error>;

    /// Grants a trial only to an account that never had one and has no
    /// subscription status. Returns whether the trial was granted.
    async fn start_trial(
        &self,
        account_id: Uuid,
        trial_start: DateTime<Utc>,
        trial_end: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error>;

    /// Other accounts sharing `fingerprint` that touched a subscription since
    /// `since`.
    async fn count_recent_subscribers_with_fingerprint(
        &self,
        fingerprint: &str,
        exclude_account_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, sqlx::Error>;

    async fn list_trials_ending_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Account>, sqlx::Error>;
}
