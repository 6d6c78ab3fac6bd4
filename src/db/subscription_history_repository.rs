use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::subscription_action::{
    NewSubscriptionAction, SubscriptionActionKind, SubscriptionActionRecord,
};

/// History the abuse checks read from.
///
/// Every query returns `Ok(None)` when the backing store does not track that
/// data. The detector reports those checks as `insufficient_data` instead of
/// scoring them as clean.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubscriptionHistoryRepository: Send + Sync {
    async fn record_action(&self, action: &NewSubscriptionAction) -> Result<(), sqlx::Error>;

    async fn count_actions(
        &self,
        account_id: Uuid,
        kind: SubscriptionActionKind,
        since: DateTime<Utc>,
    ) -> Result<Option<i64>, sqlx::Error>;

    /// Trials started by any account with this payment fingerprint.
    async fn count_trials_for_payment_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<i64>, sqlx::Error>;

    /// Oldest first.
    async fn list_actions(
        &self,
        account_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Option<Vec<SubscriptionActionRecord>>, sqlx::Error>;
}

/// Store that tracks nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSubscriptionHistory;

#[async_trait]
impl SubscriptionHistoryRepository for NoopSubscriptionHistory {
    async fn record_action(&self, _action: &NewSubscriptionAction) -> Result<(), sqlx::Error> {
        Ok(())
    }

    async fn count_actions(
        &self,
        _account_id: Uuid,
        _kind: SubscriptionActionKind,
        _since: DateTime<Utc>,
    ) -> Result<Option<i64>, sqlx::Error> {
        Ok(None)
    }

    async fn count_trials_for_payment_fingerprint(
        &self,
        _fingerprint: &str,
    ) -> Result<Option<i64>, sqlx::Error> {
        Ok(None)
    }

    async fn list_actions(
        &self,
        _account_id: Uuid,
        _since: DateTime<Utc>,
    ) -> Result<Option<Vec<SubscriptionActionRecord>>, sqlx::Error> {
        Ok(None)
    }
}
