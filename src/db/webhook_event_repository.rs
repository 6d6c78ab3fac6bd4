use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::webhook_event::{ClaimOutcome, ProcessingStatus, WebhookEventRecord};

/// Idempotency ledger for billing-provider events.
#[async_trait]
pub trait WebhookEventRepository: Send + Sync {
    /// Atomically take ownership of `event_id`.
    ///
    /// A new id is inserted as `processing`. An existing `failed` record, or a
    /// `processing` record not touched since `stale_before`, is reclaimed.
    /// Anything else is reported without being modified. Implementations must
    /// not split this into a read followed by a write.
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome, sqlx::Error>;

    async fn mark_completed(&self, event_id: &str, now: DateTime<Utc>) -> Result<(), sqlx::Error>;

    async fn mark_failed(
        &self,
        event_id: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error>;

    async fn find_by_event_id(
        &self,
        event_id: &str,
    ) -> Result<Option<WebhookEventRecord>, sqlx::Error>;

    async fn list_recent(
        &self,
        status: Option<ProcessingStatus>,
        limit: i64,
    ) -> Result<Vec<WebhookEventRecord>, sqlx::Error>;
}
