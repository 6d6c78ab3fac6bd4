use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::webhook_event_repository::WebhookEventRepository;
use crate::models::webhook_event::{ClaimOutcome, ProcessingStatus, WebhookEventRecord};

/// In-memory ledger. The whole claim runs under one lock so concurrent tasks
/// see the same check-and-set semantics as the SQL upsert.
#[derive(Clone, Default)]
pub struct MockWebhookEventRepository {
    records: Arc<Mutex<HashMap<String, WebhookEventRecord>>>,
    pub fail_claims: Arc<Mutex<bool>>,
    pub fail_completions: Arc<Mutex<bool>>,
    pub claims: Arc<Mutex<usize>>,
}

impl MockWebhookEventRepository {
    pub fn record(&self, event_id: &str) -> Option<WebhookEventRecord> {
        self.records.lock().unwrap().get(event_id).cloned()
    }

    pub fn insert(&self, record: WebhookEventRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.external_event_id.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl WebhookEventRepository for MockWebhookEventRepository {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome, sqlx::Error> {
        *self.claims.lock().unwrap() += 1;
        if *self.fail_claims.lock().unwrap() {
            return Err(sqlx::Error::Protocol("Mock ledger failure".into()));
        }

        let mut records = self.records.lock().unwrap();
        match records.get_mut(event_id) {
            None => {
                records.insert(
                    event_id.to_string(),
                    WebhookEventRecord {
                        id: Uuid::new_v4(),
                        external_event_id: event_id.to_string(),
                        event_type: event_type.to_string(),
                        processing_status: ProcessingStatus::Processing,
                        attempts: 1,
                        created_at: now,
                        updated_at: now,
                        completed_at: None,
                        error_message: None,
                    },
                );
                Ok(ClaimOutcome::Claimed { attempt: 1 })
            }
            Some(existing) => match existing.processing_status {
                ProcessingStatus::Completed => Ok(ClaimOutcome::AlreadyCompleted),
                ProcessingStatus::Processing if existing.updated_at >= stale_before => {
                    Ok(ClaimOutcome::InFlight)
                }
                ProcessingStatus::Processing | ProcessingStatus::Failed => {
                    existing.processing_status = ProcessingStatus::Processing;
                    existing.attempts += 1;
                    existing.error_message = None;
                    existing.updated_at = now;
                    Ok(ClaimOutcome::Claimed {
                        attempt: existing.attempts,
                    })
                }
            },
        }
    }

    async fn mark_completed(&self, event_id: &str, now: DateTime<Utc>) -> Result<(), sqlx::Error> {
        if *self.fail_completions.lock().unwrap() {
            return Err(sqlx::Error::Protocol("Mock ledger failure".into()));
        }
        if let Some(record) = self.records.lock().unwrap().get_mut(event_id) {
            record.processing_status = ProcessingStatus::Completed;
            record.completed_at = Some(now);
            record.updated_at = now;
            record.error_message = None;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        event_id: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        if let Some(record) = self.records.lock().unwrap().get_mut(event_id) {
            record.processing_status = ProcessingStatus::Failed;
            record.error_message = Some(error_message.to_string());
            record.updated_at = now;
        }
        Ok(())
    }

    async fn find_by_event_id(
        &self,
        event_id: &str,
    ) -> Result<Option<WebhookEventRecord>, sqlx::Error> {
        Ok(self.record(event_id))
    }

    async fn list_recent(
        &self,
        status: Option<ProcessingStatus>,
        limit: i64,
    ) -> Result<Vec<WebhookEventRecord>, sqlx::Error> {
        let mut rows: Vec<WebhookEventRecord> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| status.map_or(true, |s| r.processing_status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}
