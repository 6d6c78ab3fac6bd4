use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::{
    db::webhook_event_repository::WebhookEventRepository,
    models::webhook_event::{ClaimOutcome, ProcessingStatus, WebhookEventRecord},
};

pub struct PostgresWebhookEventRepository {
    pub pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct WebhookEventRow {
    id: Uuid,
    external_event_id: String,
    event_type: String,
    processing_status: String,
    attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl TryFrom<WebhookEventRow> for WebhookEventRecord {
    type Error = sqlx::Error;

    fn try_from(row: WebhookEventRow) -> Result<Self, Self::Error> {
        let processing_status = row
            .processing_status
            .parse::<ProcessingStatus>()
            .map_err(|e| sqlx::Error::Decode(e.into()))?;
        Ok(WebhookEventRecord {
            id: row.id,
            external_event_id: row.external_event_id,
            event_type: row.event_type,
            processing_status,
            attempts: row.attempts,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
        })
    }
}

#[async_trait]
impl WebhookEventRepository for PostgresWebhookEventRepository {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome, sqlx::Error> {
        // The unique key on external_event_id serialises concurrent deliveries:
        // exactly one of them gets a row back from this statement.
        let claimed = sqlx::query_scalar::<Postgres, i32>(
            r#"
            INSERT INTO webhook_events (
                id, external_event_id, event_type, processing_status, attempts,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, 'processing', 1, $4, $4)
            ON CONFLICT (external_event_id) DO UPDATE
            SET processing_status = 'processing',
                attempts = webhook_events.attempts + 1,
                error_message = NULL,
                updated_at = EXCLUDED.updated_at
            WHERE webhook_events.processing_status = 'failed'
               OR (webhook_events.processing_status = 'processing'
                   AND webhook_events.updated_at < $5)
            RETURNING attempts
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event_id)
        .bind(event_type)
        .bind(now)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(attempt) = claimed {
            return Ok(ClaimOutcome::Claimed { attempt });
        }

        let status = sqlx::query_scalar::<Postgres, String>(
            "SELECT processing_status FROM webhook_events WHERE external_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match status.as_deref().map(str::parse::<ProcessingStatus>) {
            Some(Ok(ProcessingStatus::Completed)) => ClaimOutcome::AlreadyCompleted,
            // processing, or a failed record another delivery just reclaimed
            _ => ClaimOutcome::InFlight,
        })
    }

    async fn mark_completed(&self, event_id: &str, now: DateTime<Utc>) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_status = 'completed',
                completed_at = $2,
                updated_at = $2,
                error_message = NULL
            WHERE external_event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        event_id: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_status = 'failed',
                error_message = $2,
                updated_at = $3
            WHERE external_event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(error_message)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_event_id(
        &self,
        event_id: &str,
    ) -> Result<Option<WebhookEventRecord>, sqlx::Error> {
        sqlx::query_as::<_, WebhookEventRow>(
            r#"
            SELECT id, external_event_id, event_type, processing_status, attempts,
                   created_at, updated_at, completed_at, error_message
            FROM webhook_events
            WHERE external_event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?
        .map(WebhookEventRecord::try_from)
        .transpose()
    }

    async fn list_recent(
        &self,
        status: Option<ProcessingStatus>,
        limit: i64,
    ) -> Result<Vec<WebhookEventRecord>, sqlx::Error> {
        sqlx::query_as::<_, WebhookEventRow>(
            r#"
            SELECT id, external_event_id, event_type, processing_status, attempts,
                   created_at, updated_at, completed_at, error_message
            FROM webhook_events
            WHERE ($1::text IS NULL OR processing_status = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(WebhookEventRecord::try_from)
        .collect()
    }
}
