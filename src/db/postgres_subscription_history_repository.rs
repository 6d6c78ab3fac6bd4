use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    db::subscription_history_repository::SubscriptionHistoryRepository,
    models::subscription_action::{
        NewSubscriptionAction, SubscriptionActionKind, SubscriptionActionRecord,
    },
};

pub struct PostgresSubscriptionHistoryRepository {
    pub pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct ActionRow {
    account_id: Uuid,
    action: String,
    occurred_at: DateTime<Utc>,
}

#[async_trait]
impl SubscriptionHistoryRepository for PostgresSubscriptionHistoryRepository {
    async fn record_action(&self, action: &NewSubscriptionAction) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO subscription_actions (
                id, account_id, action, payment_fingerprint, risk_score, occurred_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(action.account_id)
        .bind(action.kind.as_str())
        .bind(action.payment_fingerprint.as_deref())
        .bind(action.risk_score)
        .bind(action.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_actions(
        &self,
        account_id: Uuid,
        kind: SubscriptionActionKind,
        since: DateTime<Utc>,
    ) -> Result<Option<i64>, sqlx::Error> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM subscription_actions
            WHERE account_id = $1 AND action = $2 AND occurred_at >= $3
            "#,
        )
        .bind(account_id)
        .bind(kind.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(Some(count))
    }

    async fn count_trials_for_payment_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<i64>, sqlx::Error> {
        // A "create" recorded against an account that was trialing at the time.
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(DISTINCT sa.account_id)
            FROM subscription_actions sa
            JOIN accounts a ON a.id = sa.account_id
            WHERE sa.payment_fingerprint = $1
              AND sa.action = 'create'
              AND a.trial_start IS NOT NULL
            "#,
        )
        .bind(fingerprint)
        .fetch_one(&self.pool)
        .await?;
        Ok(Some(count))
    }

    async fn list_actions(
        &self,
        account_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Option<Vec<SubscriptionActionRecord>>, sqlx::Error> {
        let rows = sqlx::query_as::<_, ActionRow>(
            r#"
            SELECT account_id, action, occurred_at
            FROM subscription_actions
            WHERE account_id = $1 AND occurred_at >= $2
            ORDER BY occurred_at ASC
            "#,
        )
        .bind(account_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let records = rows
            .into_iter()
            .map(|row| {
                let kind = row
                    .action
                    .parse::<SubscriptionActionKind>()
                    .map_err(|e| sqlx::Error::Decode(e.into()))?;
                Ok(SubscriptionActionRecord {
                    account_id: row.account_id,
                    kind,
                    occurred_at: row.occurred_at,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        Ok(Some(records))
    }
}
