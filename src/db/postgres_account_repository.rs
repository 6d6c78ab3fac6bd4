use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::{
    db::account_repository::AccountRepository,
    models::account::{Account, BillingUpdate, SubscriptionStatus},
    utils::time::{normalize_opt, RawTimestamp},
};

const ACCOUNT_COLUMNS: &str = r#"
    id,
    email,
    is_admin,
    billing_customer_ref,
    subscription_ref,
    subscription_status,
    trial_start,
    trial_end,
    subscription_start,
    subscription_end,
    signup_fingerprint,
    last_billing_event_at
"#;

pub struct PostgresAccountRepository {
    pub pool: PgPool,
}

/// Reads a timestamp column whatever its SQL type. Legacy tables still carry
/// `TIMESTAMP` (naive) columns next to `TIMESTAMPTZ` ones.
fn read_timestamp(row: &PgRow, column: &str) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    match row.try_get::<Option<DateTime<Utc>>, _>(column) {
        Ok(value) => Ok(value),
        Err(sqlx::Error::ColumnDecode { .. }) => {
            let naive: Option<NaiveDateTime> = row.try_get(column)?;
            Ok(normalize_opt(naive.map(RawTimestamp::Naive)))
        }
        Err(err) => Err(err),
    }
}

fn account_from_row(row: &PgRow) -> Result<Account, sqlx::Error> {
    let status: Option<String> = row.try_get("subscription_status")?;
    Ok(Account {
        account_id: row.try_get("id")?,
        email: row.try_get("email")?,
        is_admin: row.try_get::<Option<bool>, _>("is_admin")?.unwrap_or(false),
        billing_customer_ref: row.try_get("billing_customer_ref")?,
        subscription_ref: row.try_get("subscription_ref")?,
        subscription_status: SubscriptionStatus::parse(status.as_deref()),
        trial_start: read_timestamp(row, "trial_start")?,
        trial_end: read_timestamp(row, "trial_end")?,
        subscription_start: read_timestamp(row, "subscription_start")?,
        subscription_end: read_timestamp(row, "subscription_end")?,
        signup_fingerprint: row.try_get("signup_fingerprint")?,
        last_billing_event_at: read_timestamp(row, "last_billing_event_at")?,
    })
}

#[async_trait]
impl AccountRepository for PostgresAccountRepository {
    async fn find_account_by_id(&self, account_id: Uuid) -> Result<Option<Account>, sqlx::Error> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn find_account_by_billing_customer_ref(
        &self,
        customer_ref: &str,
    ) -> Result<Option<Account>, sqlx::Error> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE billing_customer_ref = $1");
        let row = sqlx::query(&sql)
            .bind(customer_ref)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn apply_billing_update(
        &self,
        account_id: Uuid,
        update: &BillingUpdate,
    ) -> Result<Option<Account>, sqlx::Error> {
        let sql = format!(
            r#"
            UPDATE accounts
            SET subscription_status = COALESCE($2, subscription_status),
                billing_customer_ref = COALESCE($3, billing_customer_ref),
                subscription_ref = COALESCE($4, subscription_ref),
                subscription_start = COALESCE($5, subscription_start),
                subscription_end = COALESCE($6, subscription_end),
                last_billing_event_at = GREATEST(last_billing_event_at, $7),
                updated_at = now()
            WHERE id = $1
              AND ($7::timestamptz IS NULL
                   OR last_billing_event_at IS NULL
                   OR last_billing_event_at <= $7)
            RETURNING {ACCOUNT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(account_id)
            .bind(
                update
                    .subscription_status
                    .as_ref()
                    .and_then(|status| status.as_db_value()),
            )
            .bind(update.billing_customer_ref.as_deref())
            .bind(update.subscription_ref.as_deref())
            .bind(update.subscription_start)
            .bind(update.subscription_end)
            .bind(update.last_billing_event_at)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = row {
            return account_from_row(&row).map(Some);
        }

        // Nothing written: either a newer event got there first or the row is gone.
        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM accounts WHERE id = $1)")
            .bind(account_id)
            .fetch_one(&self.pool)
            .await?;
        if exists {
            Ok(None)
        } else {
            Err(sqlx::Error::RowNotFound)
        }
    }

    async fn set_billing_customer_ref(
        &self,
        account_id: Uuid,
        customer_ref: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE accounts SET billing_customer_ref = $2, updated_at = now() WHERE id = $1")
            .bind(account_id)
            .bind(customer_ref)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn start_trial(
        &self,
        account_id: Uuid,
        trial_start: DateTime<Utc>,
        trial_end: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET subscription_status = 'trial',
                trial_start = $2,
                trial_end = $3,
                updated_at = now()
            WHERE id = $1
              AND trial_start IS NULL
              AND (subscription_status IS NULL OR subscription_status = '')
            "#,
        )
        .bind(account_id)
        .bind(trial_start)
        .bind(trial_end)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn count_recent_subscribers_with_fingerprint(
        &self,
        fingerprint: &str,
        exclude_account_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM accounts
            WHERE signup_fingerprint = $1
              AND id <> $2
              AND subscription_ref IS NOT NULL
              AND last_billing_event_at > $3
            "#,
        )
        .bind(fingerprint)
        .bind(exclude_account_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
    }

    async fn list_trials_ending_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Account>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT {ACCOUNT_COLUMNS}
            FROM accounts
            WHERE subscription_status = 'trial'
              AND trial_end IS NOT NULL
              AND trial_end <= $1
            ORDER BY trial_end
            "#
        );
        let rows = sqlx::query(&sql).bind(cutoff).fetch_all(&self.pool).await?;
        rows.iter().map(account_from_row).collect()
    }
}
