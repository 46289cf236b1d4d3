use chrono::NaiveDateTime;
use sqlx::types::Json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{Subscription, UpsertSubscription};
use crate::error::{AppError, AppResult};

/// Subscription registry storage.
///
/// Callers are expected to pass an input already run through
/// `UpsertSubscription::normalized`.
pub struct SubscriptionRepository;

impl SubscriptionRepository {
    pub async fn create(
        pool: &SqlitePool,
        input: &UpsertSubscription,
        now: NaiveDateTime,
    ) -> AppResult<Subscription> {
        let id = Uuid::new_v4().to_string();
        let digest = input.digest.unwrap_or_default();
        let (qh_start, qh_end) = match &input.quiet_hours {
            Some(w) => (Some(w.start.clone()), Some(w.end.clone())),
            None => (None, None),
        };

        let result = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions (
                id, tenant_id, recipient_kind, recipient_id, events, channels,
                quiet_hours_start, quiet_hours_end, timezone, digest_enabled,
                digest_frequency, webhook_url, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&input.tenant_id)
        .bind(input.recipient.kind())
        .bind(input.recipient.id())
        .bind(Json(&input.events))
        .bind(Json(&input.channels))
        .bind(qh_start)
        .bind(qh_end)
        .bind(&input.timezone)
        .bind(digest.enabled)
        .bind(digest.frequency)
        .bind(&input.webhook_url)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database);

        match result {
            Err(e) if e.is_unique_violation() => Err(AppError::Conflict(format!(
                "subscription for {} '{}' already exists in tenant {}",
                input.recipient.kind_str(),
                input.recipient.id(),
                input.tenant_id
            ))),
            other => other,
        }
    }

    /// Replace every mutable field of an existing subscription.
    pub async fn update(
        pool: &SqlitePool,
        id: &str,
        input: &UpsertSubscription,
        now: NaiveDateTime,
    ) -> AppResult<Option<Subscription>> {
        let digest = input.digest.unwrap_or_default();
        let (qh_start, qh_end) = match &input.quiet_hours {
            Some(w) => (Some(w.start.clone()), Some(w.end.clone())),
            None => (None, None),
        };

        let result = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET recipient_kind = ?, recipient_id = ?, events = ?, channels = ?,
                quiet_hours_start = ?, quiet_hours_end = ?, timezone = ?,
                digest_enabled = ?, digest_frequency = ?, webhook_url = ?, updated_at = ?
            WHERE id = ? AND tenant_id = ?
            RETURNING *
            "#,
        )
        .bind(input.recipient.kind())
        .bind(input.recipient.id())
        .bind(Json(&input.events))
        .bind(Json(&input.channels))
        .bind(qh_start)
        .bind(qh_end)
        .bind(&input.timezone)
        .bind(digest.enabled)
        .bind(digest.frequency)
        .bind(&input.webhook_url)
        .bind(now)
        .bind(id)
        .bind(&input.tenant_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database);

        match result {
            Err(e) if e.is_unique_violation() => Err(AppError::Conflict(format!(
                "another subscription already targets {} '{}'",
                input.recipient.kind_str(),
                input.recipient.id()
            ))),
            other => other,
        }
    }

    /// Returns true if a row was deleted.
    pub async fn delete(pool: &SqlitePool, tenant_id: &str, id: &str) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE id = ? AND tenant_id = ?")
            .bind(id)
            .bind(tenant_id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn find_in_tenant(
        pool: &SqlitePool,
        tenant_id: &str,
        id: &str,
    ) -> AppResult<Option<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE id = ? AND tenant_id = ?",
        )
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Unscoped lookup for the sweepers, which only hold the id.
    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Subscription>> {
        sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)
    }

    pub async fn list_by_tenant(pool: &SqlitePool, tenant_id: &str) -> AppResult<Vec<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE tenant_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(tenant_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Subscriptions of a tenant whose event set contains `event`.
    pub async fn find_for_event(
        pool: &SqlitePool,
        tenant_id: &str,
        event: &str,
    ) -> AppResult<Vec<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            r#"
            SELECT s.* FROM subscriptions s
            WHERE s.tenant_id = ?
              AND EXISTS (SELECT 1 FROM json_each(s.events) e WHERE e.value = ?)
            ORDER BY s.created_at ASC, s.id ASC
            "#,
        )
        .bind(tenant_id)
        .bind(event)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }
}
