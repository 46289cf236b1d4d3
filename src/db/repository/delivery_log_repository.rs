use chrono::NaiveDateTime;
use sqlx::types::Json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateDeliveryLog, DeliveryLogEntry};
use crate::error::{AppError, AppResult};

/// Append-only delivery log.
///
/// Rows are unique on (notification, subscription, channel, attempt), which
/// makes every write insert-if-absent: a second worker writing the same
/// attempt gets `None` back instead of a duplicate row.
pub struct DeliveryLogRepository;

impl DeliveryLogRepository {
    /// Insert an entry with an explicit attempt number. Returns `None` when an
    /// entry for the same key and attempt already exists.
    pub async fn record(
        pool: &SqlitePool,
        log: CreateDeliveryLog,
        now: NaiveDateTime,
    ) -> AppResult<Option<DeliveryLogEntry>> {
        let id = Uuid::new_v4().to_string();

        sqlx::query_as::<_, DeliveryLogEntry>(
            r#"
            INSERT INTO delivery_log (
                id, notification_id, subscription_id, channel, attempt, status,
                event_name, target, next_attempt_at, metadata, error_message, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(log.notification_id)
        .bind(log.subscription_id)
        .bind(log.channel)
        .bind(log.attempt)
        .bind(log.status)
        .bind(log.event_name)
        .bind(log.target)
        .bind(log.next_attempt_at)
        .bind(Json(log.metadata))
        .bind(log.error_message)
        .bind(now)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Insert an entry numbered one past the latest attempt recorded for the
    /// same (notification, subscription, channel). `log.attempt` is ignored.
    pub async fn record_next_attempt(
        pool: &SqlitePool,
        log: CreateDeliveryLog,
        now: NaiveDateTime,
    ) -> AppResult<DeliveryLogEntry> {
        let id = Uuid::new_v4().to_string();

        sqlx::query_as::<_, DeliveryLogEntry>(
            r#"
            INSERT INTO delivery_log (
                id, notification_id, subscription_id, channel, attempt, status,
                event_name, target, next_attempt_at, metadata, error_message, created_at
            )
            SELECT ?, ?, ?, ?, COALESCE(MAX(attempt), 0) + 1, ?, ?, ?, ?, ?, ?, ?
            FROM delivery_log
            WHERE notification_id = ? AND subscription_id = ? AND channel = ?
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&log.notification_id)
        .bind(&log.subscription_id)
        .bind(log.channel)
        .bind(log.status)
        .bind(log.event_name)
        .bind(log.target)
        .bind(log.next_attempt_at)
        .bind(Json(log.metadata))
        .bind(log.error_message)
        .bind(now)
        .bind(&log.notification_id)
        .bind(&log.subscription_id)
        .bind(log.channel)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Claim up to `limit` failed entries that are due for another attempt.
    ///
    /// An entry is due when it failed retryably (`next_attempt_at` set and
    /// `<= now`), its attempt is below `max_attempts`, no later attempt exists
    /// for the same key, and it is unclaimed or its claim predates
    /// `lease_cutoff`. Each claim is one atomic statement.
    pub async fn fetch_and_claim_due_retries(
        pool: &SqlitePool,
        now: NaiveDateTime,
        max_attempts: i32,
        lease_cutoff: NaiveDateTime,
        claim_token: &str,
        limit: i64,
    ) -> AppResult<Vec<DeliveryLogEntry>> {
        let mut entries = Vec::new();
        if limit <= 0 {
            return Ok(entries);
        }

        for _ in 0..(limit as usize) {
            let opt = sqlx::query_as::<_, DeliveryLogEntry>(
                r#"
                UPDATE delivery_log
                SET claimed_at = ?, claim_token = ?
                WHERE id = (
                    SELECT d.id FROM delivery_log d
                    WHERE d.status = 'failed'
                      AND d.next_attempt_at IS NOT NULL
                      AND d.next_attempt_at <= ?
                      AND d.attempt < ?
                      AND (d.claimed_at IS NULL OR d.claimed_at <= ?)
                      AND NOT EXISTS (
                          SELECT 1 FROM delivery_log s
                          WHERE s.notification_id = d.notification_id
                            AND s.subscription_id = d.subscription_id
                            AND s.channel = d.channel
                            AND s.attempt > d.attempt
                      )
                    ORDER BY d.next_attempt_at ASC
                    LIMIT 1
                )
                RETURNING *
                "#,
            )
            .bind(now)
            .bind(claim_token)
            .bind(now)
            .bind(max_attempts)
            .bind(lease_cutoff)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

            match opt {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }

        Ok(entries)
    }

    /// Drop a claim so the entry becomes eligible again on the next sweep.
    pub async fn release_claim(pool: &SqlitePool, id: &str, claim_token: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE delivery_log SET claimed_at = NULL, claim_token = NULL WHERE id = ? AND claim_token = ?",
        )
        .bind(id)
        .bind(claim_token)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    /// Full audit trail of a notification, grouped per key in attempt order.
    pub async fn list_for_notification(
        pool: &SqlitePool,
        notification_id: &str,
    ) -> AppResult<Vec<DeliveryLogEntry>> {
        sqlx::query_as::<_, DeliveryLogEntry>(
            r#"
            SELECT * FROM delivery_log
            WHERE notification_id = ?
            ORDER BY subscription_id ASC, channel ASC, attempt ASC
            "#,
        )
        .bind(notification_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }
}
