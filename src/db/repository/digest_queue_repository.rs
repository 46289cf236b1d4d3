use chrono::NaiveDateTime;
use sqlx::types::Json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{Channel, DigestQueueEntry};
use crate::error::{AppError, AppResult};

/// Repository for the digest queue.
///
/// Implementation notes:
/// - Appending relies on the partial unique index over open entries, so the
///   create-or-append decision is a single `INSERT .. ON CONFLICT DO UPDATE`.
/// - Claiming follows the same single-statement pattern as the retry queue:
///   `UPDATE .. WHERE id = (SELECT id .. LIMIT 1) RETURNING *`, one row per
///   statement, so no transaction is held while channel senders run.
pub struct DigestQueueRepository;

impl DigestQueueRepository {
    /// Append `notification_id` to the open entry for (subscription, channel),
    /// creating the entry with `deliver_at` if none is open.
    pub async fn append_or_create(
        pool: &SqlitePool,
        tenant_id: &str,
        subscription_id: &str,
        channel: Channel,
        notification_id: &str,
        deliver_at: NaiveDateTime,
        now: NaiveDateTime,
    ) -> AppResult<DigestQueueEntry> {
        let id = Uuid::new_v4().to_string();

        sqlx::query_as::<_, DigestQueueEntry>(
            r#"
            INSERT INTO digest_queue (
                id, tenant_id, subscription_id, channel, notification_ids,
                deliver_at, attempts, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, json_array(?), ?, 0, 'open', ?, ?)
            ON CONFLICT (subscription_id, channel) WHERE status = 'open'
            DO UPDATE SET
                notification_ids = json_insert(
                    digest_queue.notification_ids,
                    '$[#]',
                    json_extract(excluded.notification_ids, '$[0]')
                ),
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(tenant_id)
        .bind(subscription_id)
        .bind(channel)
        .bind(notification_id)
        .bind(deliver_at)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Claim up to `limit` due entries: open ones whose `deliver_at` has
    /// passed, plus flushing ones whose claim is older than `lease_cutoff`.
    pub async fn fetch_and_claim_due(
        pool: &SqlitePool,
        now: NaiveDateTime,
        lease_cutoff: NaiveDateTime,
        claim_token: &str,
        limit: i64,
    ) -> AppResult<Vec<DigestQueueEntry>> {
        let mut entries = Vec::new();
        if limit <= 0 {
            return Ok(entries);
        }

        for _ in 0..(limit as usize) {
            let opt = sqlx::query_as::<_, DigestQueueEntry>(
                r#"
                UPDATE digest_queue
                SET status = 'flushing', claimed_at = ?, claim_token = ?, updated_at = ?
                WHERE id = (
                    SELECT id FROM digest_queue
                    WHERE (status = 'open' AND deliver_at <= ?)
                       OR (status = 'flushing' AND claimed_at IS NOT NULL AND claimed_at <= ?)
                    ORDER BY deliver_at ASC
                    LIMIT 1
                )
                RETURNING *
                "#,
            )
            .bind(now)
            .bind(claim_token)
            .bind(now)
            .bind(now)
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

    /// Delete a flushed entry. Returns false if the claim was lost.
    pub async fn complete(pool: &SqlitePool, id: &str, claim_token: &str) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM digest_queue WHERE id = ? AND claim_token = ?")
            .bind(id)
            .bind(claim_token)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// Put a claimed entry back after a failed flush.
    ///
    /// If a newer open entry was created for the same (subscription, channel)
    /// while this one was flushing, the ids are folded into it (oldest first)
    /// and this entry is removed; otherwise the entry is reopened with the new
    /// `deliver_at`. Returns false if the claim was lost.
    pub async fn release_after_failure(
        pool: &SqlitePool,
        entry: &DigestQueueEntry,
        claim_token: &str,
        deliver_at: NaiveDateTime,
        error: &str,
        now: NaiveDateTime,
    ) -> AppResult<bool> {
        let mut tx = pool.begin().await.map_err(AppError::Database)?;

        // Write first so the transaction holds the write lock before reading.
        let touched = sqlx::query(
            "UPDATE digest_queue SET updated_at = ? WHERE id = ? AND claim_token = ?",
        )
        .bind(now)
        .bind(&entry.id)
        .bind(claim_token)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        if touched.rows_affected() == 0 {
            tx.rollback().await.map_err(AppError::Database)?;
            return Ok(false);
        }

        let newer = sqlx::query_as::<_, DigestQueueEntry>(
            r#"
            SELECT * FROM digest_queue
            WHERE subscription_id = ? AND channel = ? AND status = 'open' AND id != ?
            "#,
        )
        .bind(&entry.subscription_id)
        .bind(entry.channel)
        .bind(&entry.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        match newer {
            Some(open) => {
                let mut merged: Vec<String> = entry.notification_ids.0.clone();
                for id in open.notification_ids.iter() {
                    if !merged.contains(id) {
                        merged.push(id.clone());
                    }
                }
                let merged_deliver_at = deliver_at.min(open.deliver_at);

                sqlx::query(
                    r#"
                    UPDATE digest_queue
                    SET notification_ids = ?, deliver_at = ?, attempts = ?,
                        last_error = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(Json(&merged))
                .bind(merged_deliver_at)
                .bind(entry.attempts + 1)
                .bind(error)
                .bind(now)
                .bind(&open.id)
                .execute(&mut *tx)
                .await
                .map_err(AppError::Database)?;

                sqlx::query("DELETE FROM digest_queue WHERE id = ?")
                    .bind(&entry.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(AppError::Database)?;
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE digest_queue
                    SET status = 'open', deliver_at = ?, attempts = attempts + 1,
                        last_error = ?, claimed_at = NULL, claim_token = NULL, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(deliver_at)
                .bind(error)
                .bind(now)
                .bind(&entry.id)
                .execute(&mut *tx)
                .await
                .map_err(AppError::Database)?;
            }
        }

        tx.commit().await.map_err(AppError::Database)?;
        Ok(true)
    }

    pub async fn find_open(
        pool: &SqlitePool,
        subscription_id: &str,
        channel: Channel,
    ) -> AppResult<Option<DigestQueueEntry>> {
        sqlx::query_as::<_, DigestQueueEntry>(
            "SELECT * FROM digest_queue WHERE subscription_id = ? AND channel = ? AND status = 'open'",
        )
        .bind(subscription_id)
        .bind(channel)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// All entries (open or flushing) for a subscription.
    pub async fn list_for_subscription(
        pool: &SqlitePool,
        subscription_id: &str,
    ) -> AppResult<Vec<DigestQueueEntry>> {
        sqlx::query_as::<_, DigestQueueEntry>(
            "SELECT * FROM digest_queue WHERE subscription_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(subscription_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }
}
