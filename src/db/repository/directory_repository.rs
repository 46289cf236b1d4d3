use chrono::NaiveDateTime;
use sqlx::SqlitePool;

use crate::db::models::Channel;
use crate::error::{AppError, AppResult};

/// Contact addresses and group membership backing the default recipient directory.
pub struct DirectoryRepository;

impl DirectoryRepository {
    pub async fn find_contact(
        pool: &SqlitePool,
        tenant_id: &str,
        user_id: &str,
        channel: Channel,
    ) -> AppResult<Option<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT address FROM recipient_contacts WHERE tenant_id = ? AND user_id = ? AND channel = ?",
        )
        .bind(tenant_id)
        .bind(user_id)
        .bind(channel)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn upsert_contact(
        pool: &SqlitePool,
        tenant_id: &str,
        user_id: &str,
        channel: Channel,
        address: &str,
        now: NaiveDateTime,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO recipient_contacts (tenant_id, user_id, channel, address, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (tenant_id, user_id, channel)
            DO UPDATE SET address = excluded.address, updated_at = excluded.updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .bind(channel)
        .bind(address)
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn list_group_members(
        pool: &SqlitePool,
        tenant_id: &str,
        group: &str,
    ) -> AppResult<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT user_id FROM group_members WHERE tenant_id = ? AND group_name = ? ORDER BY user_id",
        )
        .bind(tenant_id)
        .bind(group)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn add_group_member(
        pool: &SqlitePool,
        tenant_id: &str,
        group: &str,
        user_id: &str,
    ) -> AppResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO group_members (tenant_id, group_name, user_id) VALUES (?, ?, ?)",
        )
        .bind(tenant_id)
        .bind(group)
        .bind(user_id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }
}
