use chrono::NaiveDateTime;
use sqlx::types::Json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateNotification, DeliveryState, Notification};
use crate::error::{AppError, AppResult};

pub struct NotificationRepository;

impl NotificationRepository {
    /// Insert a notification. `title` / `message` must already be rendered.
    pub async fn create(
        pool: &SqlitePool,
        input: &CreateNotification,
        now: NaiveDateTime,
    ) -> AppResult<Notification> {
        let id = Uuid::new_v4().to_string();

        sqlx::query_as::<_, Notification>(
            r#"
            INSERT INTO notifications (
                id, tenant_id, recipient_user_id, related_entity_type, related_entity_id,
                title, message, category, severity, delivery_state, template_context,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&input.tenant_id)
        .bind(&input.recipient_user_id)
        .bind(&input.related_entity_type)
        .bind(&input.related_entity_id)
        .bind(&input.title)
        .bind(&input.message)
        .bind(&input.category)
        .bind(input.severity)
        .bind(DeliveryState::Pending)
        .bind(input.template_context.clone().map(Json))
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Notification>> {
        sqlx::query_as::<_, Notification>("SELECT * FROM notifications WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)
    }

    /// Load several notifications, oldest first. Unknown ids are skipped.
    pub async fn find_many_by_ids(
        pool: &SqlitePool,
        ids: &[String],
    ) -> AppResult<Vec<Notification>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT * FROM notifications WHERE id IN ({}) ORDER BY created_at ASC, id ASC",
            placeholders
        );

        let mut query = sqlx::query_as::<_, Notification>(&sql);
        for id in ids {
            query = query.bind(id);
        }

        query.fetch_all(pool).await.map_err(AppError::Database)
    }

    /// Set the aggregate delivery state. A notification already `sent` is
    /// left untouched. Returns true when a row changed.
    pub async fn update_delivery_state(
        pool: &SqlitePool,
        id: &str,
        state: DeliveryState,
        now: NaiveDateTime,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET delivery_state = ?, updated_at = ?
            WHERE id = ? AND delivery_state != 'sent' AND delivery_state != ?
            "#,
        )
        .bind(state)
        .bind(now)
        .bind(id)
        .bind(state)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }
}
