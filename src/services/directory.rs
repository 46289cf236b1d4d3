use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::db::models::{Channel, Recipient};
use crate::db::DirectoryRepository;
use crate::error::AppResult;
use crate::services::channels::in_app::in_app_target;

/// Boundary to the user/role directory: group expansion and contact lookup.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn resolve_group_members(&self, tenant_id: &str, group: &str) -> AppResult<Vec<String>>;

    /// Address, token or URL for `recipient` on `channel`; `None` when the
    /// recipient has nothing registered for that channel.
    async fn resolve_target(
        &self,
        tenant_id: &str,
        recipient: &Recipient,
        channel: Channel,
    ) -> AppResult<Option<String>>;
}

/// Directory backed by the `recipient_contacts` and `group_members` tables.
///
/// A group's contact row (keyed by the group name) is its shared address,
/// e.g. a distribution list.
pub struct SqlDirectory {
    pool: SqlitePool,
}

impl SqlDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecipientDirectory for SqlDirectory {
    async fn resolve_group_members(&self, tenant_id: &str, group: &str) -> AppResult<Vec<String>> {
        DirectoryRepository::list_group_members(&self.pool, tenant_id, group).await
    }

    async fn resolve_target(
        &self,
        tenant_id: &str,
        recipient: &Recipient,
        channel: Channel,
    ) -> AppResult<Option<String>> {
        if channel == Channel::InApp {
            return Ok(Some(in_app_target(recipient)));
        }
        DirectoryRepository::find_contact(&self.pool, tenant_id, recipient.id(), channel).await
    }
}
