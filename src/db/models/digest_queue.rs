use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

use super::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DigestStatus {
    /// Accepting new notification ids; waiting for `deliver_at`.
    Open,
    /// Claimed by a sweeper that is currently sending it.
    Flushing,
}

/// Deferred notifications for one (subscription, channel), released together.
///
/// At most one `open` entry exists per (subscription, channel). While an entry
/// is `flushing`, new deferrals open a fresh entry; a failed flush folds its
/// ids back into that newer entry.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DigestQueueEntry {
    pub id: String,
    pub tenant_id: String,
    pub subscription_id: String,
    pub channel: Channel,
    pub notification_ids: Json<Vec<String>>,
    pub deliver_at: NaiveDateTime,
    /// Number of failed flush attempts so far.
    pub attempts: i32,
    pub status: DigestStatus,
    pub claimed_at: Option<NaiveDateTime>,
    pub claim_token: Option<String>,
    pub last_error: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}
