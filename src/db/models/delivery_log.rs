use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

use super::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
    /// Suppressed by quiet hours and parked in a digest.
    Deferred,
    /// Suppressed by quiet hours with no digest; left for the recipient to pull.
    Queued,
}

/// Immutable record of one delivery attempt for
/// (notification, subscription, channel, attempt).
///
/// Each retry appends a new row with `attempt + 1`. The only columns ever
/// updated after insert are `claimed_at` / `claim_token`, used by the retry
/// sweeper to take ownership of a due failure.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    pub id: String,
    pub notification_id: String,
    pub subscription_id: String,
    pub channel: Channel,
    pub attempt: i32,
    pub status: DeliveryStatus,
    pub event_name: String,
    pub target: Option<String>,
    /// Set only on retryable failures; `None` on a failed row means terminal.
    pub next_attempt_at: Option<NaiveDateTime>,
    pub metadata: Json<serde_json::Value>,
    pub error_message: Option<String>,
    #[serde(skip_serializing)]
    pub claimed_at: Option<NaiveDateTime>,
    #[serde(skip_serializing)]
    pub claim_token: Option<String>,
    pub created_at: NaiveDateTime,
}

impl DeliveryLogEntry {
    pub fn is_terminal_failure(&self) -> bool {
        self.status == DeliveryStatus::Failed && self.next_attempt_at.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct CreateDeliveryLog {
    pub notification_id: String,
    pub subscription_id: String,
    pub channel: Channel,
    pub attempt: i32,
    pub status: DeliveryStatus,
    pub event_name: String,
    pub target: Option<String>,
    pub next_attempt_at: Option<NaiveDateTime>,
    pub metadata: serde_json::Value,
    pub error_message: Option<String>,
}
