use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

/// Severity attached to a notification by the triggering business event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// Aggregate delivery outcome across every (subscription, channel) pair.
///
/// Only moves forward: `pending -> sent | failed`, and `failed -> sent` if a
/// late retry succeeds. A `sent` notification is never downgraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DeliveryState {
    #[default]
    Pending,
    Sent,
    Failed,
}

impl DeliveryState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Sent => "sent",
            DeliveryState::Failed => "failed",
        }
    }
}

/// One record per triggering domain event.
///
/// `title` and `message` hold the rendered text (template context applied at
/// creation) so retries and digests reuse exactly what was first produced.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub tenant_id: String,
    pub recipient_user_id: Option<String>,
    pub related_entity_type: Option<String>,
    pub related_entity_id: Option<String>,
    pub title: String,
    pub message: String,
    /// Semantic event bucket, matched against subscription event names.
    pub category: String,
    pub severity: Severity,
    pub delivery_state: DeliveryState,
    pub template_context: Option<Json<serde_json::Value>>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Input of the trigger API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateNotification {
    pub tenant_id: String,
    #[serde(default)]
    pub recipient_user_id: Option<String>,
    #[serde(default)]
    pub related_entity_type: Option<String>,
    #[serde(default)]
    pub related_entity_id: Option<String>,
    pub category: String,
    #[serde(default)]
    pub severity: Severity,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub template_context: Option<serde_json::Value>,
}
