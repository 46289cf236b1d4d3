use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

use super::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RecipientKind {
    User,
    Group,
}

/// Who a subscription (or a single delivery) is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    User(String),
    Group(String),
}

impl Recipient {
    pub fn kind(&self) -> RecipientKind {
        match self {
            Recipient::User(_) => RecipientKind::User,
            Recipient::Group(_) => RecipientKind::Group,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Recipient::User(id) | Recipient::Group(id) => id,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Recipient::User(_) => "user",
            Recipient::Group(_) => "group",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DigestFrequency {
    Hourly,
    #[default]
    Daily,
    Weekly,
}

/// Time-of-day window in `HH:mm`, kept as raw strings: a malformed window is
/// stored as given and evaluated fail-open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHoursWindow {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DigestPreference {
    pub enabled: bool,
    #[serde(default)]
    pub frequency: DigestFrequency,
}

/// Per-tenant interest of a user or group in a set of event names.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub tenant_id: String,
    pub recipient_kind: RecipientKind,
    pub recipient_id: String,
    pub events: Json<Vec<String>>,
    /// Ordered, non-empty, without duplicates.
    pub channels: Json<Vec<Channel>>,
    pub quiet_hours_start: Option<String>,
    pub quiet_hours_end: Option<String>,
    /// IANA zone used to read quiet hours and digest boundaries; UTC when absent.
    pub timezone: Option<String>,
    pub digest_enabled: bool,
    pub digest_frequency: DigestFrequency,
    /// Target URL for the webhook channel.
    pub webhook_url: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Subscription {
    pub fn recipient(&self) -> Recipient {
        match self.recipient_kind {
            RecipientKind::User => Recipient::User(self.recipient_id.clone()),
            RecipientKind::Group => Recipient::Group(self.recipient_id.clone()),
        }
    }

    /// Both bounds must be present for a window to exist.
    pub fn quiet_hours(&self) -> Option<QuietHoursWindow> {
        match (&self.quiet_hours_start, &self.quiet_hours_end) {
            (Some(start), Some(end)) => Some(QuietHoursWindow {
                start: start.clone(),
                end: end.clone(),
            }),
            _ => None,
        }
    }

    pub fn digest(&self) -> DigestPreference {
        DigestPreference {
            enabled: self.digest_enabled,
            frequency: self.digest_frequency,
        }
    }
}

/// Data required to create or replace a subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertSubscription {
    pub tenant_id: String,
    pub recipient: Recipient,
    #[serde(default)]
    pub events: Vec<String>,
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub quiet_hours: Option<QuietHoursWindow>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub digest: Option<DigestPreference>,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl UpsertSubscription {
    /// Deduplicate channels (first occurrence wins) and events; reject an
    /// empty channel list.
    pub fn normalized(mut self) -> Result<Self, String> {
        let mut channels = Vec::with_capacity(self.channels.len());
        for channel in self.channels {
            if !channels.contains(&channel) {
                channels.push(channel);
            }
        }
        if channels.is_empty() {
            return Err(crate::i18n::t("validation.channels_required"));
        }
        self.channels = channels;

        let mut events: Vec<String> = Vec::with_capacity(self.events.len());
        for event in self.events {
            let event = event.trim().to_string();
            if !event.is_empty() && !events.contains(&event) {
                events.push(event);
            }
        }
        self.events = events;

        if self.recipient.id().trim().is_empty() {
            return Err(crate::i18n::t("validation.recipient_required"));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(channels: Vec<Channel>) -> UpsertSubscription {
        UpsertSubscription {
            tenant_id: "t1".to_string(),
            recipient: Recipient::User("u1".to_string()),
            events: vec!["assigned".into(), " assigned ".into(), "".into()],
            channels,
            quiet_hours: None,
            timezone: None,
            digest: None,
            webhook_url: None,
        }
    }

    #[test]
    fn normalized_keeps_channel_order_and_drops_duplicates() {
        let n = upsert(vec![Channel::Sms, Channel::Email, Channel::Sms])
            .normalized()
            .unwrap();
        assert_eq!(n.channels, vec![Channel::Sms, Channel::Email]);
        assert_eq!(n.events, vec!["assigned".to_string()]);
    }

    #[test]
    fn normalized_rejects_empty_channels() {
        assert!(upsert(vec![]).normalized().is_err());
    }

    #[test]
    fn recipient_json_shape() {
        let r: Recipient = serde_json::from_str(r#"{"kind":"group","id":"technicians"}"#).unwrap();
        assert_eq!(r, Recipient::Group("technicians".to_string()));
        assert_eq!(r.kind(), RecipientKind::Group);
    }
}
