use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use super::{ChannelSender, SendOutcome};
use crate::db::models::{Channel, Recipient};
use crate::error::AppResult;
use crate::services::template::RenderedMessage;

/// Realtime in-app message pushed to connected clients.
#[derive(Debug, Clone, Serialize)]
pub struct InAppEvent {
    pub tenant_id: String,
    pub recipient: Recipient,
    pub notification_ids: Vec<String>,
    pub subject: String,
    pub body: String,
}

impl InAppEvent {
    /// Whether a listener filtering on `user_id` / `group` should see this.
    /// No filter means every event of the tenant.
    pub fn visible_to(&self, tenant_id: &str, user_id: Option<&str>, group: Option<&str>) -> bool {
        if self.tenant_id != tenant_id {
            return false;
        }
        match (&self.recipient, user_id, group) {
            (_, None, None) => true,
            (Recipient::User(u), Some(want), _) => u == want,
            (Recipient::Group(g), _, Some(want)) => g == want,
            _ => false,
        }
    }
}

/// Fan-out point between the in-app sender and SSE listeners.
#[derive(Clone)]
pub struct InAppHub {
    tx: broadcast::Sender<InAppEvent>,
}

impl InAppHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InAppEvent> {
        self.tx.subscribe()
    }

    /// Returns the number of listeners reached.
    pub fn publish(&self, event: InAppEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }
}

/// In-app targets are `user:<id>` or `group:<id>`.
pub fn in_app_target(recipient: &Recipient) -> String {
    format!("{}:{}", recipient.kind_str(), recipient.id())
}

fn parse_target(target: &str) -> Option<Recipient> {
    let (kind, id) = target.split_once(':')?;
    if id.is_empty() {
        return None;
    }
    match kind {
        "user" => Some(Recipient::User(id.to_string())),
        "group" => Some(Recipient::Group(id.to_string())),
        _ => None,
    }
}

pub struct InAppSender {
    hub: InAppHub,
}

impl InAppSender {
    pub fn new(hub: InAppHub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl ChannelSender for InAppSender {
    async fn send(
        &self,
        _channel: Channel,
        target: &str,
        message: &RenderedMessage,
    ) -> AppResult<SendOutcome> {
        let Some(recipient) = parse_target(target) else {
            return Ok(SendOutcome::failed(format!("invalid in-app target: {}", target)));
        };

        // Nobody listening is fine: the stored notification is the inbox.
        let listeners = self.hub.publish(InAppEvent {
            tenant_id: message.tenant_id.clone(),
            recipient,
            notification_ids: message.notification_ids.clone(),
            subject: message.subject.clone(),
            body: message.body.clone(),
        });

        Ok(SendOutcome::Delivered {
            metadata: serde_json::json!({ "listeners": listeners }),
        })
    }
}
