//! Plain placeholder substitution for notification text and digest bodies.

use crate::db::models::Notification;
use crate::i18n;

/// Rendered text handed to a channel sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub tenant_id: String,
    /// Notifications covered by this message; more than one for a digest.
    pub notification_ids: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// Normalize placeholders in a message template.
/// Converts occurrences like `{{asset}}` into `{asset}`.
fn normalize_placeholders(msg: &str) -> String {
    let mut result = String::with_capacity(msg.len());
    let mut start = 0usize;

    while let Some(open_rel) = msg[start..].find("{{") {
        let open = start + open_rel;
        if let Some(close_rel) = msg[open + 2..].find("}}") {
            let close = open + 2 + close_rel;
            result.push_str(&msg[start..open]);
            result.push('{');
            result.push_str(msg[open + 2..close].trim());
            result.push('}');
            start = close + 2;
        } else {
            result.push_str(&msg[start..]);
            return result;
        }
    }

    result.push_str(&msg[start..]);
    result
}

/// Substitute `{key}` / `{{key}}` placeholders with values from a JSON object.
///
/// Strings are inserted verbatim, other scalars via their JSON form. Unknown
/// placeholders are left in place.
pub fn render_template(text: &str, context: Option<&serde_json::Value>) -> String {
    let Some(serde_json::Value::Object(map)) = context else {
        return text.to_string();
    };

    let mut rendered = normalize_placeholders(text);
    for (key, value) in map {
        let replacement = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        };
        rendered = rendered.replace(&format!("{{{}}}", key), &replacement);
    }
    rendered
}

/// Message for a single immediate delivery.
pub fn render_notification(notification: &Notification) -> RenderedMessage {
    RenderedMessage {
        tenant_id: notification.tenant_id.clone(),
        notification_ids: vec![notification.id.clone()],
        subject: notification.title.clone(),
        body: notification.message.clone(),
    }
}

/// Number of notifications listed individually in a digest body.
const DIGEST_MAX_LINES: usize = 20;

/// One combined message for a batch of deferred notifications.
pub fn render_digest(tenant_id: &str, notifications: &[Notification]) -> RenderedMessage {
    let count = notifications.len().to_string();
    let subject = i18n::t_with("digest.subject", &[("count", &count)]);

    let mut lines: Vec<String> = notifications
        .iter()
        .take(DIGEST_MAX_LINES)
        .map(|n| {
            i18n::t_with(
                "digest.line",
                &[("severity", n.severity.as_str()), ("title", &n.title)],
            )
        })
        .collect();

    if notifications.len() > DIGEST_MAX_LINES {
        let more = (notifications.len() - DIGEST_MAX_LINES).to_string();
        lines.push(i18n::t_with("digest.more", &[("more", &more)]));
    }

    RenderedMessage {
        tenant_id: tenant_id.to_string(),
        notification_ids: notifications.iter().map(|n| n.id.clone()).collect(),
        subject,
        body: lines.join("\n"),
    }
}
