/*
Embedded message catalogue.

- Messages are compiled in as a flat JSON map.
- `t` looks up a key; `t_with` also substitutes `{name}` placeholders.

Usage:
    let subject = i18n::t_with("digest.subject", &[("count", "3")]);

A missing key falls back to the key itself.
*/

use std::collections::HashMap;
use std::sync::OnceLock;

static MESSAGES: OnceLock<HashMap<String, String>> = OnceLock::new();

const EN_JSON: &str = r#"
{
  "digest.subject": "You have {count} new notifications",
  "digest.line": "[{severity}] {title}",
  "digest.more": "... and {more} more",
  "not_found.notification": "Notification not found",
  "not_found.subscription": "Subscription not found",
  "validation.channels_required": "At least one channel is required",
  "validation.recipient_required": "Recipient id must not be empty",
  "validation.tenant_required": "tenant_id is required",
  "subscription.deleted": "Subscription deleted",
  "app.name": "Facility Notifications"
}
"#;

fn parse_catalogue(raw: &str) -> HashMap<String, String> {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to parse embedded messages");
        HashMap::new()
    })
}

fn messages() -> &'static HashMap<String, String> {
    MESSAGES.get_or_init(|| parse_catalogue(EN_JSON))
}

pub fn t(key: &str) -> String {
    messages()
        .get(key)
        .cloned()
        .unwrap_or_else(|| key.to_string())
}

pub fn t_with(key: &str, params: &[(&str, &str)]) -> String {
    params
        .iter()
        .fold(t(key), |s, (k, v)| s.replace(&format!("{{{}}}", k), v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_t_basic() {
        assert_eq!(t("not_found.subscription"), "Subscription not found");
    }

    #[test]
    fn test_t_with_params() {
        let s = t_with("digest.line", &[("severity", "critical"), ("title", "Boiler trip")]);
        assert_eq!(s, "[critical] Boiler trip");
        assert_eq!(
            t_with("digest.subject", &[("count", "4")]),
            "You have 4 new notifications"
        );
    }

    #[test]
    fn missing_key_returns_key() {
        let k = "non.existent.key";
        assert_eq!(t(k), k.to_string());
    }

    #[test]
    fn embedded_catalogue_parses() {
        assert!(messages().len() >= 10);
    }
}
