use async_trait::async_trait;
use serde::Serialize;

use super::{ChannelSender, SendOutcome};
use crate::db::models::Channel;
use crate::error::{AppError, AppResult};
use crate::services::template::RenderedMessage;

/// Email, SMS and push delivery through an HTTP gateway that owns the actual
/// transport (SMTP relay, SMS provider, push service).
pub struct HttpRelaySender {
    client: reqwest::Client,
    endpoint: Option<String>,
    api_key: Option<String>,
    from: Option<String>,
}

#[derive(Serialize)]
struct RelayPayload<'a> {
    channel: Channel,
    to: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<&'a str>,
    subject: &'a str,
    body: &'a str,
    tenant_id: &'a str,
    notification_ids: &'a [String],
}

impl HttpRelaySender {
    pub fn new(
        client: reqwest::Client,
        endpoint: Option<String>,
        api_key: Option<String>,
        from: Option<String>,
    ) -> Self {
        Self {
            client,
            endpoint,
            api_key,
            from,
        }
    }
}

#[async_trait]
impl ChannelSender for HttpRelaySender {
    async fn send(
        &self,
        channel: Channel,
        target: &str,
        message: &RenderedMessage,
    ) -> AppResult<SendOutcome> {
        let endpoint = self.endpoint.as_deref().ok_or_else(|| {
            AppError::Config(format!("no gateway URL configured for channel {}", channel))
        })?;

        let payload = RelayPayload {
            channel,
            to: target,
            from: match channel {
                Channel::Email => self.from.as_deref(),
                _ => None,
            },
            subject: &message.subject,
            body: &message.body,
            tenant_id: &message.tenant_id,
            notification_ids: &message.notification_ids,
        };

        let mut request = self.client.post(endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                return Ok(SendOutcome::failed(format!("gateway request failed: {}", e)));
            }
        };

        let status = response.status();
        if status.is_success() {
            Ok(SendOutcome::Delivered {
                metadata: serde_json::json!({ "gateway_status": status.as_u16() }),
            })
        } else {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(channel = %channel, status = %status, body = %body, "Gateway rejected message");
            Ok(SendOutcome::failed(format!(
                "gateway returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_gateway_is_a_configuration_error() {
        let sender = HttpRelaySender::new(reqwest::Client::new(), None, None, None);
        let message = RenderedMessage {
            tenant_id: "t1".to_string(),
            notification_ids: vec![],
            subject: "s".to_string(),
            body: "b".to_string(),
        };
        let result = sender.send(Channel::Sms, "+15550100", &message).await;
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn payload_shape() {
        let ids = vec!["n1".to_string()];
        let payload = RelayPayload {
            channel: Channel::Email,
            to: "tech@example.com",
            from: None,
            subject: "Pump overdue",
            body: "PM is 3 days late",
            tenant_id: "t1",
            notification_ids: &ids,
        };
        let v = serde_json::to_value(&payload).unwrap();
        assert_eq!(v["channel"], "email");
        assert_eq!(v["to"], "tech@example.com");
        assert!(v.get("from").is_none());
    }
}
