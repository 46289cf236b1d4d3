//! Channel senders: one implementation per delivery medium behind a single
//! capability trait.
//!
//! Senders report ordinary transport failures as `SendOutcome::Failed`. An
//! `Err` is reserved for misconfiguration. `ChannelRegistry::deliver` folds
//! both, and timeouts, into a `SendOutcome` so callers never abort a batch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::Config;
use crate::db::models::Channel;
use crate::error::AppResult;
use crate::services::template::RenderedMessage;

pub mod http_relay;
pub mod in_app;
pub mod webhook;

pub use http_relay::HttpRelaySender;
pub use in_app::{InAppHub, InAppSender};
pub use webhook::WebhookSender;

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SendOutcome {
    /// Accepted by the transport. `metadata` is stored on the log entry.
    Delivered { metadata: serde_json::Value },
    Failed { error: String },
}

impl SendOutcome {
    pub fn delivered() -> Self {
        SendOutcome::Delivered {
            metadata: serde_json::json!({}),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        SendOutcome::Failed {
            error: error.into(),
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered { .. })
    }
}

#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(
        &self,
        channel: Channel,
        target: &str,
        message: &RenderedMessage,
    ) -> AppResult<SendOutcome>;
}

/// Per-channel senders plus the timeout applied to every call.
pub struct ChannelRegistry {
    email: Arc<dyn ChannelSender>,
    sms: Arc<dyn ChannelSender>,
    push: Arc<dyn ChannelSender>,
    webhook: Arc<dyn ChannelSender>,
    in_app: Arc<dyn ChannelSender>,
    send_timeout: Duration,
}

impl ChannelRegistry {
    pub fn new(
        email: Arc<dyn ChannelSender>,
        sms: Arc<dyn ChannelSender>,
        push: Arc<dyn ChannelSender>,
        webhook: Arc<dyn ChannelSender>,
        in_app: Arc<dyn ChannelSender>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            email,
            sms,
            push,
            webhook,
            in_app,
            send_timeout,
        }
    }

    /// Production wiring: HTTP gateways for email/SMS/push, signed webhooks,
    /// and the in-process realtime hub.
    pub fn from_config(config: &Config, hub: InAppHub) -> AppResult<Self> {
        let channels = &config.channels;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.delivery.send_timeout_seconds))
            .build()
            .map_err(|e| {
                crate::error::AppError::Config(format!("Failed to create HTTP client: {}", e))
            })?;

        let relay = |url: &Option<String>| -> Arc<dyn ChannelSender> {
            Arc::new(HttpRelaySender::new(
                client.clone(),
                url.clone(),
                channels.gateway_api_key.clone(),
                channels.email_from.clone(),
            ))
        };

        Ok(Self::new(
            relay(&channels.email_relay_url),
            relay(&channels.sms_gateway_url),
            relay(&channels.push_gateway_url),
            Arc::new(WebhookSender::new(
                client.clone(),
                channels.webhook_signing_secret.clone(),
            )),
            Arc::new(InAppSender::new(hub)),
            Duration::from_secs(config.delivery.send_timeout_seconds),
        ))
    }

    pub fn sender(&self, channel: Channel) -> &Arc<dyn ChannelSender> {
        match channel {
            Channel::Email => &self.email,
            Channel::Sms => &self.sms,
            Channel::Push => &self.push,
            Channel::Webhook => &self.webhook,
            Channel::InApp => &self.in_app,
        }
    }

    /// Run one send with the configured timeout. Never returns an error.
    pub async fn deliver(
        &self,
        channel: Channel,
        target: &str,
        message: &RenderedMessage,
    ) -> SendOutcome {
        let sender = self.sender(channel);
        match tokio::time::timeout(self.send_timeout, sender.send(channel, target, message)).await
        {
            Ok(Ok(outcome)) => {
                if let SendOutcome::Failed { error } = &outcome {
                    tracing::warn!(channel = %channel, error = %error, "Channel send failed");
                }
                outcome
            }
            Ok(Err(e)) => {
                tracing::error!(channel = %channel, error = %e, "Channel sender error");
                SendOutcome::failed(e.to_string())
            }
            Err(_) => {
                tracing::warn!(
                    channel = %channel,
                    timeout_secs = self.send_timeout.as_secs_f64(),
                    "Channel send timed out"
                );
                SendOutcome::failed(format!(
                    "send timed out after {}ms",
                    self.send_timeout.as_millis()
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    struct Slow;

    #[async_trait]
    impl ChannelSender for Slow {
        async fn send(&self, _: Channel, _: &str, _: &RenderedMessage) -> AppResult<SendOutcome> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(SendOutcome::delivered())
        }
    }

    struct Misconfigured;

    #[async_trait]
    impl ChannelSender for Misconfigured {
        async fn send(&self, _: Channel, _: &str, _: &RenderedMessage) -> AppResult<SendOutcome> {
            Err(AppError::Config("no gateway".to_string()))
        }
    }

    struct Ok200;

    #[async_trait]
    impl ChannelSender for Ok200 {
        async fn send(&self, _: Channel, _: &str, _: &RenderedMessage) -> AppResult<SendOutcome> {
            Ok(SendOutcome::delivered())
        }
    }

    fn message() -> RenderedMessage {
        RenderedMessage {
            tenant_id: "t1".to_string(),
            notification_ids: vec!["n1".to_string()],
            subject: "s".to_string(),
            body: "b".to_string(),
        }
    }

    fn registry() -> ChannelRegistry {
        ChannelRegistry::new(
            Arc::new(Ok200),
            Arc::new(Slow),
            Arc::new(Misconfigured),
            Arc::new(Ok200),
            Arc::new(Ok200),
            Duration::from_millis(20),
        )
    }

    #[tokio::test]
    async fn deliver_routes_by_channel() {
        let outcome = registry().deliver(Channel::Email, "a@b.c", &message()).await;
        assert!(outcome.is_delivered());
    }

    #[tokio::test]
    async fn deliver_converts_timeout_into_failure() {
        let outcome = registry().deliver(Channel::Sms, "+1555", &message()).await;
        match outcome {
            SendOutcome::Failed { error } => assert!(error.contains("timed out")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn deliver_converts_sender_error_into_failure() {
        let outcome = registry().deliver(Channel::Push, "token", &message()).await;
        assert!(matches!(outcome, SendOutcome::Failed { .. }));
    }
}
