use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use super::{ChannelSender, SendOutcome};
use crate::db::models::Channel;
use crate::error::{AppError, AppResult};
use crate::services::template::RenderedMessage;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature";

/// POSTs a JSON envelope to the subscriber's URL, signed with HMAC-SHA256
/// when a secret is configured.
pub struct WebhookSender {
    client: reqwest::Client,
    secret: Option<String>,
}

#[derive(Serialize)]
struct WebhookEnvelope<'a> {
    tenant_id: &'a str,
    notification_ids: &'a [String],
    subject: &'a str,
    body: &'a str,
}

impl WebhookSender {
    pub fn new(client: reqwest::Client, secret: Option<String>) -> Self {
        Self { client, secret }
    }
}

/// `sha256=<hex>` over the raw body.
pub fn sign_body(secret: &str, body: &[u8]) -> AppResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AppError::Internal(anyhow::anyhow!("Failed to create HMAC")))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[async_trait]
impl ChannelSender for WebhookSender {
    async fn send(
        &self,
        _channel: Channel,
        target: &str,
        message: &RenderedMessage,
    ) -> AppResult<SendOutcome> {
        let url = match url::Url::parse(target) {
            Ok(u) if matches!(u.scheme(), "http" | "https") => u,
            _ => return Ok(SendOutcome::failed(format!("invalid webhook URL: {}", target))),
        };

        let body = serde_json::to_vec(&WebhookEnvelope {
            tenant_id: &message.tenant_id,
            notification_ids: &message.notification_ids,
            subject: &message.subject,
            body: &message.body,
        })?;

        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = &self.secret {
            request = request.header(SIGNATURE_HEADER, sign_body(secret, &body)?);
        }

        match request.body(body).send().await {
            Ok(response) if response.status().is_success() => Ok(SendOutcome::Delivered {
                metadata: serde_json::json!({ "http_status": response.status().as_u16() }),
            }),
            Ok(response) => Ok(SendOutcome::failed(format!(
                "webhook returned {}",
                response.status()
            ))),
            Err(e) => Ok(SendOutcome::failed(format!("webhook request failed: {}", e))),
        }
    }
}
