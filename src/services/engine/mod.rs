//! Delivery engine: fan-out on creation, retry and digest sweeps, and the
//! aggregate delivery state of a notification.
//!
//! The data store is the only source of truth. Every sweep re-derives what is
//! due from persisted timestamps, claims rows one statement at a time, and
//! never holds a transaction across a channel send.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::db::models::{
    Channel, DeliveryLogEntry, DeliveryState, DeliveryStatus, Notification, Recipient,
    Subscription,
};
use crate::db::{DeliveryLogRepository, NotificationRepository};
use crate::error::AppResult;
use crate::services::backoff::Backoff;
use crate::services::channels::{ChannelRegistry, SendOutcome};
use crate::services::directory::RecipientDirectory;
use crate::services::template::RenderedMessage;

mod digest_sweeper;
mod dispatcher;
mod retry_sweeper;

#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub backoff: Backoff,
    /// Attempts per (notification, subscription, channel), the first included.
    pub max_attempts: u32,
    pub claim_lease: chrono::Duration,
    pub batch_size: i64,
    pub concurrency: usize,
}

impl DeliverySettings {
    pub fn from_config(cfg: &DeliveryConfig) -> Self {
        Self {
            backoff: Backoff::from_config(cfg),
            max_attempts: cfg.max_attempts.max(1),
            claim_lease: chrono::Duration::seconds(cfg.claim_lease_seconds as i64),
            batch_size: cfg.sweep_batch_size as i64,
            concurrency: (cfg.worker_concurrency as usize).max(1),
        }
    }
}

/// How one (subscription, channel) pair was routed.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelRouting {
    pub subscription_id: String,
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub attempt: i32,
    pub target: Option<String>,
    pub next_attempt_at: Option<NaiveDateTime>,
    /// Set for deferred pairs: when the digest is due.
    pub deliver_at: Option<NaiveDateTime>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub notification: Notification,
    pub routes: Vec<ChannelRouting>,
}

/// Counters for one sweep tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub claimed: usize,
    pub sent: usize,
    /// Failed, another attempt scheduled.
    pub failed: usize,
    /// Failed with no attempts left.
    pub exhausted: usize,
    /// Work whose notification or subscription disappeared.
    pub dropped: usize,
    /// Another worker recorded the same attempt first.
    pub conflicts: usize,
    pub errors: usize,
}

pub struct DeliveryEngine {
    pool: SqlitePool,
    channels: Arc<ChannelRegistry>,
    directory: Arc<dyn RecipientDirectory>,
    settings: DeliverySettings,
    worker_id: String,
}

impl DeliveryEngine {
    pub fn new(
        pool: SqlitePool,
        channels: Arc<ChannelRegistry>,
        directory: Arc<dyn RecipientDirectory>,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            pool,
            channels,
            directory,
            settings,
            worker_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn settings(&self) -> &DeliverySettings {
        &self.settings
    }

    /// Unique per sweep tick so a stale worker can never complete a row that
    /// was re-claimed after its lease expired.
    fn claim_token(&self) -> String {
        format!("{}:{}", self.worker_id, Uuid::new_v4())
    }

    fn lease_cutoff(&self, now: NaiveDateTime) -> NaiveDateTime {
        now - self.settings.claim_lease
    }

    /// `None` once `attempt` is the last allowed one.
    fn next_attempt_at(&self, attempt: i32, now: NaiveDateTime) -> Option<NaiveDateTime> {
        let attempt = attempt.max(0) as u32;
        (attempt < self.settings.max_attempts)
            .then(|| self.settings.backoff.next_attempt_at(attempt, now))
    }

    /// The notification's own recipient when it has one, otherwise whoever
    /// the subscription names (tenant-wide notification).
    fn delivery_recipient(notification: &Notification, subscription: &Subscription) -> Recipient {
        match &notification.recipient_user_id {
            Some(user) => Recipient::User(user.clone()),
            None => subscription.recipient(),
        }
    }

    /// Webhook subscriptions carry their own URL; everything else goes
    /// through the directory.
    async fn resolve_target(
        &self,
        tenant_id: &str,
        subscription: &Subscription,
        recipient: &Recipient,
        channel: Channel,
    ) -> AppResult<Option<String>> {
        if channel == Channel::Webhook {
            if let Some(url) = subscription.webhook_url.as_deref().filter(|u| !u.is_empty()) {
                return Ok(Some(url.to_string()));
            }
        }
        self.directory
            .resolve_target(tenant_id, recipient, channel)
            .await
    }

    /// Resolve and send, folding lookup problems into a failed outcome so
    /// they are retried like transport failures.
    async fn resolve_and_send(
        &self,
        tenant_id: &str,
        subscription: &Subscription,
        recipient: &Recipient,
        channel: Channel,
        message: &RenderedMessage,
    ) -> (Option<String>, SendOutcome) {
        match self
            .resolve_target(tenant_id, subscription, recipient, channel)
            .await
        {
            Ok(Some(target)) => {
                let outcome = self.channels.deliver(channel, &target, message).await;
                (Some(target), outcome)
            }
            Ok(None) => (
                None,
                SendOutcome::failed(format!(
                    "no delivery target for {} {} on {}",
                    recipient.kind_str(),
                    recipient.id(),
                    channel
                )),
            ),
            Err(e) => {
                tracing::warn!(
                    "Target lookup failed for subscription {} channel {}: {}",
                    subscription.id,
                    channel,
                    e
                );
                (None, SendOutcome::failed(format!("target lookup failed: {}", e)))
            }
        }
    }

    /// Recompute and persist the aggregate state from the delivery log.
    /// Returns the stored notification afterwards.
    pub async fn refresh_delivery_state(
        &self,
        notification_id: &str,
        now: NaiveDateTime,
    ) -> AppResult<Option<Notification>> {
        let entries = DeliveryLogRepository::list_for_notification(&self.pool, notification_id).await?;
        let state = aggregate_delivery_state(&entries);
        if state != DeliveryState::Pending {
            let changed =
                NotificationRepository::update_delivery_state(&self.pool, notification_id, state, now)
                    .await?;
            if changed {
                tracing::info!("Notification {} is now {}", notification_id, state.as_str());
            }
        }
        NotificationRepository::find_by_id(&self.pool, notification_id).await
    }
}

/// Aggregate state over a notification's delivery log.
///
/// `sent` if any (subscription, channel) reached `sent`; `failed` when every
/// pair's latest attempt is a terminal failure; `pending` otherwise,
/// including when there are no entries at all.
pub fn aggregate_delivery_state(entries: &[DeliveryLogEntry]) -> DeliveryState {
    if entries.iter().any(|e| e.status == DeliveryStatus::Sent) {
        return DeliveryState::Sent;
    }

    let mut latest: HashMap<(&str, Channel), &DeliveryLogEntry> = HashMap::new();
    for entry in entries {
        let key = (entry.subscription_id.as_str(), entry.channel);
        match latest.get(&key) {
            Some(current) if current.attempt >= entry.attempt => {}
            _ => {
                latest.insert(key, entry);
            }
        }
    }

    if !latest.is_empty() && latest.values().all(|e| e.is_terminal_failure()) {
        DeliveryState::Failed
    } else {
        DeliveryState::Pending
    }
}
