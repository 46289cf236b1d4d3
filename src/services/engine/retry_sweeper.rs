use chrono::NaiveDateTime;
use futures::stream::{self, StreamExt};

use super::{DeliveryEngine, SweepReport};
use crate::db::models::{CreateDeliveryLog, DeliveryLogEntry, DeliveryStatus};
use crate::db::{DeliveryLogRepository, NotificationRepository, SubscriptionRepository};
use crate::error::AppResult;
use crate::services::channels::SendOutcome;
use crate::services::template::render_notification;

/// What happened to one claimed entry.
enum RetryResult {
    Sent,
    Failed,
    Exhausted,
    Dropped,
    Conflict,
}

impl DeliveryEngine {
    /// One retry tick: claim due failures, attempt each once more, and
    /// append the outcome as the next attempt.
    ///
    /// Safe to run concurrently from several workers: an entry is claimed
    /// before it is sent, and the successor row is insert-if-absent.
    pub async fn run_retry_sweep(&self, now: NaiveDateTime) -> AppResult<SweepReport> {
        let token = self.claim_token();
        let claimed = DeliveryLogRepository::fetch_and_claim_due_retries(
            &self.pool,
            now,
            self.settings.max_attempts as i32,
            self.lease_cutoff(now),
            &token,
            self.settings.batch_size,
        )
        .await?;

        let mut report = SweepReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }

        tracing::info!("Retry sweep claimed {} entr(y/ies)", claimed.len());

        let results: Vec<(DeliveryLogEntry, AppResult<RetryResult>)> = stream::iter(claimed)
            .map(|entry| {
                let token = token.as_str();
                async move {
                    let result = self.retry_entry(&entry, now).await;
                    if result.is_err() {
                        // Let the next tick pick it up instead of waiting out the lease.
                        if let Err(e) =
                            DeliveryLogRepository::release_claim(&self.pool, &entry.id, token).await
                        {
                            tracing::warn!("Failed to release claim on {}: {}", entry.id, e);
                        }
                    }
                    (entry, result)
                }
            })
            .buffer_unordered(self.settings.concurrency)
            .collect()
            .await;

        for (entry, result) in results {
            match result {
                Ok(RetryResult::Sent) => report.sent += 1,
                Ok(RetryResult::Failed) => report.failed += 1,
                Ok(RetryResult::Exhausted) => report.exhausted += 1,
                Ok(RetryResult::Dropped) => report.dropped += 1,
                Ok(RetryResult::Conflict) => report.conflicts += 1,
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(
                        "Retry of delivery {} (notification {}) failed: {}",
                        entry.id,
                        entry.notification_id,
                        e
                    );
                }
            }
        }

        tracing::info!(
            sent = report.sent,
            failed = report.failed,
            exhausted = report.exhausted,
            dropped = report.dropped,
            conflicts = report.conflicts,
            errors = report.errors,
            "Retry sweep finished"
        );
        Ok(report)
    }

    async fn retry_entry(&self, entry: &DeliveryLogEntry, now: NaiveDateTime) -> AppResult<RetryResult> {
        let attempt = entry.attempt + 1;
        let mut log = CreateDeliveryLog {
            notification_id: entry.notification_id.clone(),
            subscription_id: entry.subscription_id.clone(),
            channel: entry.channel,
            attempt,
            status: DeliveryStatus::Failed,
            event_name: entry.event_name.clone(),
            target: entry.target.clone(),
            next_attempt_at: None,
            metadata: serde_json::json!({}),
            error_message: None,
        };

        let notification = NotificationRepository::find_by_id(&self.pool, &entry.notification_id).await?;
        let subscription =
            SubscriptionRepository::find_by_id(&self.pool, &entry.subscription_id).await?;

        let (notification, subscription) = match (notification, subscription) {
            (Some(n), Some(s)) => (n, s),
            (n, _) => {
                let missing = if n.is_none() { "notification" } else { "subscription" };
                tracing::warn!(
                    "Giving up on delivery {}: {} no longer exists",
                    entry.id,
                    missing
                );
                log.error_message = Some(format!("{} no longer exists", missing));
                if DeliveryLogRepository::record(&self.pool, log, now).await?.is_none() {
                    return Ok(RetryResult::Conflict);
                }
                if n.is_some() {
                    self.refresh_delivery_state(&entry.notification_id, now).await?;
                }
                return Ok(RetryResult::Dropped);
            }
        };

        // Contacts may have changed since the last attempt.
        let recipient = Self::delivery_recipient(&notification, &subscription);
        let message = render_notification(&notification);
        let (target, outcome) = self
            .resolve_and_send(
                &notification.tenant_id,
                &subscription,
                &recipient,
                entry.channel,
                &message,
            )
            .await;
        log.target = target;

        let result = match outcome {
            SendOutcome::Delivered { metadata } => {
                log.status = DeliveryStatus::Sent;
                log.metadata = metadata;
                RetryResult::Sent
            }
            SendOutcome::Failed { error } => {
                log.next_attempt_at = self.next_attempt_at(attempt, now);
                log.error_message = Some(error);
                if log.next_attempt_at.is_some() {
                    RetryResult::Failed
                } else {
                    tracing::warn!(
                        "Delivery of notification {} to subscription {} on {} exhausted after {} attempts",
                        entry.notification_id,
                        entry.subscription_id,
                        entry.channel,
                        attempt
                    );
                    RetryResult::Exhausted
                }
            }
        };

        if DeliveryLogRepository::record(&self.pool, log, now).await?.is_none() {
            tracing::debug!(
                "Attempt {} for delivery {} already recorded by another worker",
                attempt,
                entry.id
            );
            return Ok(RetryResult::Conflict);
        }

        self.refresh_delivery_state(&entry.notification_id, now).await?;
        Ok(result)
    }
}
