use chrono::NaiveDateTime;
use futures::stream::{self, StreamExt};

use super::{DeliveryEngine, SweepReport};
use crate::db::models::{CreateDeliveryLog, DeliveryStatus, DigestQueueEntry, Notification, Recipient};
use crate::db::{
    DeliveryLogRepository, DigestQueueRepository, NotificationRepository, SubscriptionRepository,
};
use crate::error::AppResult;
use crate::services::channels::SendOutcome;
use crate::services::template::render_digest;

enum FlushResult {
    Sent,
    Rescheduled,
    Dropped,
    LostClaim,
}

impl DeliveryEngine {
    /// One digest tick: claim due entries and send each as a single combined
    /// message. Quiet hours are not re-checked; the schedule already encodes
    /// the recipient's preference.
    pub async fn run_digest_sweep(&self, now: NaiveDateTime) -> AppResult<SweepReport> {
        let token = self.claim_token();
        let claimed = DigestQueueRepository::fetch_and_claim_due(
            &self.pool,
            now,
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

        tracing::info!("Digest sweep claimed {} entr(y/ies)", claimed.len());

        let results: Vec<(String, AppResult<FlushResult>)> = stream::iter(claimed)
            .map(|entry| {
                let token = token.as_str();
                async move {
                    let result = self.flush_entry(&entry, token, now).await;
                    (entry.id, result)
                }
            })
            .buffer_unordered(self.settings.concurrency)
            .collect()
            .await;

        for (entry_id, result) in results {
            match result {
                Ok(FlushResult::Sent) => report.sent += 1,
                Ok(FlushResult::Rescheduled) => report.failed += 1,
                Ok(FlushResult::Dropped) => report.dropped += 1,
                Ok(FlushResult::LostClaim) => report.conflicts += 1,
                Err(e) => {
                    // The entry stays flushing until its lease expires.
                    report.errors += 1;
                    tracing::error!("Digest {} flush failed: {}", entry_id, e);
                }
            }
        }

        tracing::info!(
            sent = report.sent,
            rescheduled = report.failed,
            dropped = report.dropped,
            conflicts = report.conflicts,
            errors = report.errors,
            "Digest sweep finished"
        );
        Ok(report)
    }

    async fn flush_entry(
        &self,
        entry: &DigestQueueEntry,
        token: &str,
        now: NaiveDateTime,
    ) -> AppResult<FlushResult> {
        let Some(subscription) =
            SubscriptionRepository::find_by_id(&self.pool, &entry.subscription_id).await?
        else {
            tracing::warn!(
                "Dropping digest {}: subscription {} no longer exists",
                entry.id,
                entry.subscription_id
            );
            DigestQueueRepository::complete(&self.pool, &entry.id, token).await?;
            return Ok(FlushResult::Dropped);
        };

        let notifications =
            NotificationRepository::find_many_by_ids(&self.pool, &entry.notification_ids).await?;
        if notifications.is_empty() {
            tracing::warn!("Dropping digest {}: no notifications left to deliver", entry.id);
            DigestQueueRepository::complete(&self.pool, &entry.id, token).await?;
            return Ok(FlushResult::Dropped);
        }

        let recipient = digest_recipient(&notifications)
            .unwrap_or_else(|| subscription.recipient());
        let message = render_digest(&entry.tenant_id, &notifications);
        let (target, outcome) = self
            .resolve_and_send(
                &entry.tenant_id,
                &subscription,
                &recipient,
                entry.channel,
                &message,
            )
            .await;

        match outcome {
            SendOutcome::Delivered { metadata } => {
                for notification in &notifications {
                    let log = CreateDeliveryLog {
                        notification_id: notification.id.clone(),
                        subscription_id: subscription.id.clone(),
                        channel: entry.channel,
                        attempt: 0,
                        status: DeliveryStatus::Sent,
                        event_name: notification.category.clone(),
                        target: target.clone(),
                        next_attempt_at: None,
                        metadata: serde_json::json!({
                            "digest_id": entry.id,
                            "batch_size": notifications.len(),
                            "transport": metadata,
                        }),
                        error_message: None,
                    };
                    DeliveryLogRepository::record_next_attempt(&self.pool, log, now).await?;
                }

                if !DigestQueueRepository::complete(&self.pool, &entry.id, token).await? {
                    tracing::warn!("Digest {} was re-claimed before completion", entry.id);
                }
                for notification in &notifications {
                    self.refresh_delivery_state(&notification.id, now).await?;
                }

                tracing::info!(
                    "Digest {} delivered {} notification(s) on {}",
                    entry.id,
                    notifications.len(),
                    entry.channel
                );
                Ok(FlushResult::Sent)
            }
            SendOutcome::Failed { error } => {
                let failures = (entry.attempts.max(0) as u32) + 1;
                let deliver_at = self.settings.backoff.next_attempt_at(failures, now);
                let released = DigestQueueRepository::release_after_failure(
                    &self.pool, entry, token, deliver_at, &error, now,
                )
                .await?;
                if !released {
                    return Ok(FlushResult::LostClaim);
                }
                tracing::warn!(
                    "Digest {} failed ({} failure(s)), rescheduled for {}: {}",
                    entry.id,
                    failures,
                    deliver_at,
                    error
                );
                Ok(FlushResult::Rescheduled)
            }
        }
    }
}

/// The shared user when every batched notification targets the same one.
fn digest_recipient(notifications: &[Notification]) -> Option<Recipient> {
    let first = notifications.first()?.recipient_user_id.as_ref()?;
    notifications
        .iter()
        .all(|n| n.recipient_user_id.as_ref() == Some(first))
        .then(|| Recipient::User(first.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{
        Channel, DeliveryState, DigestFrequency, DigestPreference, DigestStatus, QuietHoursWindow,
    };
    use crate::test_support::{at, subscription_input, TestHarness};

    fn digest_subscription(channels: Vec<Channel>) -> crate::db::models::UpsertSubscription {
        let mut input = subscription_input("u1", channels);
        input.quiet_hours = Some(QuietHoursWindow {
            start: "00:00".to_string(),
            end: "23:59".to_string(),
        });
        input.digest = Some(DigestPreference {
            enabled: true,
            frequency: DigestFrequency::Hourly,
        });
        input
    }

    #[tokio::test]
    async fn two_deferrals_flush_as_one_send() {
        let h = TestHarness::new().await;
        let sub = h.subscribe(digest_subscription(vec![Channel::Email])).await;

        let first = h
            .engine
            .create_notification(h.request("u1", "assigned"), at(10, 0))
            .await
            .unwrap();
        let second = h
            .engine
            .create_notification(h.request("u1", "assigned"), at(10, 20))
            .await
            .unwrap();

        let open = DigestQueueRepository::list_for_subscription(&h.pool, &sub.id)
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].notification_ids.len(), 2);

        let sweep = h.engine.run_digest_sweep(at(11, 5)).await.unwrap();
        assert_eq!(sweep.sent, 1);

        let calls = h.sender.calls();
        assert_eq!(calls.len(), 1);
        let ids = &calls[0].2.notification_ids;
        assert!(ids.contains(&first.notification.id));
        assert!(ids.contains(&second.notification.id));

        for id in [&first.notification.id, &second.notification.id] {
            let log = DeliveryLogRepository::list_for_notification(&h.pool, id).await.unwrap();
            let sent: Vec<_> = log.iter().filter(|e| e.status == DeliveryStatus::Sent).collect();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].attempt, 2);
        }
        assert!(DigestQueueRepository::list_for_subscription(&h.pool, &sub.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn nothing_is_flushed_before_deliver_at() {
        let h = TestHarness::new().await;
        h.subscribe(digest_subscription(vec![Channel::Email])).await;
        h.engine
            .create_notification(h.request("u1", "assigned"), at(10, 0))
            .await
            .unwrap();

        let sweep = h.engine.run_digest_sweep(at(10, 59)).await.unwrap();
        assert_eq!(sweep.claimed, 0);
        assert!(h.sender.calls().is_empty());
    }

    #[tokio::test]
    async fn end_to_end_quiet_hours_digest() {
        let h = TestHarness::new().await;
        let sub = h
            .subscribe(digest_subscription(vec![Channel::Email, Channel::InApp]))
            .await;

        let report = h
            .engine
            .create_notification(h.request("u1", "assigned"), at(10, 0))
            .await
            .unwrap();
        let id = report.notification.id.clone();

        let queued = DigestQueueRepository::list_for_subscription(&h.pool, &sub.id)
            .await
            .unwrap();
        assert_eq!(queued.len(), 2);
        assert!(queued.iter().all(|e| e.deliver_at == at(11, 0)));

        let log = DeliveryLogRepository::list_for_notification(&h.pool, &id).await.unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|e| e.status == DeliveryStatus::Deferred));
        assert_eq!(report.notification.delivery_state, DeliveryState::Pending);

        let sweep = h.engine.run_digest_sweep(at(11, 5)).await.unwrap();
        assert_eq!(sweep.claimed, 2);
        assert_eq!(h.sender.calls().len(), 2);

        let log = DeliveryLogRepository::list_for_notification(&h.pool, &id).await.unwrap();
        assert_eq!(log.iter().filter(|e| e.status == DeliveryStatus::Sent).count(), 2);
        for channel in [Channel::Email, Channel::InApp] {
            assert!(DigestQueueRepository::find_open(&h.pool, &sub.id, channel)
                .await
                .unwrap()
                .is_none());
        }

        let stored = NotificationRepository::find_by_id(&h.pool, &id).await.unwrap().unwrap();
        assert_eq!(stored.delivery_state, DeliveryState::Sent);
    }

    #[tokio::test]
    async fn failed_flush_is_rescheduled_with_ids_intact() {
        let h = TestHarness::new().await;
        h.sender.set_failing(true);
        let sub = h.subscribe(digest_subscription(vec![Channel::Sms])).await;
        let report = h
            .engine
            .create_notification(h.request("u1", "assigned"), at(10, 0))
            .await
            .unwrap();

        let sweep = h.engine.run_digest_sweep(at(11, 0)).await.unwrap();
        assert_eq!(sweep.failed, 1);

        let entry = DigestQueueRepository::find_open(&h.pool, &sub.id, Channel::Sms)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, DigestStatus::Open);
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.deliver_at, at(11, 1));
        assert_eq!(entry.notification_ids.0, vec![report.notification.id.clone()]);
        assert!(entry.last_error.is_some());

        // New deferrals keep joining the rescheduled entry.
        h.engine
            .create_notification(h.request("u1", "assigned"), at(11, 0))
            .await
            .unwrap();
        let entry = DigestQueueRepository::find_open(&h.pool, &sub.id, Channel::Sms)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.notification_ids.len(), 2);

        h.sender.set_failing(false);
        let sweep = h.engine.run_digest_sweep(at(11, 2)).await.unwrap();
        assert_eq!(sweep.sent, 1);
    }

    #[tokio::test]
    async fn deferral_during_flush_opens_a_new_entry_and_failure_merges_back() {
        let h = TestHarness::new().await;
        let sub = h.subscribe(digest_subscription(vec![Channel::Email])).await;
        let first = h
            .engine
            .create_notification(h.request("u1", "assigned"), at(10, 0))
            .await
            .unwrap();

        let claimed = DigestQueueRepository::fetch_and_claim_due(
            &h.pool,
            at(11, 0),
            at(10, 55),
            "flusher",
            10,
        )
        .await
        .unwrap();
        assert_eq!(claimed.len(), 1);

        let second = h
            .engine
            .create_notification(h.request("u1", "assigned"), at(11, 0))
            .await
            .unwrap();
        let all = DigestQueueRepository::list_for_subscription(&h.pool, &sub.id)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let released = DigestQueueRepository::release_after_failure(
            &h.pool,
            &claimed[0],
            "flusher",
            at(11, 1),
            "relay down",
            at(11, 0),
        )
        .await
        .unwrap();
        assert!(released);

        let all = DigestQueueRepository::list_for_subscription(&h.pool, &sub.id)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(
            all[0].notification_ids.0,
            vec![first.notification.id.clone(), second.notification.id.clone()]
        );
        assert_eq!(all[0].deliver_at, at(11, 1));
        assert_eq!(all[0].attempts, 1);
    }

    #[tokio::test]
    async fn digest_for_deleted_subscription_is_dropped() {
        let h = TestHarness::new().await;
        let sub = h.subscribe(digest_subscription(vec![Channel::Email])).await;
        h.engine
            .create_notification(h.request("u1", "assigned"), at(10, 0))
            .await
            .unwrap();

        SubscriptionRepository::delete(&h.pool, "t1", &sub.id).await.unwrap();
        let sweep = h.engine.run_digest_sweep(at(11, 5)).await.unwrap();
        assert_eq!(sweep.dropped, 1);
        assert!(h.sender.calls().is_empty());
        assert!(DigestQueueRepository::list_for_subscription(&h.pool, &sub.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn concurrent_digest_sweeps_send_once() {
        let h = TestHarness::new().await;
        h.subscribe(digest_subscription(vec![Channel::Email, Channel::Push]))
            .await;
        h.engine
            .create_notification(h.request("u1", "assigned"), at(10, 0))
            .await
            .unwrap();

        let other = h.second_engine();
        let (a, b) = tokio::join!(
            h.engine.run_digest_sweep(at(11, 5)),
            other.run_digest_sweep(at(11, 5))
        );
        assert_eq!(a.unwrap().claimed + b.unwrap().claimed, 2);
        assert_eq!(h.sender.calls().len(), 2);
    }
}
