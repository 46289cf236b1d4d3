use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;
use futures::stream::{self, StreamExt};

use super::{ChannelRouting, DeliveryEngine, DispatchReport};
use crate::db::models::{
    Channel, CreateDeliveryLog, CreateNotification, DeliveryStatus, Notification, Recipient,
    Subscription,
};
use crate::db::{
    DeliveryLogRepository, DigestQueueRepository, NotificationRepository, SubscriptionRepository,
};
use crate::error::{AppError, AppResult};
use crate::i18n;
use crate::services::channels::SendOutcome;
use crate::services::quiet_hours::{is_within_quiet_hours, next_digest_boundary};
use crate::services::template::{render_notification, render_template};

impl DeliveryEngine {
    /// Trigger entry point: store the notification with its text rendered,
    /// then run the first routing pass. Retries and digests happen later.
    pub async fn create_notification(
        &self,
        mut request: CreateNotification,
        now: NaiveDateTime,
    ) -> AppResult<DispatchReport> {
        request.tenant_id = request.tenant_id.trim().to_string();
        request.category = request.category.trim().to_string();
        if request.tenant_id.is_empty() {
            return Err(AppError::Validation(i18n::t("validation.tenant_required")));
        }
        if request.category.is_empty() {
            return Err(AppError::Validation("category is required".to_string()));
        }
        if request.title.trim().is_empty() {
            return Err(AppError::Validation("title is required".to_string()));
        }

        let context = request.template_context.as_ref();
        request.title = render_template(&request.title, context);
        request.message = render_template(&request.message, context);

        let notification = NotificationRepository::create(&self.pool, &request, now).await?;
        tracing::info!(
            "Created notification {} (tenant={}, category={}, severity={})",
            notification.id,
            notification.tenant_id,
            notification.category,
            notification.severity.as_str()
        );

        self.dispatch(notification, now).await
    }

    /// Route a stored notification to every matching (subscription, channel)
    /// pair. Pairs that already have a log entry are left alone, so calling
    /// this twice does not send twice.
    pub async fn dispatch(
        &self,
        notification: Notification,
        now: NaiveDateTime,
    ) -> AppResult<DispatchReport> {
        let candidates = self.resolve_candidates(&notification).await?;

        let already_routed: HashSet<(String, Channel)> =
            DeliveryLogRepository::list_for_notification(&self.pool, &notification.id)
                .await?
                .into_iter()
                .map(|e| (e.subscription_id, e.channel))
                .collect();

        let mut pairs: Vec<(Subscription, Channel)> = Vec::new();
        for subscription in &candidates {
            for channel in subscription.channels.iter().copied() {
                if already_routed.contains(&(subscription.id.clone(), channel)) {
                    tracing::debug!(
                        "Notification {} already routed to subscription {} on {}",
                        notification.id,
                        subscription.id,
                        channel
                    );
                    continue;
                }
                pairs.push((subscription.clone(), channel));
            }
        }

        tracing::info!(
            "Dispatching notification {}: {} subscription(s), {} channel pair(s)",
            notification.id,
            candidates.len(),
            pairs.len()
        );

        // Items are owned so the fan-out future stays Send under the HTTP handler.
        let n = &notification;
        let results: Vec<AppResult<ChannelRouting>> = stream::iter(pairs)
            .map(|(subscription, channel)| async move {
                self.route(n, &subscription, channel, now).await
            })
            .buffer_unordered(self.settings.concurrency)
            .collect()
            .await;

        let mut routes = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(route) => routes.push(route),
                Err(e) => tracing::error!(
                    "Failed to record routing for notification {}: {}",
                    notification.id,
                    e
                ),
            }
        }
        routes.sort_by(|a, b| {
            (a.subscription_id.as_str(), a.channel.as_str())
                .cmp(&(b.subscription_id.as_str(), b.channel.as_str()))
        });

        let notification = self
            .refresh_delivery_state(&notification.id, now)
            .await?
            .unwrap_or(notification);

        Ok(DispatchReport {
            notification,
            routes,
        })
    }

    /// Subscriptions in the tenant that listen for the category and whose
    /// recipient covers the notification's user, directly or via a group.
    async fn resolve_candidates(&self, notification: &Notification) -> AppResult<Vec<Subscription>> {
        let subscriptions = SubscriptionRepository::find_for_event(
            &self.pool,
            &notification.tenant_id,
            &notification.category,
        )
        .await?;

        let Some(user) = notification.recipient_user_id.as_deref() else {
            return Ok(subscriptions);
        };

        let mut groups: HashMap<String, bool> = HashMap::new();
        let mut matched = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            let is_match = match subscription.recipient() {
                Recipient::User(id) => id == user,
                Recipient::Group(group) => match groups.get(&group).copied() {
                    Some(m) => m,
                    None => {
                        let m = match self
                            .directory
                            .resolve_group_members(&notification.tenant_id, &group)
                            .await
                        {
                            Ok(members) => members.iter().any(|m| m == user),
                            Err(e) => {
                                tracing::warn!(
                                    "Group lookup failed for {} in tenant {}: {}",
                                    group,
                                    notification.tenant_id,
                                    e
                                );
                                false
                            }
                        };
                        groups.insert(group, m);
                        m
                    }
                },
            };
            if is_match {
                matched.push(subscription);
            }
        }
        Ok(matched)
    }

    async fn route(
        &self,
        notification: &Notification,
        subscription: &Subscription,
        channel: Channel,
        now: NaiveDateTime,
    ) -> AppResult<ChannelRouting> {
        let quiet = subscription
            .quiet_hours()
            .map(|w| is_within_quiet_hours(&w, now, subscription.timezone.as_deref()))
            .unwrap_or(false);

        let mut log = CreateDeliveryLog {
            notification_id: notification.id.clone(),
            subscription_id: subscription.id.clone(),
            channel,
            attempt: 1,
            status: DeliveryStatus::Pending,
            event_name: notification.category.clone(),
            target: None,
            next_attempt_at: None,
            metadata: serde_json::json!({}),
            error_message: None,
        };
        let mut deliver_at = None;

        if quiet {
            let digest = subscription.digest();
            if digest.enabled {
                let due = next_digest_boundary(digest.frequency, now, subscription.timezone.as_deref());
                let entry = DigestQueueRepository::append_or_create(
                    &self.pool,
                    &notification.tenant_id,
                    &subscription.id,
                    channel,
                    &notification.id,
                    due,
                    now,
                )
                .await?;
                tracing::debug!(
                    "Deferred notification {} into digest {} ({} due {})",
                    notification.id,
                    entry.id,
                    channel,
                    entry.deliver_at
                );
                log.status = DeliveryStatus::Deferred;
                log.metadata = serde_json::json!({
                    "digest_id": entry.id,
                    "deliver_at": entry.deliver_at,
                });
                deliver_at = Some(entry.deliver_at);
            } else {
                log.status = DeliveryStatus::Queued;
                log.metadata = serde_json::json!({ "reason": "quiet_hours" });
            }
        } else {
            let recipient = Self::delivery_recipient(notification, subscription);
            let message = render_notification(notification);
            let (target, outcome) = self
                .resolve_and_send(
                    &notification.tenant_id,
                    subscription,
                    &recipient,
                    channel,
                    &message,
                )
                .await;
            log.target = target;
            match outcome {
                SendOutcome::Delivered { metadata } => {
                    log.status = DeliveryStatus::Sent;
                    log.metadata = metadata;
                }
                SendOutcome::Failed { error } => {
                    log.status = DeliveryStatus::Failed;
                    log.next_attempt_at = self.next_attempt_at(1, now);
                    log.error_message = Some(error);
                }
            }
        }

        let routing = ChannelRouting {
            subscription_id: subscription.id.clone(),
            channel,
            status: log.status,
            attempt: log.attempt,
            target: log.target.clone(),
            next_attempt_at: log.next_attempt_at,
            deliver_at,
            error: log.error_message.clone(),
        };

        if DeliveryLogRepository::record(&self.pool, log, now).await?.is_none() {
            tracing::debug!(
                "Attempt 1 for notification {} / subscription {} / {} was recorded concurrently",
                notification.id,
                subscription.id,
                channel
            );
        }

        Ok(routing)
    }
}
