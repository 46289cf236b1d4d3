//! Shared fixtures for async tests: an in-memory database, a recording
//! channel sender and a ready-to-use engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db::models::{Channel, CreateNotification, Recipient, Subscription, UpsertSubscription};
use crate::db::{DirectoryRepository, SubscriptionRepository};
use crate::error::AppResult;
use crate::services::channels::{ChannelRegistry, ChannelSender, SendOutcome};
use crate::services::directory::SqlDirectory;
use crate::services::engine::{DeliveryEngine, DeliverySettings};
use crate::services::template::RenderedMessage;

/// 2026-03-04 (a Wednesday) at `h:m` UTC.
pub fn at(h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 3, 4)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
}

pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

/// Records every call; fails every call while `failing` is set.
#[derive(Default)]
pub struct FakeSender {
    failing: AtomicBool,
    calls: Mutex<Vec<(Channel, String, RenderedMessage)>>,
}

impl FakeSender {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(Channel, String, RenderedMessage)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelSender for FakeSender {
    async fn send(
        &self,
        channel: Channel,
        target: &str,
        message: &RenderedMessage,
    ) -> AppResult<SendOutcome> {
        self.calls
            .lock()
            .unwrap()
            .push((channel, target.to_string(), message.clone()));
        // Give concurrent sweeps a chance to interleave.
        tokio::task::yield_now().await;
        if self.failing.load(Ordering::SeqCst) {
            Ok(SendOutcome::failed("gateway unavailable"))
        } else {
            Ok(SendOutcome::delivered())
        }
    }
}

pub fn subscription_input(user: &str, channels: Vec<Channel>) -> UpsertSubscription {
    UpsertSubscription {
        tenant_id: "t1".to_string(),
        recipient: Recipient::User(user.to_string()),
        events: vec!["assigned".to_string()],
        channels,
        quiet_hours: None,
        timezone: None,
        digest: None,
        webhook_url: None,
    }
}

pub struct TestHarness {
    pub pool: SqlitePool,
    pub sender: Arc<FakeSender>,
    pub engine: DeliveryEngine,
}

impl TestHarness {
    /// Users `u1` and `u2` get email, SMS and push contacts in tenant `t1`.
    pub async fn new() -> Self {
        let pool = test_pool().await;
        let sender = Arc::new(FakeSender::default());
        let harness = Self {
            engine: Self::build_engine(&pool, &sender),
            pool,
            sender,
        };
        for user in ["u1", "u2"] {
            harness
                .add_contact(user, Channel::Email, &format!("{}@example.com", user))
                .await;
            harness.add_contact(user, Channel::Sms, "+15550100").await;
            harness
                .add_contact(user, Channel::Push, &format!("push-token-{}", user))
                .await;
        }
        harness
    }

    fn build_engine(pool: &SqlitePool, sender: &Arc<FakeSender>) -> DeliveryEngine {
        let s: Arc<dyn ChannelSender> = sender.clone();
        let channels = ChannelRegistry::new(
            s.clone(),
            s.clone(),
            s.clone(),
            s.clone(),
            s,
            Duration::from_secs(5),
        );
        DeliveryEngine::new(
            pool.clone(),
            Arc::new(channels),
            Arc::new(SqlDirectory::new(pool.clone())),
            DeliverySettings::from_config(&Config::default().delivery),
        )
    }

    /// Another worker over the same database and sender.
    pub fn second_engine(&self) -> DeliveryEngine {
        Self::build_engine(&self.pool, &self.sender)
    }

    pub async fn subscribe(&self, input: UpsertSubscription) -> Subscription {
        let input = input.normalized().unwrap();
        SubscriptionRepository::create(&self.pool, &input, at(9, 0))
            .await
            .unwrap()
    }

    pub async fn add_contact(&self, user: &str, channel: Channel, address: &str) {
        DirectoryRepository::upsert_contact(&self.pool, "t1", user, channel, address, at(9, 0))
            .await
            .unwrap();
    }

    pub async fn add_member(&self, group: &str, user: &str) {
        DirectoryRepository::add_group_member(&self.pool, "t1", group, user)
            .await
            .unwrap();
    }

    pub fn request(&self, user: &str, category: &str) -> CreateNotification {
        CreateNotification {
            tenant_id: "t1".to_string(),
            recipient_user_id: Some(user.to_string()),
            related_entity_type: Some("work_order".to_string()),
            related_entity_id: Some("wo-42".to_string()),
            category: category.to_string(),
            title: "Work order assigned".to_string(),
            message: "WO-42 was assigned to you".to_string(),
            ..Default::default()
        }
    }
}
