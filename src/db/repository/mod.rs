pub mod delivery_log_repository;
pub mod digest_queue_repository;
pub mod directory_repository;
pub mod notification_repository;
pub mod subscription_repository;

pub use delivery_log_repository::DeliveryLogRepository;
pub use digest_queue_repository::DigestQueueRepository;
pub use directory_repository::DirectoryRepository;
pub use notification_repository::NotificationRepository;
pub use subscription_repository::SubscriptionRepository;
