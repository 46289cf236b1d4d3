//! Database models, one file per table.

pub mod channel;
pub mod delivery_log;
pub mod digest_queue;
pub mod notification;
pub mod subscription;

pub use self::channel::*;
pub use self::delivery_log::*;
pub use self::digest_queue::*;
pub use self::notification::*;
pub use self::subscription::*;
