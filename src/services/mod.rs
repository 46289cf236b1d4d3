pub mod backoff;
pub mod channels;
pub mod directory;
pub mod engine;
pub mod init;
pub mod quiet_hours;
pub mod template;
