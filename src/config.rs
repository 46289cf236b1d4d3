use std::env;
use std::str::FromStr;

use serde::Deserialize;

use crate::services::backoff::MAX_BACKOFF_SECONDS;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub delivery: DeliveryConfig,
    pub sweeper: SweeperConfig,
    pub channels: ChannelsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origin for the management UI. Read from `CORS_ORIGIN`.
    pub cors_origin: Option<String>,
    /// Emit JSON log lines instead of the human-readable format (`LOG_FORMAT=json`).
    pub json_logs: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Total delivery attempts per (notification, subscription, channel), including the first.
    pub max_attempts: u32,
    /// Base delay in seconds; the delay after attempt `n` is `initial * 2^n`.
    pub initial_backoff_seconds: u64,
    /// Cap for exponential backoff (seconds).
    pub max_backoff_seconds: u64,
    /// Upper bound on a single channel sender call.
    pub send_timeout_seconds: u64,
    /// Claims older than this are treated as abandoned and can be taken over.
    pub claim_lease_seconds: u64,
    /// Maximum rows claimed per sweep tick.
    pub sweep_batch_size: u32,
    /// Maximum parallel deliveries within one dispatch or sweep.
    pub worker_concurrency: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweeperConfig {
    /// Whether the in-process sweep workers run. External schedulers can
    /// still trigger sweeps over HTTP when disabled.
    pub enabled: bool,
    pub retry_interval_seconds: u64,
    pub digest_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsConfig {
    /// HTTP relay that forwards email messages to SMTP.
    pub email_relay_url: Option<String>,
    pub email_from: Option<String>,
    pub sms_gateway_url: Option<String>,
    pub push_gateway_url: Option<String>,
    /// Bearer key sent to the email/SMS/push gateways.
    pub gateway_api_key: Option<String>,
    /// HMAC secret used to sign outgoing webhook bodies.
    pub webhook_signing_secret: Option<String>,
    /// Capacity of the in-app realtime broadcast buffer.
    pub in_app_buffer: usize,
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        Err(_) => Ok(default),
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        let config = Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or(defaults.server.host),
                port: env_or("PORT", defaults.server.port)?,
                cors_origin: env_opt("CORS_ORIGIN"),
                json_logs: env::var("LOG_FORMAT")
                    .map(|v| v.eq_ignore_ascii_case("json"))
                    .unwrap_or(false),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                )?,
            },
            delivery: DeliveryConfig {
                max_attempts: env_or("DELIVERY_MAX_ATTEMPTS", defaults.delivery.max_attempts)?,
                initial_backoff_seconds: env_or(
                    "DELIVERY_INITIAL_BACKOFF_SECONDS",
                    defaults.delivery.initial_backoff_seconds,
                )?,
                max_backoff_seconds: env_or(
                    "DELIVERY_MAX_BACKOFF_SECONDS",
                    defaults.delivery.max_backoff_seconds,
                )?,
                send_timeout_seconds: env_or(
                    "DELIVERY_SEND_TIMEOUT_SECONDS",
                    defaults.delivery.send_timeout_seconds,
                )?,
                claim_lease_seconds: env_or(
                    "DELIVERY_CLAIM_LEASE_SECONDS",
                    defaults.delivery.claim_lease_seconds,
                )?,
                sweep_batch_size: env_or(
                    "DELIVERY_SWEEP_BATCH_SIZE",
                    defaults.delivery.sweep_batch_size,
                )?,
                worker_concurrency: env_or(
                    "DELIVERY_WORKER_CONCURRENCY",
                    defaults.delivery.worker_concurrency,
                )?,
            },
            sweeper: SweeperConfig {
                enabled: env_flag("SWEEPER_ENABLED", defaults.sweeper.enabled),
                retry_interval_seconds: env_or(
                    "SWEEPER_RETRY_INTERVAL_SECONDS",
                    defaults.sweeper.retry_interval_seconds,
                )?,
                digest_interval_seconds: env_or(
                    "SWEEPER_DIGEST_INTERVAL_SECONDS",
                    defaults.sweeper.digest_interval_seconds,
                )?,
            },
            channels: ChannelsConfig {
                email_relay_url: env_opt("EMAIL_RELAY_URL"),
                email_from: env_opt("EMAIL_FROM"),
                sms_gateway_url: env_opt("SMS_GATEWAY_URL"),
                push_gateway_url: env_opt("PUSH_GATEWAY_URL"),
                gateway_api_key: env_opt("GATEWAY_API_KEY"),
                webhook_signing_secret: env_opt("WEBHOOK_SIGNING_SECRET"),
                in_app_buffer: env_or("IN_APP_BUFFER", defaults.channels.in_app_buffer)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delivery.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "DELIVERY_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.delivery.initial_backoff_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "DELIVERY_INITIAL_BACKOFF_SECONDS must be positive".to_string(),
            ));
        }
        if self.delivery.max_backoff_seconds < self.delivery.initial_backoff_seconds {
            return Err(ConfigError::InvalidValue(
                "DELIVERY_MAX_BACKOFF_SECONDS must not be below the initial backoff".to_string(),
            ));
        }
        if self.delivery.max_backoff_seconds > MAX_BACKOFF_SECONDS {
            return Err(ConfigError::InvalidValue(format!(
                "DELIVERY_MAX_BACKOFF_SECONDS must not exceed {}",
                MAX_BACKOFF_SECONDS
            )));
        }
        // Every retry gap up to the last attempt must grow, so the cap may
        // only be reached at the final step.
        let peak = 2u64
            .checked_pow(self.delivery.max_attempts)
            .and_then(|factor| self.delivery.initial_backoff_seconds.checked_mul(factor));
        if peak.map_or(true, |p| p > self.delivery.max_backoff_seconds) {
            return Err(ConfigError::InvalidValue(
                "DELIVERY_MAX_BACKOFF_SECONDS must be at least DELIVERY_INITIAL_BACKOFF_SECONDS * 2^DELIVERY_MAX_ATTEMPTS"
                    .to_string(),
            ));
        }
        if self.delivery.worker_concurrency == 0 || self.delivery.sweep_batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "DELIVERY_WORKER_CONCURRENCY and DELIVERY_SWEEP_BATCH_SIZE must be positive"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                cors_origin: None,
                json_logs: false,
            },
            database: DatabaseConfig {
                url: "sqlite://data/notifications.db".to_string(),
                max_connections: 5,
            },
            delivery: DeliveryConfig {
                max_attempts: 5,
                initial_backoff_seconds: 30,
                max_backoff_seconds: 3600,
                send_timeout_seconds: 10,
                claim_lease_seconds: 300,
                sweep_batch_size: 100,
                worker_concurrency: 10,
            },
            sweeper: SweeperConfig {
                enabled: true,
                retry_interval_seconds: 60,
                digest_interval_seconds: 60,
            },
            channels: ChannelsConfig {
                email_relay_url: None,
                email_from: None,
                sms_gateway_url: None,
                push_gateway_url: None,
                gateway_api_key: None,
                webhook_signing_secret: None,
                in_app_buffer: 256,
            },
        }
    }
}
