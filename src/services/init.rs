//! Startup helpers:
//! - database connection + migrations
//! - periodic retry / digest sweep workers

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{Config, SweeperConfig};
use crate::error::AppResult;
use crate::services::engine::{DeliveryEngine, SweepReport};

/// Redact credentials from a database URL before logging.
///
/// Only a URL with a host is rebuilt from its parts (scheme, host, port,
/// path). Anything else, such as `user:pw@somewhere`, which parses with
/// `user` as its scheme, loses everything up to the last '@'.
pub fn redact_db_url(db_url: &str) -> String {
    if let Ok(url) = url::Url::parse(db_url) {
        if let Some(host) = url.host_str().filter(|h| !h.is_empty()) {
            let port_part = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
            return format!("{}://{}{}{}", url.scheme(), host, port_part, url.path());
        }
    }
    match db_url.rfind('@') {
        Some(at_pos) => format!("(redacted){}", &db_url[at_pos + 1..]),
        None => db_url.to_string(),
    }
}

/// Open the SQLite pool (creating the file and its directory when needed)
/// and run migrations.
pub async fn init_db(config: &Config) -> Result<sqlx::SqlitePool> {
    let db_url = &config.database.url;
    tracing::info!("Connecting to database: {}", redact_db_url(db_url));

    let in_memory = db_url.contains(":memory:");
    if !in_memory {
        let db_path = db_url
            .strip_prefix("sqlite://")
            .or_else(|| db_url.strip_prefix("sqlite:"))
            .unwrap_or(db_url);
        let db_path = db_path.split('?').next().unwrap_or(db_path);
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    anyhow::anyhow!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    )
                })?;
            }
        }
    }

    let connect_options =
        sqlx::sqlite::SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);

    let mut pool_options =
        sqlx::sqlite::SqlitePoolOptions::new().max_connections(config.database.max_connections);
    if in_memory {
        // Every connection to :memory: is a separate database.
        pool_options = pool_options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }
    let pool = pool_options.connect_with(connect_options).await?;

    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Spawn the retry and digest sweep loops.
///
/// Each loop runs one sweep, then sleeps for its interval or exits when the
/// shutdown broadcast fires. Returns the handles so callers can await exit.
pub fn spawn_background_workers(
    engine: Arc<DeliveryEngine>,
    sweeper: &SweeperConfig,
    shutdown: broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    if !sweeper.enabled {
        tracing::info!("Background sweepers disabled; sweeps run only via the HTTP trigger");
        return Vec::new();
    }

    vec![
        spawn_sweep_loop(
            "retry",
            Duration::from_secs(sweeper.retry_interval_seconds.max(1)),
            shutdown.subscribe(),
            {
                let engine = engine.clone();
                move |now| {
                    let engine = engine.clone();
                    async move { engine.run_retry_sweep(now).await }
                }
            },
        ),
        spawn_sweep_loop(
            "digest",
            Duration::from_secs(sweeper.digest_interval_seconds.max(1)),
            shutdown.subscribe(),
            move |now| {
                let engine = engine.clone();
                async move { engine.run_digest_sweep(now).await }
            },
        ),
    ]
}

fn spawn_sweep_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
    sweep: F,
) -> JoinHandle<()>
where
    F: Fn(chrono::NaiveDateTime) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = AppResult<SweepReport>> + Send + 'static,
{
    tokio::spawn(async move {
        tracing::info!("Starting {} sweeper (every {}s)", name, interval.as_secs());
        loop {
            if shutdown_rx.try_recv().is_ok() {
                tracing::info!("{} sweeper received shutdown signal", name);
                break;
            }

            let now = chrono::Utc::now().naive_utc();
            match sweep(now).await {
                Ok(report) if report.claimed > 0 => {
                    tracing::debug!("{} sweep processed {} item(s)", name, report.claimed);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("{} sweep failed: {:?}", name, e),
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("{} sweeper shutting down", name);
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    })
}
