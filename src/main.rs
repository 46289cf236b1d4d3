use std::sync::Arc;
use std::time::Duration;

use http::HeaderValue;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod db;
mod error;
mod i18n;
mod routes;
mod services;
#[cfg(test)]
mod test_support;

use config::Config;
use services::channels::{ChannelRegistry, InAppHub};
use services::directory::SqlDirectory;
use services::engine::{DeliveryEngine, DeliverySettings};
use services::init;

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub engine: Arc<DeliveryEngine>,
    pub in_app: InAppHub,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "fm_notifications=debug,tower_http=debug".into());
    if config.server.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!("Starting {}", i18n::t("app.name"));

    // Initialize database
    let pool = init::init_db(&config).await?;

    // Delivery engine
    let in_app = InAppHub::new(config.channels.in_app_buffer);
    let channels = ChannelRegistry::from_config(&config, in_app.clone())?;
    let engine = Arc::new(DeliveryEngine::new(
        pool.clone(),
        Arc::new(channels),
        Arc::new(SqlDirectory::new(pool.clone())),
        DeliverySettings::from_config(&config.delivery),
    ));

    let app_state = Arc::new(AppState {
        db: pool,
        config: config.clone(),
        engine: engine.clone(),
        in_app,
    });

    // Create shutdown notifier for background workers
    let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let bg_handles = init::spawn_background_workers(engine, &config.sweeper, shutdown_tx.clone());

    // Build router
    let mut app = routes::app(app_state).layer(TraceLayer::new_for_http());
    if let Some(origin) = config.server.cors_origin.as_deref() {
        let origin = origin
            .parse::<HeaderValue>()
            .map_err(|e| anyhow::anyhow!("Invalid CORS_ORIGIN '{}': {}", origin, e))?;
        app = app.layer(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods([
                    http::Method::GET,
                    http::Method::POST,
                    http::Method::PUT,
                    http::Method::DELETE,
                    http::Method::OPTIONS,
                ])
                .allow_headers([http::header::CONTENT_TYPE, http::header::ACCEPT]),
        );
    }

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Server listening on {}", addr);

    // The server future is dropped when a shutdown signal arrives; workers are
    // notified through the broadcast channel.
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server_fut = axum::serve(listener, app.into_make_service());

    let shutdown_tx_clone = shutdown_tx.clone();
    let signal_fut = async move {
        wait_for_signal().await;
        tracing::info!("Shutdown signal received, notifying background workers");
        let _ = shutdown_tx_clone.send(());
    };

    tokio::select! {
        res = server_fut => {
            if let Err(e) = res {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = signal_fut => {
            tracing::info!("Signal handler completed; server stopped accepting connections");
        }
    }

    // Claimed work that is interrupted here is picked up again once its lease expires.
    let shutdown_wait = Duration::from_secs(15);
    tracing::info!(
        "Waiting up to {}s for background workers to exit",
        shutdown_wait.as_secs()
    );
    let bg_wait = async {
        for h in bg_handles {
            let _ = h.await;
        }
    };
    if tokio::time::timeout(shutdown_wait, bg_wait).await.is_err() {
        tracing::warn!("Background workers did not exit in time");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("Failed to bind SIGTERM: {}", e);
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
