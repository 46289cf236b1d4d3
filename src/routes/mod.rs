use std::sync::Arc;

use axum::{routing::get, Router};

use crate::AppState;

pub mod directory;
pub mod health;
pub mod notifications;
pub mod subscriptions;
pub mod sweeps;

/// All API routes with shared state applied. Transport layers (tracing,
/// CORS) are added by the caller.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api/notifications", notifications::router())
        .nest("/api/subscriptions", subscriptions::router())
        .nest("/api/sweeps", sweeps::router())
        .nest("/api/directory", directory::router())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::services::channels::{ChannelRegistry, ChannelSender, InAppHub, InAppSender};
    use crate::services::directory::SqlDirectory;
    use crate::services::engine::{DeliveryEngine, DeliverySettings};
    use crate::test_support::{test_pool, FakeSender};
    use crate::AppState;

    /// Router over an in-memory database. Every channel except in-app goes to
    /// the returned fake sender.
    pub async fn test_app() -> (Router, Arc<AppState>, Arc<FakeSender>) {
        let pool = test_pool().await;
        let config = Config::default();
        let hub = InAppHub::new(16);
        let fake = Arc::new(FakeSender::default());
        let s: Arc<dyn ChannelSender> = fake.clone();
        let channels = ChannelRegistry::new(
            s.clone(),
            s.clone(),
            s.clone(),
            s,
            Arc::new(InAppSender::new(hub.clone())),
            std::time::Duration::from_secs(5),
        );
        let engine = DeliveryEngine::new(
            pool.clone(),
            Arc::new(channels),
            Arc::new(SqlDirectory::new(pool.clone())),
            DeliverySettings::from_config(&config.delivery),
        );
        let state = Arc::new(AppState {
            db: pool,
            config,
            engine: Arc::new(engine),
            in_app: hub,
        });
        (super::app(state.clone()), state, fake)
    }

    pub async fn send_json(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(v) => builder.body(Body::from(v.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }
}
