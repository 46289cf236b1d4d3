use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

use crate::db::models::{CreateNotification, DeliveryLogEntry, Notification};
use crate::db::{DeliveryLogRepository, NotificationRepository};
use crate::error::{AppError, AppResult};
use crate::i18n;
use crate::services::engine::DispatchReport;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_notification))
        .route("/stream", get(stream_in_app))
        .route("/:id", get(get_notification))
        .route("/:id/deliveries", get(list_deliveries))
}

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub group: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Create a notification and run the first routing pass.
async fn create_notification(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateNotification>,
) -> AppResult<(StatusCode, Json<DispatchReport>)> {
    let now = chrono::Utc::now().naive_utc();
    let report = state.engine.create_notification(request, now).await?;
    Ok((StatusCode::CREATED, Json(report)))
}

async fn get_notification(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<Notification>> {
    NotificationRepository::find_by_id(&state.db, &id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(i18n::t("not_found.notification")))
}

/// Full delivery audit trail of a notification.
async fn list_deliveries(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<Vec<DeliveryLogEntry>>> {
    if NotificationRepository::find_by_id(&state.db, &id).await?.is_none() {
        return Err(AppError::NotFound(i18n::t("not_found.notification")));
    }
    let entries = DeliveryLogRepository::list_for_notification(&state.db, &id).await?;
    Ok(Json(entries))
}

/// Server-sent events carrying in-app deliveries for one tenant, optionally
/// narrowed to a user or group.
async fn stream_in_app(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    if query.tenant_id.trim().is_empty() {
        return Err(AppError::Validation(i18n::t("validation.tenant_required")));
    }

    let rx = state.in_app.subscribe();
    tracing::debug!(
        "In-app stream opened (tenant={}, user={:?}, group={:?})",
        query.tenant_id,
        query.user_id,
        query.group
    );

    let events = stream::unfold((rx, query), |(mut rx, query)| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if !event.visible_to(
                        &query.tenant_id,
                        query.user_id.as_deref(),
                        query.group.as_deref(),
                    ) {
                        continue;
                    }
                    let sse = Event::default()
                        .event("notification")
                        .json_data(&event)
                        .unwrap_or_else(|_| Event::default().event("notification"));
                    return Some((Ok(sse), (rx, query)));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("In-app stream lagged, {} event(s) skipped", skipped);
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::db::models::Channel;
    use crate::db::DirectoryRepository;
    use crate::routes::test_helpers::{send_json, test_app};

    async fn subscribe_user(app: &Router, user: &str, channels: serde_json::Value) {
        let (status, _) = send_json(
            app,
            "POST",
            "/api/subscriptions",
            Some(json!({
                "tenant_id": "t1",
                "recipient": { "kind": "user", "id": user },
                "events": ["assigned"],
                "channels": channels,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn create_routes_and_returns_report() {
        let (app, state, fake) = test_app().await;
        DirectoryRepository::upsert_contact(
            &state.db,
            "t1",
            "u1",
            Channel::Email,
            "u1@example.com",
            chrono::Utc::now().naive_utc(),
        )
        .await
        .unwrap();
        subscribe_user(&app, "u1", json!(["email", "in_app"])).await;

        let (status, body) = send_json(
            &app,
            "POST",
            "/api/notifications",
            Some(json!({
                "tenant_id": "t1",
                "recipient_user_id": "u1",
                "category": "assigned",
                "severity": "critical",
                "title": "Chiller {{asset}} down",
                "message": "Assigned to you",
                "template_context": { "asset": "CH-2" }
            })),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["notification"]["title"], "Chiller CH-2 down");
        assert_eq!(body["notification"]["delivery_state"], "sent");
        assert_eq!(body["routes"].as_array().unwrap().len(), 2);
        assert_eq!(fake.calls().len(), 1);

        let id = body["notification"]["id"].as_str().unwrap().to_string();
        let (status, fetched) =
            send_json(&app, "GET", &format!("/api/notifications/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["severity"], "critical");

        let (status, log) =
            send_json(&app, "GET", &format!("/api/notifications/{}/deliveries", id), None).await;
        assert_eq!(status, StatusCode::OK);
        let log = log.as_array().unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|e| e["status"] == "sent"));
        assert!(log.iter().all(|e| e.get("claim_token").is_none()));
    }

    #[tokio::test]
    async fn unknown_notification_is_404() {
        let (app, _, _) = test_app().await;
        let (status, body) = send_json(&app, "GET", "/api/notifications/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");

        let (status, _) =
            send_json(&app, "GET", "/api/notifications/nope/deliveries", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_requires_tenant() {
        let (app, _, _) = test_app().await;
        let (status, body) = send_json(
            &app,
            "POST",
            "/api/notifications",
            Some(json!({ "tenant_id": "", "category": "assigned", "title": "x", "message": "y" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn in_app_delivery_reaches_hub_listeners() {
        let (app, state, _) = test_app().await;
        let mut rx = state.in_app.subscribe();
        subscribe_user(&app, "u7", json!(["in_app"])).await;

        let (status, _) = send_json(
            &app,
            "POST",
            "/api/notifications",
            Some(json!({
                "tenant_id": "t1",
                "recipient_user_id": "u7",
                "category": "assigned",
                "title": "PM due",
                "message": "AHU-3 filter change"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let event = rx.recv().await.unwrap();
        assert!(event.visible_to("t1", Some("u7"), None));
        assert_eq!(event.subject, "PM due");
    }

    #[tokio::test]
    async fn fan_out_across_subscriptions_and_channels() {
        let (app, _, fake) = test_app().await;
        for (channel, address) in [
            ("email", "u1@example.com"),
            ("sms", "+15550100"),
            ("push", "push-token-u1"),
        ] {
            let (status, _) = send_json(
                &app,
                "PUT",
                "/api/directory/contacts",
                Some(json!({
                    "tenant_id": "t1",
                    "recipient_id": "u1",
                    "channel": channel,
                    "address": address
                })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, _) = send_json(
            &app,
            "POST",
            "/api/directory/groups/technicians/members",
            Some(json!({ "tenant_id": "t1", "user_id": "u1" })),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        subscribe_user(&app, "u1", json!(["email", "sms"])).await;
        let (status, _) = send_json(
            &app,
            "POST",
            "/api/subscriptions",
            Some(json!({
                "tenant_id": "t1",
                "recipient": { "kind": "group", "id": "technicians" },
                "events": ["assigned"],
                "channels": ["email", "push"],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send_json(
            &app,
            "POST",
            "/api/notifications",
            Some(json!({
                "tenant_id": "t1",
                "recipient_user_id": "u1",
                "category": "assigned",
                "title": "WO-9 assigned",
                "message": "Replace belt on AHU-1"
            })),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        let routes = body["routes"].as_array().unwrap();
        assert_eq!(routes.len(), 4);
        assert!(routes.iter().all(|r| r["status"] == "sent"));
        assert_eq!(body["notification"]["delivery_state"], "sent");

        let mut targets: Vec<String> = fake.calls().into_iter().map(|(_, t, _)| t).collect();
        targets.sort();
        assert_eq!(
            targets,
            vec!["+15550100", "push-token-u1", "u1@example.com", "u1@example.com"]
        );
    }
}
