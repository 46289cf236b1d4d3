use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::db::models::{Subscription, UpsertSubscription};
use crate::db::SubscriptionRepository;
use crate::error::{AppError, AppResult};
use crate::i18n;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_subscriptions).post(create_subscription))
        .route(
            "/:id",
            get(get_subscription)
                .put(update_subscription)
                .delete(delete_subscription),
        )
}

/// Tenant scope for list, get and delete.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub tenant_id: String,
}

/// Normalize and check a subscription body before it reaches the store.
fn validate(input: UpsertSubscription) -> AppResult<UpsertSubscription> {
    if input.tenant_id.trim().is_empty() {
        return Err(AppError::Validation(i18n::t("validation.tenant_required")));
    }
    let mut input = input.normalized().map_err(AppError::Validation)?;
    input.tenant_id = input.tenant_id.trim().to_string();

    if let Some(tz) = input.timezone.as_deref() {
        if tz.parse::<chrono_tz::Tz>().is_err() {
            return Err(AppError::Validation(format!("unknown timezone '{}'", tz)));
        }
    }
    if let Some(raw) = input.webhook_url.as_deref() {
        let ok = url::Url::parse(raw)
            .map(|u| matches!(u.scheme(), "http" | "https"))
            .unwrap_or(false);
        if !ok {
            return Err(AppError::Validation(format!("invalid webhook url '{}'", raw)));
        }
    }
    Ok(input)
}

async fn create_subscription(
    State(state): State<Arc<AppState>>,
    Json(input): Json<UpsertSubscription>,
) -> AppResult<(StatusCode, Json<Subscription>)> {
    let input = validate(input)?;
    let now = chrono::Utc::now().naive_utc();
    let subscription = SubscriptionRepository::create(&state.db, &input, now).await?;
    tracing::info!(
        "Created subscription {} for {} '{}' (tenant={})",
        subscription.id,
        input.recipient.kind_str(),
        input.recipient.id(),
        subscription.tenant_id
    );
    Ok((StatusCode::CREATED, Json(subscription)))
}

async fn list_subscriptions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<Subscription>>> {
    let subscriptions = SubscriptionRepository::list_by_tenant(&state.db, &query.tenant_id).await?;
    Ok(Json(subscriptions))
}

async fn get_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Subscription>> {
    SubscriptionRepository::find_in_tenant(&state.db, &query.tenant_id, &id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(i18n::t("not_found.subscription")))
}

/// Replace a subscription. Existing delivery history is left untouched.
async fn update_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(input): Json<UpsertSubscription>,
) -> AppResult<Json<Subscription>> {
    let input = validate(input)?;
    let now = chrono::Utc::now().naive_utc();
    SubscriptionRepository::update(&state.db, &id, &input, now)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(i18n::t("not_found.subscription")))
}

async fn delete_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<serde_json::Value>> {
    if !SubscriptionRepository::delete(&state.db, &query.tenant_id, &id).await? {
        return Err(AppError::NotFound(i18n::t("not_found.subscription")));
    }
    tracing::info!("Deleted subscription {}", id);
    Ok(Json(json!({ "message": i18n::t("subscription.deleted") })))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::routes::test_helpers::{send_json, test_app};

    fn body(user: &str) -> serde_json::Value {
        json!({
            "tenant_id": "t1",
            "recipient": { "kind": "user", "id": user },
            "events": ["assigned", "assigned", "overdue"],
            "channels": ["sms", "email", "sms"],
            "quiet_hours": { "start": "22:00", "end": "07:00" },
            "timezone": "Europe/Berlin",
            "digest": { "enabled": true, "frequency": "hourly" }
        })
    }

    #[tokio::test]
    async fn crud_roundtrip() {
        let (app, _, _) = test_app().await;

        let (status, created) = send_json(&app, "POST", "/api/subscriptions", Some(body("u1"))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["channels"], json!(["sms", "email"]));
        assert_eq!(created["events"], json!(["assigned", "overdue"]));
        assert_eq!(created["quiet_hours_start"], "22:00");
        assert_eq!(created["digest_frequency"], "hourly");
        let id = created["id"].as_str().unwrap().to_string();

        let (status, list) = send_json(&app, "GET", "/api/subscriptions?tenant_id=t1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);

        let mut updated = body("u1");
        updated["channels"] = json!(["push"]);
        let (status, after) =
            send_json(&app, "PUT", &format!("/api/subscriptions/{}", id), Some(updated)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(after["channels"], json!(["push"]));

        let uri = format!("/api/subscriptions/{}?tenant_id=t1", id);
        let (status, fetched) = send_json(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["channels"], json!(["push"]));

        let (status, _) = send_json(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send_json(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send_json(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rejects_invalid_bodies() {
        let (app, _, _) = test_app().await;

        let mut no_channels = body("u1");
        no_channels["channels"] = json!([]);
        let (status, _) = send_json(&app, "POST", "/api/subscriptions", Some(no_channels)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let mut bad_tz = body("u1");
        bad_tz["timezone"] = json!("Mars/Olympus");
        let (status, _) = send_json(&app, "POST", "/api/subscriptions", Some(bad_tz)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let mut bad_hook = body("u1");
        bad_hook["webhook_url"] = json!("ftp://example.com/hook");
        let (status, _) = send_json(&app, "POST", "/api/subscriptions", Some(bad_hook)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn duplicate_recipient_is_conflict() {
        let (app, _, _) = test_app().await;
        let (status, _) = send_json(&app, "POST", "/api/subscriptions", Some(body("u1"))).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, err) = send_json(&app, "POST", "/api/subscriptions", Some(body("u1"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["error"]["code"], "CONFLICT");
    }

    #[tokio::test]
    async fn other_tenants_cannot_read_or_delete() {
        let (app, _, _) = test_app().await;
        let (_, created) = send_json(&app, "POST", "/api/subscriptions", Some(body("u1"))).await;
        let id = created["id"].as_str().unwrap().to_string();

        let foreign = format!("/api/subscriptions/{}?tenant_id=t2", id);
        let (status, _) = send_json(&app, "GET", &foreign, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send_json(&app, "DELETE", &foreign, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let own = format!("/api/subscriptions/{}?tenant_id=t1", id);
        let (status, _) = send_json(&app, "GET", &own, None).await;
        assert_eq!(status, StatusCode::OK);
    }
}
