//! Minimal admin surface for the recipient directory: contact addresses per
//! channel and group membership.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::db::models::Channel;
use crate::db::DirectoryRepository;
use crate::error::{AppError, AppResult};
use crate::i18n;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/contacts", put(upsert_contact))
        .route(
            "/groups/:group/members",
            get(list_members).post(add_member),
        )
}

#[derive(Debug, Deserialize)]
pub struct UpsertContact {
    pub tenant_id: String,
    /// User id, or group id for a shared group address.
    pub recipient_id: String,
    pub channel: Channel,
    pub address: String,
}

#[derive(Debug, Deserialize)]
pub struct AddMember {
    pub tenant_id: String,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct TenantQuery {
    pub tenant_id: String,
}

async fn upsert_contact(
    State(state): State<Arc<AppState>>,
    Json(input): Json<UpsertContact>,
) -> AppResult<Json<serde_json::Value>> {
    if input.tenant_id.trim().is_empty() {
        return Err(AppError::Validation(i18n::t("validation.tenant_required")));
    }
    if input.recipient_id.trim().is_empty() {
        return Err(AppError::Validation(i18n::t("validation.recipient_required")));
    }
    if input.channel == Channel::InApp {
        return Err(AppError::Validation(
            "in_app deliveries need no contact address".to_string(),
        ));
    }
    if input.address.trim().is_empty() {
        return Err(AppError::Validation("address is required".to_string()));
    }

    let now = chrono::Utc::now().naive_utc();
    DirectoryRepository::upsert_contact(
        &state.db,
        input.tenant_id.trim(),
        input.recipient_id.trim(),
        input.channel,
        input.address.trim(),
        now,
    )
    .await?;
    tracing::debug!(
        "Stored {} contact for '{}' (tenant={})",
        input.channel,
        input.recipient_id,
        input.tenant_id
    );
    Ok(Json(json!({
        "tenant_id": input.tenant_id.trim(),
        "recipient_id": input.recipient_id.trim(),
        "channel": input.channel,
        "address": input.address.trim(),
    })))
}

async fn add_member(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
    Json(input): Json<AddMember>,
) -> AppResult<StatusCode> {
    if input.tenant_id.trim().is_empty() {
        return Err(AppError::Validation(i18n::t("validation.tenant_required")));
    }
    if input.user_id.trim().is_empty() {
        return Err(AppError::Validation(i18n::t("validation.recipient_required")));
    }
    DirectoryRepository::add_group_member(
        &state.db,
        input.tenant_id.trim(),
        &group,
        input.user_id.trim(),
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_members(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
    Query(query): Query<TenantQuery>,
) -> AppResult<Json<Vec<String>>> {
    let members = DirectoryRepository::list_group_members(&state.db, &query.tenant_id, &group).await?;
    Ok(Json(members))
}
