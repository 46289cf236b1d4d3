//! Manual sweep triggers, for external schedulers or when the in-process
//! sweepers are disabled. Safe to call concurrently with the workers.

use std::sync::Arc;

use axum::{extract::State, routing::post, Json, Router};

use crate::error::AppResult;
use crate::services::engine::SweepReport;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/retry", post(run_retry))
        .route("/digest", post(run_digest))
}

async fn run_retry(State(state): State<Arc<AppState>>) -> AppResult<Json<SweepReport>> {
    let now = chrono::Utc::now().naive_utc();
    let report = state.engine.run_retry_sweep(now).await?;
    Ok(Json(report))
}

async fn run_digest(State(state): State<Arc<AppState>>) -> AppResult<Json<SweepReport>> {
    let now = chrono::Utc::now().naive_utc();
    let report = state.engine.run_digest_sweep(now).await?;
    Ok(Json(report))
}
