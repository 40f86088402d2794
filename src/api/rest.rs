// =============================================================================
// REST API Endpoints — Axum 0.8
// =============================================================================
//
// Everything lives under `/api/v1/`.  `health` is public; the run views need
// the `AdminAuth` extractor.  CORS is permissive so the dashboard can be
// served from any origin.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::api::auth::AdminAuth;
use crate::app_state::{build_timeline, AppState};

/// Build the REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/latest", get(latest))
        .route("/api/v1/signals", get(signals))
        .route("/api/v1/summary", get(summary))
        .route("/api/v1/timeline", get(timeline))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health())
}

/// Every row of the latest run.
async fn latest(_auth: AdminAuth, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.latest_rows())
}

/// Signaled rows of the latest run.
async fn signals(_auth: AdminAuth, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.latest_signals())
}

async fn summary(_auth: AdminAuth, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_summary())
}

// =============================================================================
// APY timeline (authenticated)
// =============================================================================

const DEFAULT_TIMELINE_HOURS: u32 = 72;
const DEFAULT_TIMELINE_WINDOW: usize = 24;

#[derive(Debug, Deserialize)]
struct TimelineQuery {
    hours: Option<u32>,
    window: Option<usize>,
}

async fn timeline(
    _auth: AdminAuth,
    State(state): State<Arc<AppState>>,
    Query(q): Query<TimelineQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let hours = q.hours.unwrap_or(DEFAULT_TIMELINE_HOURS);
    let window = q.window.unwrap_or(DEFAULT_TIMELINE_WINDOW);
    if window < 2 {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "window must be at least 2 rows" })),
        ));
    }

    let limit = state.runtime_config.history.history_pull_rows;
    let history = state.history.read_tail(limit).await.map_err(|e| {
        warn!(error = %e, "timeline history read failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "history unavailable" })),
        )
    })?;

    let since = Utc::now() - Duration::hours(hours as i64);
    Ok(Json(build_timeline(&history, since, window)))
}
